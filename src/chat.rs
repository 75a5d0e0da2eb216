use std::sync::Arc;

use serenity::async_trait;
use serenity::http::Http;
use serenity::model::channel::Message;
use serenity::model::id::ChannelId;
use serenity::Result as SerenityResult;
use tracing::warn;

/// Where a session posts its notices.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// Best effort: failures are logged, never returned.
    async fn send(&self, text: &str);
}

/// The text channel a session was started from.
pub struct TextChannel {
    http: Arc<Http>,
    channel_id: ChannelId,
}

impl TextChannel {
    pub fn new(http: Arc<Http>, channel_id: ChannelId) -> Self {
        TextChannel { http, channel_id }
    }
}

#[async_trait]
impl ChatChannel for TextChannel {
    async fn send(&self, text: &str) {
        check_msg(self.channel_id.say(&self.http, text).await);
    }
}

/// Checks that a message successfully sent; if not, then logs why.
pub fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        warn!("Error sending message: {why:?}");
    }
}
