use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    framework::StandardFramework,
    model::gateway::Ready,
    model::prelude::VoiceState,
    prelude::GatewayIntents,
};
use songbird::SerenityInit;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::{GuildSessions, Resolver, Sessions, GENERAL_GROUP};
use crate::config::Config;
use crate::resolver::YtDlpResolver;

mod chat;
mod commands;
mod config;
mod error;
mod models;
mod registry;
mod resolver;
mod session;
mod voice;

#[cfg(test)]
mod testing;

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        for guild in &ready.guilds {
            info!("- {}", guild.id.0);
        }
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        if new.channel_id.is_some() || new.user_id != ctx.cache.current_user_id() {
            return;
        }

        let Some(guild_id) = new.guild_id else {
            return;
        };

        info!("Disconnected from voice in guild {}", guild_id.0);

        let sessions = ctx.data.read().await.get::<Sessions>().cloned();

        if let Some(session) = sessions.and_then(|sessions| sessions.remove(guild_id)) {
            info!("Destroyed the player of guild {}", session.guild_id().0);
        }
    }
}

/// Logs to stdout, and appends warnings and errors to `error_log`.
fn init_tracing(error_log: &Path) -> io::Result<()> {
    let log_file = OpenOptions::new().create(true).append(true).open(error_log)?;

    let stdout = fmt::layer().with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let errors = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(log_file))
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry().with(stdout).with(errors).init();

    Ok(())
}

#[tokio::main]
async fn main() {
    // The environment alone is enough, .env is optional.
    dotenv().ok();

    let config = Config::from_env().expect("Invalid configuration");

    init_tracing(&config.error_log).expect("Could not open the error log");

    let framework = StandardFramework::new()
        .configure(|c| c.prefix(config.prefix.as_str()))
        .after(commands::after)
        .unrecognised_command(commands::unknown_command)
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&config.token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird()
        .await
        .expect("Err creating client");

    let sessions = GuildSessions::new(config.session.clone());

    {
        let mut data = client.data.write().await;

        data.insert::<Sessions>(sessions.clone());
        data.insert::<Resolver>(Arc::new(YtDlpResolver::new(config.ytdlp_program.clone())));
    }

    tokio::spawn(async move {
        let _ = client.start().await.map_err(|why| info!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c().await.expect("Control-C interruption failed!");

    info!("Received Ctrl-C, shutting down.");

    sessions.shutdown_all();
}
