use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use serenity::model::id::UserId;
use serenity::model::user::User;

pub const UNKNOWN_TRACK_TITLE: &str = "UNKNOWN TRACK";

/// Who asked for a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requester {
    pub id: UserId,
    pub name: String,
}

impl From<&User> for Requester {
    fn from(user: &User) -> Self {
        Requester {
            id: user.id,
            name: user.tag(),
        }
    }
}

impl Display for Requester {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Metadata of a queued track.
///
/// `url` is the page the stream gets re-extracted from right before playback,
/// never the stream URL itself (those expire while the track sits in the queue).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackInfo {
    pub url: String,
    pub title: String,
    pub requester: Requester,
    pub duration: Option<Duration>,
}

impl TrackInfo {
    /// `mm:ss`, or `h:mm:ss` for anything an hour or longer.
    pub fn duration_text(&self) -> Option<String> {
        let seconds = self.duration?.as_secs();
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        let display_seconds = seconds % 60;

        if hours > 0 {
            Some(format!("{hours}:{minutes:0>2}:{display_seconds:0>2}"))
        } else {
            Some(format!("{minutes}:{display_seconds:0>2}"))
        }
    }
}
