use std::sync::Arc;

use serenity::client::Context;
use serenity::framework::standard::{
    Args, CommandResult,
    macros::{command, group, hook},
};
use serenity::model::channel::{Message, ReactionType::Unicode};
use serenity::model::guild::Guild;
use serenity::model::id::{ChannelId, GuildId};
use serenity::prelude::TypeMapKey;
use songbird::input::Input;
use songbird::Songbird;
use tracing::{error, info, warn};

use crate::chat::{check_msg, TextChannel};
use crate::error::MusicError;
use crate::models::{Requester, TrackInfo};
use crate::registry::SessionRegistry;
use crate::resolver::{SourceResolver, YtDlpResolver};
use crate::session::{PlaybackSession, Position, SessionParts};
use crate::voice::SongbirdConnection;

pub type GuildSessions = SessionRegistry<Input>;

pub struct Sessions;

impl TypeMapKey for Sessions {
    type Value = GuildSessions;
}

pub struct Resolver;

impl TypeMapKey for Resolver {
    type Value = Arc<YtDlpResolver>;
}

const QUEUE_PAGE_SIZE: usize = 15;

#[group]
#[commands(join, play, play_next, pause, resume, skip, remove, shuffle, loop_queue, loop_song, queue, now_playing, volume, disconnect, ping, help)]
pub struct General;

#[command]
#[only_in(guilds)]
#[aliases("connect")]
async fn join(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let channel_id = args.single::<u64>().ok().map(ChannelId);

    join_voice(ctx, msg, channel_id).await?;
    react(ctx, msg, "👍").await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    play_with_reaction(ctx, msg, args, Position::Back).await
}

#[command]
#[only_in(guilds)]
#[aliases("pn", "playnext")]
async fn play_next(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    play_with_reaction(ctx, msg, args, Position::Front).await
}

async fn play_with_reaction(ctx: &Context, msg: &Message, args: Args, position: Position) -> CommandResult {
    let query = args.rest().trim();

    if query.is_empty() {
        return Err(MusicError::Usage("play <url or search>").into());
    }

    info!("User input is {query}");

    let loading_emoji = Unicode("⏳".to_string());

    react(ctx, msg, "⏳").await;

    let play_result = enqueue(ctx, msg, query, position).await;

    let bot_id = ctx.cache.current_user_id();
    if let Err(why) = msg.channel_id.delete_reaction(&ctx.http, msg.id, Some(bot_id), loading_emoji).await {
        warn!("Could not remove the loading reaction: {why:?}");
    }

    let answer_emoji = match play_result {
        Ok(_) => "👍",
        Err(_) => "💀",
    };

    react(ctx, msg, answer_emoji).await;

    play_result?;

    Ok(())
}

async fn enqueue(ctx: &Context, msg: &Message, query: &str, position: Position) -> Result<(), MusicError> {
    let guild_id = join_voice(ctx, msg, None).await?;
    let resolver = resolver(ctx).await?;

    let tracks = resolver.search(query, &Requester::from(&msg.author)).await?;
    let first_title = tracks.first().map(|track| track.title.clone()).unwrap_or_default();

    let parts = session_parts(ctx, msg, guild_id).await?;
    let (_, added) = sessions(ctx).await?.enqueue(guild_id, tracks, position, move || parts);

    info!("Queued {added} tracks in guild {}", guild_id.0);

    check_msg(msg.channel_id.say(&ctx.http, added_message(&first_title, added)).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let session = player(ctx, msg).await?;

    if session.pause().await? {
        check_msg(msg.channel_id.say(&ctx.http, format!("**`{}`**: Paused the song!", msg.author.tag())).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("unpause")]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let session = player(ctx, msg).await?;

    if session.resume().await? {
        check_msg(msg.channel_id.say(&ctx.http, format!("**`{}`**: Resumed the song!", msg.author.tag())).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("next", "goto")]
async fn skip(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let session = player(ctx, msg).await?;

    let skipped = if args.is_empty() {
        session.skip().await?
    } else {
        let position = args.single::<usize>().map_err(|_| MusicError::Usage("skip [position]"))?;
        session.skip_to(to_index(position, session.len())?).await?
    };

    if skipped {
        check_msg(msg.channel_id.say(&ctx.http, format!("**`{}`**: Skipped the song!", msg.author.tag())).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("rm", "delete")]
async fn remove(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let position = args.single::<usize>().map_err(|_| MusicError::Usage("remove <position>"))?;
    let session = player(ctx, msg).await?;

    let removed = session.remove(to_index(position, session.len())?)?;

    check_msg(msg.channel_id.say(&ctx.http, format!("Removed `{}` from the queue.", removed.title)).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn shuffle(ctx: &Context, msg: &Message) -> CommandResult {
    let session = player(ctx, msg).await?;

    info!("Shuffling the queue of guild {}", session.guild_id().0);
    session.shuffle();

    react(ctx, msg, "👍").await;

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("loop", "qloop", "loopq", "loopqueue")]
async fn loop_queue(ctx: &Context, msg: &Message) -> CommandResult {
    let session = player(ctx, msg).await?;
    let enabled = session.toggle_loop_queue();

    check_msg(msg.channel_id.say(&ctx.http, format!("Looping queue **{}**!", enabled_text(enabled))).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("sloop", "loops", "loopsong")]
async fn loop_song(ctx: &Context, msg: &Message) -> CommandResult {
    let session = player(ctx, msg).await?;
    let enabled = session.toggle_loop_song();

    check_msg(msg.channel_id.say(&ctx.http, format!("Looping song **{}**!", enabled_text(enabled))).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("q", "playlist")]
async fn queue(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let session = player(ctx, msg).await?;
    let total = session.len();

    if total == 0 {
        check_msg(msg.channel_id.say(&ctx.http, "There are currently no more queued songs.").await);

        return Ok(());
    }

    let page = if args.is_empty() {
        1
    } else {
        args.single::<usize>().map_err(|_| MusicError::Usage("queue [page]"))?
    };

    let pages = (total + QUEUE_PAGE_SIZE - 1) / QUEUE_PAGE_SIZE;

    if page == 0 || page > pages {
        return Err(MusicError::PageOutOfRange { page, pages }.into());
    }

    let start = (page - 1) * QUEUE_PAGE_SIZE;
    let upcoming = session.peek_page(QUEUE_PAGE_SIZE, start);

    check_msg(msg.channel_id.say(&ctx.http, queue_page(&upcoming, start, total)).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("np", "nowplaying", "current", "playing")]
async fn now_playing(ctx: &Context, msg: &Message) -> CommandResult {
    let session = player(ctx, msg).await?;
    let now = session.now_playing();
    let track = now.track.ok_or(MusicError::NotPlaying)?;

    let message = format!(
        "**Now Playing:** `{}` requested by `{}`.\nLooping song: {}. Looping queue: {}. Volume: {:.0}%.",
        track.title,
        track.requester,
        now.loop_song,
        now.loop_queue,
        now.volume * 100.0,
    );

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("vol")]
async fn volume(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let percent = args.single::<f32>().map_err(|_| MusicError::Usage("volume <1-100>"))?;
    let session = player(ctx, msg).await?;

    session.set_volume(percent).await?;

    check_msg(msg.channel_id.say(&ctx.http, format!("**`{}`**: Set the volume to **{percent}%**", msg.author.tag())).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("dc", "stop", "leave", "bye")]
async fn disconnect(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(msg)?;

    if let Some(session) = sessions(ctx).await?.remove(guild_id) {
        info!("Destroyed the player of guild {}", session.guild_id().0);
    }

    let manager = songbird_manager(ctx).await?;

    if manager.get(guild_id).is_some() {
        if let Err(e) = manager.remove(guild_id).await {
            check_msg(msg.channel_id.say(&ctx.http, format!("Failed: {e:?}")).await);
        }

        check_msg(msg.channel_id.say(&ctx.http, "Left voice channel").await);
    } else {
        check_msg(msg.reply(ctx, "Not in a voice channel").await);
    }

    Ok(())
}

#[command]
async fn ping(ctx: &Context, msg: &Message) -> CommandResult {
    check_msg(msg.channel_id.say(&ctx.http, "Pong!").await);

    Ok(())
}

#[command]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let message = r#"
**Commands:**
    **join [CHANNEL ID]** - Joins your voice channel (or the given one).
    **play [URL|Title]** - Adds tracks to the queue given a URL, a playlist URL or a video title.
    **pn [URL|Title]** - Adds tracks to the top of the queue to be played next.
    **pause** - Pauses the current track.
    **resume** - Resumes the currently paused track.
    **skip [POSITION]** - Skips the current track, or jumps to a track of the queue (discarding the ones before it).
    **remove [POSITION]** - Removes a track from the queue.
    **shuffle** - Reorders the queue randomly.
    **loop** - Sends finished tracks back to the end of the queue.
    **loop_song** - Repeats the current track.
    **queue [PAGE]** - Shows the queue of tracks.
    **now_playing** - Shows the current track and loop settings.
    **volume [1-100]** - Sets the volume.
    **disconnect** - Clears the queue and leaves the voice channel.
    "#;

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

#[hook]
pub async fn after(ctx: &Context, msg: &Message, command_name: &str, command_result: CommandResult) {
    let Err(why) = command_result else {
        return;
    };

    let reply = match why.downcast_ref::<MusicError>() {
        Some(music_error) if music_error.is_user_error() => {
            info!("Command '{command_name}' rejected: {music_error}");
            music_error.to_string()
        }
        _ => {
            error!("Command '{command_name}' failed: {why:?}");
            format!("Error: {why}")
        }
    };

    check_msg(msg.channel_id.say(&ctx.http, reply).await);
}

#[hook]
pub async fn unknown_command(ctx: &Context, msg: &Message, unknown_command_name: &str) {
    info!("Unknown command {unknown_command_name}");

    check_msg(msg.channel_id.say(&ctx.http, "invalid command!").await);
}

/// Joins `channel_id`, or the author's voice channel, and deafens.
async fn join_voice(ctx: &Context, msg: &Message, channel_id: Option<ChannelId>) -> Result<GuildId, MusicError> {
    let guild = get_guild(ctx, msg)?;

    let connect_to = channel_id
        .or_else(|| guild.voice_states.get(&msg.author.id).and_then(|voice_state| voice_state.channel_id))
        .ok_or(MusicError::InvalidChannel)?;

    let manager = songbird_manager(ctx).await?;

    let (handler_lock, join_result) = manager.join(guild.id, connect_to).await;
    join_result?;

    let mut handler = handler_lock.lock().await;

    if handler.is_deaf() {
        info!("Already deafen!")
    } else if let Err(e) = handler.deafen(true).await {
        info!("Deafen failed due to {e:?}")
    }

    Ok(guild.id)
}

/// The guild's player, for commands that need the bot to already be in voice.
async fn player(ctx: &Context, msg: &Message) -> Result<Arc<PlaybackSession<Input>>, MusicError> {
    let guild_id = get_guild_id(msg)?;

    if songbird_manager(ctx).await?.get(guild_id).is_none() {
        return Err(MusicError::NotConnected);
    }

    session_for(ctx, msg, guild_id).await
}

async fn session_for(ctx: &Context, msg: &Message, guild_id: GuildId) -> Result<Arc<PlaybackSession<Input>>, MusicError> {
    let parts = session_parts(ctx, msg, guild_id).await?;

    Ok(sessions(ctx).await?.get_or_create(guild_id, move || parts))
}

/// What a new player for `guild_id` would talk to; it reports in the channel of `msg`.
async fn session_parts(ctx: &Context, msg: &Message, guild_id: GuildId) -> Result<SessionParts<Input>, MusicError> {
    Ok(SessionParts {
        resolver: resolver(ctx).await?,
        connection: Arc::new(SongbirdConnection::new(songbird_manager(ctx).await?, guild_id)),
        channel: Arc::new(TextChannel::new(Arc::clone(&ctx.http), msg.channel_id)),
    })
}

async fn sessions(ctx: &Context) -> Result<GuildSessions, MusicError> {
    let data = ctx.data.read().await;

    data.get::<Sessions>().cloned().ok_or(MusicError::Unavailable)
}

async fn resolver(ctx: &Context) -> Result<Arc<YtDlpResolver>, MusicError> {
    let data = ctx.data.read().await;

    data.get::<Resolver>().cloned().ok_or(MusicError::Unavailable)
}

async fn songbird_manager(ctx: &Context) -> Result<Arc<Songbird>, MusicError> {
    songbird::get(ctx).await.ok_or(MusicError::Unavailable)
}

async fn react(ctx: &Context, msg: &Message, emoji: &str) {
    if let Err(why) = msg.react(&ctx.http, Unicode(emoji.to_string())).await {
        warn!("Could not react to message: {why:?}");
    }
}

fn get_guild(ctx: &Context, msg: &Message) -> Result<Guild, MusicError> {
    msg.guild(&ctx.cache).ok_or(MusicError::Unavailable)
}

fn get_guild_id(msg: &Message) -> Result<GuildId, MusicError> {
    msg.guild_id.ok_or(MusicError::Unavailable)
}

/// Converts a position shown to users (1-based) into a queue index.
fn to_index(position: usize, len: usize) -> Result<usize, MusicError> {
    position.checked_sub(1).ok_or(MusicError::IndexOutOfRange { position, len })
}

fn enabled_text(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

fn added_message(first_title: &str, added: usize) -> String {
    let message = if added == 1 {
        format!("[Added {first_title} to the Queue.]")
    } else {
        format!("[Added {first_title} to the Queue.({added} songs)]")
    };

    format!("```ini\n{message}\n```")
}

fn queue_page(upcoming: &[Arc<TrackInfo>], start: usize, total: usize) -> String {
    let songs_formatted = upcoming
        .iter()
        .enumerate()
        .map(|(offset, song)| {
            let song_index = start + offset + 1;

            match song.duration_text() {
                Some(duration) => format!("{song_index} - {} ({duration})", song.title),
                None => format!("{song_index} - {}", song.title),
            }
        })
        .collect::<Vec<String>>()
        .join("\n");

    format!("**Next {} songs (out of {total})**:\n```{songs_formatted}```", upcoming.len())
}
