use std::cmp::min;
use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, EventHandler},
    framework::{
        standard::{
            Args, CommandResult,
            macros::{command, group},
        },
        StandardFramework,
    },
    model::{channel::Message, gateway::Ready},
    prelude::GatewayIntents,
    Result as SerenityResult,
};
use serenity::client::Context;
use serenity::framework::standard::CommandError;
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::guild::{Guild, UnavailableGuild};
use serenity::model::id::UserId;
use serenity::model::prelude::{GuildId, VoiceState};
use songbird::{SerenityInit, Songbird};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::fetcher::YtDlpFetcher;
use crate::metrics::{Counter, Metrics, MetricsSink};
use crate::models::{ChannelRef, PlayerState, TenantId};
use crate::player::{PlayerDeps, PlayerHandle};
use crate::playlists::{is_song_in_playlist, split_playlist_keyword, YtDlpLookup};
use crate::presence::PresenceMonitor;
use crate::registry::Registry;
use crate::source::AudioPipeline;
use crate::store::{JsonPlaylistStore, MemoryPlaylistStore};
use crate::streamer::FrameStreamer;
use crate::traits::{PlaylistStore, SongLookup, TenantEvents};
use crate::voice::{status_activity, CachePresence, ChannelNotifier, SongbirdTransport};

mod buffer;
mod cache;
mod config;
mod error;
mod fetcher;
mod metrics;
mod models;
mod player;
mod playlists;
mod presence;
mod registry;
mod source;
mod store;
mod streamer;
#[cfg(test)]
mod testing;
mod traits;
mod voice;

struct Handler {
    prefix: String,
}

pub struct Engine;

pub struct EngineData {
    pub registry: Arc<Registry>,
    pub lookup: Arc<dyn SongLookup>,
    pub metrics: Arc<Metrics>,
}

impl serenity::prelude::TypeMapKey for Engine {
    type Value = Arc<EngineData>;
}

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl serenity::prelude::TypeMapKey for BotDataMap {
    type Value = BotData;
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        ctx.set_activity(status_activity(&self.prefix)).await;

        let bot_data = BotData { id: ready.user.id.0 };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: bool) {
        if let Ok(engine) = get_engine(&ctx).await {
            engine.registry.on_tenant_join(TenantId(guild.id.0)).await;
        }
    }

    async fn guild_delete(&self, ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // Outages also remove guilds; only a real leave drops the player.
        if incomplete.unavailable {
            return;
        }

        if let Ok(engine) = get_engine(&ctx).await {
            engine.registry.on_tenant_leave(TenantId(incomplete.id.0)).await;
        }
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        if new.channel_id.is_none() {
            let bot_id: Option<u64>;

            {
                let data = ctx.data.read().await;
                bot_id = data.get::<BotDataMap>().map(|data| data.id);
            }

            if let (Some(bot_id), Some(guild_id)) = (bot_id, new.guild_id) {
                if bot_id == new.user_id.0 {
                    info!("Bot ID matches disconnected user");

                    if let Ok(engine) = get_engine(&ctx).await {
                        if let Some(player) = engine.registry.get(TenantId(guild_id.0)) {
                            player.stop().await;
                        }
                    }
                } else {
                    info!("Bot ID does not match disconnected user");
                }
            }
        }
    }
}

#[group]
#[commands(play, skip, stop, queue, remove, np, help)]
struct General;

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::fmt::init();

    let config = Config::from_env().expect("Invalid configuration");

    let framework = StandardFramework::new()
        .configure(|c| {
            c.prefix(config.command_prefix.as_str())
        })
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT;

    let songbird = Songbird::serenity();

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler {
            prefix: config.command_prefix.clone(),
        })
        .framework(framework)
        .register_songbird_with(songbird.clone())
        .await
        .expect("Err creating client");

    let http = client.cache_and_http.http.clone();
    let cache = client.cache_and_http.cache.clone();

    let store: Arc<dyn PlaylistStore> = match &config.playlist_store_dir {
        Some(dir) => {
            info!("Persisting playlists in {}", dir.display());
            Arc::new(JsonPlaylistStore::new(dir.clone()))
        }
        None => Arc::new(MemoryPlaylistStore::new()),
    };

    let metrics = Arc::new(Metrics::new());
    let pipeline = Arc::new(AudioPipeline::new(
        Arc::new(YtDlpFetcher::new(&config)),
        &config.engine,
        metrics.clone(),
    ));

    let registry = Arc::new(Registry::new(PlayerDeps {
        pipeline: pipeline.clone(),
        streamer: FrameStreamer::from_config(&config.engine),
        transport: Arc::new(SongbirdTransport::new(songbird, config.engine.prebuffer_frames)),
        notifier: Arc::new(ChannelNotifier::new(http)),
        store,
    }));

    {
        let mut w = client.data.write().await;

        w.insert::<Engine>(Arc::new(EngineData {
            registry: registry.clone(),
            lookup: Arc::new(YtDlpLookup::new(config.ytdlp_path.clone())),
            metrics: metrics.clone(),
        }));
    }

    let shutdown = CancellationToken::new();
    let monitor = PresenceMonitor::new(
        registry.clone(),
        Arc::new(CachePresence::new(cache)),
        config.engine.presence_interval,
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown.clone()));

    let shard_manager = client.shard_manager.clone();

    tokio::spawn(async move {
        let _ = client.start().await.map_err(|why| info!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c().await.expect("Control-C interruption failed!");

    info!("Received Ctrl-C, shutting down.");

    shutdown.cancel();
    let _ = monitor_task.await;
    registry.shutdown().await;
    shard_manager.lock().await.shutdown_all().await;

    for (counter, value) in metrics.snapshot() {
        info!("{counter} = {value}");
    }
    for cache in [pipeline.metadata_cache().stats(), pipeline.audio_cache().stats()] {
        info!(
            "{}: {} entries, {}/{} used, {} hits, {} misses, {} evictions",
            cache.name, cache.entries, cache.size, cache.capacity, cache.hits, cache.misses, cache.evictions
        );
    }
}

#[command]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    count_command(ctx, "play").await;

    let bot_id: Option<u64>;

    {
        let data = ctx.data.read().await;
        bot_id = data.get::<BotDataMap>().map(|data| data.id);
    }

    let loading_emoji = Unicode("⏳".to_string());

    msg.react(&ctx.http, loading_emoji.clone()).await?;

    let play_song_result = play_song(ctx, msg, args).await;

    if let Some(bot_id) = bot_id {
        msg.channel_id.delete_reaction(&ctx.http, msg.id, Some(UserId(bot_id)), loading_emoji.clone()).await?;
    }

    let answer_emoji = match &play_song_result {
        Ok(_) => {
            "👍"
        }
        Err(why) => {
            info!("Play failed: {why}");
            check_msg(msg.channel_id.say(&ctx.http, format!("Could not play that: {why}")).await);
            "💀"
        }
    };

    msg.react(&ctx.http, Unicode(answer_emoji.to_string())).await?;

    Ok(())
}

async fn play_song(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let (user_input, whole_playlist) = split_playlist_keyword(args.message());

    if user_input.is_empty() {
        return Err(CommandError::from("Give me a URL or a song title"));
    }

    info!("User input is {user_input}");

    let guild = get_guild(ctx, msg)?;

    let connect_to = match guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id)
    {
        Some(channel) => channel,
        None => {
            check_msg(msg.reply(ctx, "Not in a voice channel").await);

            return Err(CommandError::from("Not in a voice channel"));
        }
    };

    let engine = get_engine(ctx).await?;
    let songs = engine.lookup.lookup_songs(user_input, whole_playlist).await?;
    let player = engine.registry.player(TenantId(guild.id.0));

    if !whole_playlist && is_song_in_playlist(user_input) {
        check_msg(
            msg.channel_id
                .say(&ctx.http, "Adding just this song. Put `playlist` after the URL to queue the whole list.")
                .await,
        );
    }

    for song in songs {
        let song = song.requested_by(msg.author.name.clone());
        player
            .add_song(ChannelRef(msg.channel_id.0), ChannelRef(connect_to.0), song)
            .await?;
    }

    Ok(())
}

#[command]
#[aliases("next")]
#[only_in(guilds)]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    count_command(ctx, "skip").await;

    let player = get_player(ctx, msg).await?;

    info!("SKIP - Skip command invoked from guild {}!", player.tenant());

    match player.get_played_song().await? {
        Some(_) => player.skip_song().await?,
        None => check_msg(msg.channel_id.say(&ctx.http, "o_O Already stopped").await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    count_command(ctx, "stop").await;

    let guild_id = get_guild_id(ctx, msg)?;
    let engine = get_engine(ctx).await?;

    match engine.registry.get(TenantId(guild_id.0)) {
        Some(player) if !player.is_closed() => {
            player.stop().await;
            check_msg(msg.channel_id.say(&ctx.http, "Left voice channel").await);
        }
        _ => check_msg(msg.reply(ctx, "Not in a voice channel").await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    count_command(ctx, "queue").await;

    let player = get_player(ctx, msg).await?;
    let songs = player.get_playlist().await?;

    if songs.is_empty() {
        check_msg(msg.channel_id.say(&ctx.http, "The queue is empty!").await);
    } else {
        let max_songs = 20;
        let mut songs_titles: Vec<String> = Vec::with_capacity(min(songs.len(), max_songs));

        for (index, song) in songs.iter().take(max_songs).enumerate() {
            let song_index = index + 1;
            songs_titles.push(format!("{song_index} - {}", song.human_name()));
        }

        let songs_formatted = songs_titles.join("\n");

        check_msg(msg.channel_id.say(&ctx.http, format!("**Queue**:\n```{songs_formatted}```")).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn remove(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    count_command(ctx, "remove").await;

    let position = match args.single::<usize>() {
        Ok(position) => position,
        Err(_) => {
            check_msg(msg.channel_id.say(&ctx.http, "Invalid song index. Check the queue to list the songs.").await);

            return Ok(());
        }
    };

    let player = get_player(ctx, msg).await?;

    match player.remove_song(position).await {
        Ok(song) => check_msg(msg.channel_id.say(&ctx.http, format!("Removed {}", song.title)).await),
        Err(why) => check_msg(msg.channel_id.say(&ctx.http, why.to_string()).await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn np(ctx: &Context, msg: &Message) -> CommandResult {
    count_command(ctx, "np").await;

    let player = get_player(ctx, msg).await?;

    let state = player.state().await;

    match player.get_played_song().await? {
        Some(song) if state == PlayerState::Loading => {
            check_msg(msg.channel_id.say(&ctx.http, format!("Loading {}...", song.human_name())).await);
        }
        Some(song) => {
            let requester = song
                .requested_by
                .as_deref()
                .map(|name| format!("\n> Requested by {name}"))
                .unwrap_or_default();

            check_msg(
                msg.channel_id.say(
                    &ctx.http,
                    format!("Playing song [{}]({}){requester}", song.human_name(), song.url),
                ).await
            );
        }
        None => check_msg(msg.channel_id.say(&ctx.http, "Nothing is playing").await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    count_command(ctx, "help").await;

    let message = r#"
**Commands:**
    **play [URL|Title]** - Plays (or adds to the queue) new tracks given a URL or a video title (supports youtube playlists).
    **play [URL] playlist** - Queues the whole playlist a video URL belongs to.
    **skip** (or **next**) - Plays next track.
    **stop** - Stops the current song, clears the queue and leaves the voice channel.
    **queue** - Shows the queue of tracks.
    **remove [INDEX]** - Removes the track at the given position of the queue.
    **np** - Shows the track being played.
    "#;

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

async fn count_command(ctx: &Context, command: &str) {
    if let Ok(engine) = get_engine(ctx).await {
        engine.metrics.incr(Counter::CommandUsage(command));
    }
}

/// Checks that a message successfully sent; if not, then logs why to stdout.
fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}

fn get_guild(ctx: &Context, msg: &Message) -> CommandResult<Guild> {
    msg.guild(&ctx.cache).ok_or(CommandError::from("Guild not found"))
}

fn get_guild_id(ctx: &Context, msg: &Message) -> CommandResult<GuildId> {
    let guild_id = get_guild(ctx, msg)?.id;

    Ok(guild_id)
}

async fn get_engine(ctx: &Context) -> CommandResult<Arc<EngineData>> {
    let data = ctx.data.read().await;

    data.get::<Engine>()
        .cloned()
        .ok_or(CommandError::from("Engine not initialised"))
}

async fn get_player(ctx: &Context, msg: &Message) -> CommandResult<PlayerHandle> {
    let guild_id = get_guild_id(ctx, msg)?;
    let engine = get_engine(ctx).await?;

    Ok(engine.registry.player(TenantId(guild_id.0)))
}
