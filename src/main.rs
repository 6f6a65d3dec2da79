use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

use guild_jukebox::{
    api,
    audio::{
        manager::PlayerManager,
        pipeline::FfmpegPipeline,
        player::PlayerServices,
        transport::SongbirdTransport,
    },
    bot::JukeboxBot,
    cache::FileCache,
    config::Config,
    sources::{FormatResolver, YtDlpProbe, YtDlpTrackStreamer},
    storage::JsonStorage,
    ui::embeds::EmbedAnnouncer,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting Guild Jukebox v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    let storage = Arc::new(JsonStorage::new(config.data_dir.clone(), config.clone()).await?);
    let cache = Arc::new(FileCache::new(config.cache_dir.clone()).await?);
    let pipeline_config = Arc::new(config.pipeline());

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES;

    let songbird = Songbird::serenity();
    let http = Arc::new(Http::new(&config.discord_token));

    let services = PlayerServices {
        transport: Arc::new(SongbirdTransport::new(songbird.clone())),
        resolver: Arc::new(
            FormatResolver::new(
                cache.clone(),
                Arc::new(YtDlpProbe::new(config.ytdlp_path.clone())),
                pipeline_config.clone(),
            )
            .with_track_streamer(Arc::new(YtDlpTrackStreamer::new(config.ytdlp_path.clone()))),
        ),
        streams: Arc::new(FfmpegPipeline::new(cache, pipeline_config)),
        settings: storage,
        announcer: Arc::new(EmbedAnnouncer::new(http)),
    };
    let manager = Arc::new(PlayerManager::new(services));

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(JukeboxBot::new(manager.clone()))
        .register_songbird_with(songbird)
        .await?;

    let port = config.webserver_port;
    let api_players = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(port, api_players).await {
            error!("Status API stopped: {:?}", e);
        }
    });

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("⚠️ Shutdown signal received, closing...");
                shard_manager.shutdown_all().await;
            }
            Err(e) => error!("Could not listen for Ctrl+C: {:?}", e),
        }
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let yt_dlp = tokio::process::Command::new(&config.ytdlp_path)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = tokio::process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Missing yt-dlp or ffmpeg");
    }
}
