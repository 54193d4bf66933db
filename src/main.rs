use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use tunes::{
    audio::Player,
    bot::TunesBot,
    config::{Config, EngineConfig},
    storage::JsonStorage,
    transport::DiscordTransport,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tunes=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting tunes v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    let engine = config.engine();

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&engine).await;
    }

    info!("{}", config.summary());

    let storage = Arc::new(JsonStorage::new(&config.data_dir).await?);

    // The same songbird instance serves the gateway and the transport.
    let http = Arc::new(Http::new(&config.discord_token));
    let songbird = Songbird::serenity();
    let transport = DiscordTransport::new(http, songbird.clone(), config.frame_buffer);
    let player = Arc::new(Player::new(Arc::new(transport), engine));

    match storage.load().await {
        Ok(Some(snapshot)) => {
            player.restore(snapshot);
        }
        Ok(None) => info!("No saved state, starting fresh"),
        Err(e) => warn!("Ignoring unreadable saved state: {:?}", e),
    }

    // Periodic save
    {
        let player = player.clone();
        let storage = storage.clone();
        let every = Duration::from_secs(config.save_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = storage.save(&player.snapshot()).await {
                    error!("Periodic save failed: {:?}", e);
                }
            }
        });
    }

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(TunesBot::new(player.clone()))
        .register_songbird_with(songbird)
        .await?;

    // Graceful shutdown
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Shutdown signal received, saving state...");

        if let Err(e) = storage.save(&player.snapshot()).await {
            error!("Final save failed: {:?}", e);
        }
        player.stop_all();
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

/// Checks that every stage program can be executed.
async fn health_check(engine: &EngineConfig) -> Result<()> {
    let programs = [
        (&engine.resolver.program, "--version"),
        (&engine.stages.fetch.program, "--version"),
        (&engine.stages.transcode.program, "-version"),
        (&engine.stages.encode.program, "--help"),
    ];

    let mut missing = Vec::new();
    for (program, probe) in programs {
        let runs = async_process::Command::new(program)
            .arg(probe)
            .output()
            .await
            .is_ok();
        if !runs {
            missing.push(program.as_str());
        }
    }

    if missing.is_empty() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Missing dependencies: {}", missing.join(", "));
    }
}
