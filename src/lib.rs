//! gemini-relay Library
//!
//! A Discord bot that relays channel conversations to Gemini and posts the
//! text and generated images back.
//!
//! ## Architecture
//!
//! - `config`: Environment / `.config.env` configuration and paths
//! - `logging`: Structured logging with tracing
//! - `session`: Per-channel activation, system prompt and rolling history
//! - `gemini`: generateContent client and response parsing
//! - `images`: Base64 image decoding and temporary image files
//! - `controller`: Command handling, reply formatting and the reply cycle
//! - `discord`: Serenity gateway handler and slash commands
//! - `health`: HTTP liveness endpoints
//!
//! ## Main Entry Point
//!
//! - `run()`: Start the health listener and the Discord client

pub mod config;
pub mod controller;
pub mod discord;
pub mod gemini;
pub mod health;
pub mod images;
pub mod logging;
pub mod session;

use std::sync::Arc;
use tracing::{error, info};

pub use logging::init_tracing;

use config::BotConfig;
use controller::SessionController;
use gemini::GeminiClient;
use images::ImageStore;
use session::SessionStore;

/// Wire everything together and run until Ctrl-C or the gateway stops.
pub async fn run(config: BotConfig) -> anyhow::Result<()> {
    info!("Starting gemini-relay {} ({:?})", config::Config::version(), config);

    std::fs::create_dir_all(&config.image_dir)?;

    let store = Arc::new(SessionStore::new(config.history_limit));
    let generator = Arc::new(GeminiClient::from_config(&config)?);
    let images = Arc::new(ImageStore::new(config.image_dir.clone()));
    let controller = Arc::new(SessionController::new(
        store,
        generator,
        images,
        config.command_prefix.clone(),
        config.default_system_prompt.clone(),
    ));

    let port = config.port;
    let health = tokio::spawn(async move {
        if let Err(e) = health::serve(port).await {
            error!("Health: listener stopped: {}", e);
        }
    });

    let bot = discord::run_discord_client(config.discord_token.clone(), controller, config.guild_id);

    let result = tokio::select! {
        r = bot => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            discord::disconnect_discord().await;
            Ok(())
        }
    };

    health.abort();
    result
}
