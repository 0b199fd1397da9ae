//! Docent server - HTTP orchestration core for interactive kiosks.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod catalog;
mod config;
mod datachannel;
mod error;
mod llm;
mod pipeline;
mod sessions;
mod state;
mod transport;
mod tts;

use catalog::CatalogHandle;
use config::ServerConfig;
use datachannel::DatachannelRouter;
use llm::HttpLlmBackend;
use sessions::SessionRegistry;
use state::AppState;
use transport::LocalRoomHub;
use tts::{HttpVoiceTier, SineTier, SpeechSynthesizer, TieredSynthesizer, TtsCache};

#[derive(Debug, Parser)]
#[command(
    name = "docent-server",
    about = "Real-time orchestration server for Docent kiosks",
    version = env!("CARGO_PKG_VERSION")
)]
struct ServerArgs {
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindConfig {
    host: String,
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docent_server=info,docent_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Docent server");

    let config = Arc::new(ServerConfig::from_env());
    info!("TTS cache directory: {:?}", config.tts_cache_dir);

    let catalog = Arc::new(CatalogHandle::load(config.catalog_path.clone())?);

    let transport = Arc::new(LocalRoomHub::new(config.sfu_url.clone()));
    let router = Arc::new(DatachannelRouter::new(transport.clone()));
    let registry = Arc::new(SessionRegistry::new(
        config.clone(),
        transport,
        router.clone(),
    ));
    registry.start_background();

    let mut tiers: Vec<Box<dyn SpeechSynthesizer>> = vec![Box::new(HttpVoiceTier::new(
        "primary-cloud",
        config.tts_primary_url.clone(),
    ))];
    if let Some(secondary) = &config.tts_secondary_url {
        tiers.push(Box::new(HttpVoiceTier::new(
            "secondary-cloud",
            secondary.clone(),
        )));
    }
    tiers.push(Box::new(SineTier::new()));

    let tts = Arc::new(TtsCache::new(
        config.tts_cache_dir.clone(),
        config.tts_cache_enabled,
        Arc::new(TieredSynthesizer::new(tiers)),
        config.tts_timeout,
    ));

    let llm = Arc::new(HttpLlmBackend::new(
        config.llm_url.clone(),
        config.llm_timeout,
    ));

    let state = AppState::new(
        config,
        registry.clone(),
        router,
        llm,
        tts,
        catalog,
    );

    let app = api::create_router(state);

    let bind = resolve_bind_config(args);
    let addr = format!("{}:{}", bind.host, bind.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(registry));

    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    Ok(())
}

fn resolve_bind_config(args: ServerArgs) -> BindConfig {
    BindConfig {
        host: args.host.unwrap_or_else(host_from_env_or_default),
        port: args.port.unwrap_or_else(port_from_env_or_default),
    }
}

fn host_from_env_or_default() -> String {
    match std::env::var("DOCENT_HOST") {
        Ok(raw) => {
            let host = raw.trim();
            if host.is_empty() {
                warn!("Empty DOCENT_HOST, falling back to 0.0.0.0");
                "0.0.0.0".to_string()
            } else {
                host.to_string()
            }
        }
        Err(_) => "0.0.0.0".to_string(),
    }
}

fn port_from_env_or_default() -> u16 {
    match std::env::var("DOCENT_PORT") {
        Ok(raw) => match raw.trim().parse::<u16>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid DOCENT_PORT='{}', falling back to 8080", raw);
                8080
            }
        },
        Err(_) => 8080,
    }
}

/// Wait for shutdown signal and release session timers.
async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
    registry.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("environment lock poisoned")
    }

    fn clear_bind_env() {
        std::env::remove_var("DOCENT_HOST");
        std::env::remove_var("DOCENT_PORT");
    }

    fn parse(args: &[&str]) -> ServerArgs {
        ServerArgs::try_parse_from(args).expect("arguments should parse")
    }

    #[test]
    fn cli_values_override_environment() {
        let _guard = env_lock();
        clear_bind_env();
        std::env::set_var("DOCENT_HOST", "0.0.0.0");
        std::env::set_var("DOCENT_PORT", "8080");

        let bind = resolve_bind_config(parse(&[
            "docent-server",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
        ]));

        assert_eq!(bind.host, "127.0.0.1");
        assert_eq!(bind.port, 9000);
        clear_bind_env();
    }

    #[test]
    fn uses_environment_when_cli_values_missing() {
        let _guard = env_lock();
        clear_bind_env();
        std::env::set_var("DOCENT_HOST", "127.0.0.1");
        std::env::set_var("DOCENT_PORT", "8088");

        let bind = resolve_bind_config(parse(&["docent-server"]));

        assert_eq!(bind.host, "127.0.0.1");
        assert_eq!(bind.port, 8088);
        clear_bind_env();
    }

    #[test]
    fn falls_back_to_defaults_without_cli_or_environment() {
        let _guard = env_lock();
        clear_bind_env();

        let bind = resolve_bind_config(parse(&["docent-server"]));

        assert_eq!(bind.host, "0.0.0.0");
        assert_eq!(bind.port, 8080);
    }
}
