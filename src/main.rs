use std::path::Path;
use std::sync::Arc;

use secrecy::SecretString;

use driver_onboard::catalog::build_catalog;
use driver_onboard::channels::{GatewayClient, Messenger, WebhookState, webhook_routes};
use driver_onboard::config::EngineConfig;
use driver_onboard::engine::Engine;
use driver_onboard::error::ConfigError;
use driver_onboard::extract::{OcrSpaceClient, TextRecognizer};
use driver_onboard::partner::{HttpPartnerClient, PartnerClient};
use driver_onboard::store::{Database, LibSqlBackend};
use driver_onboard::worker::{spawn_inbox_drain, spawn_reaper};

fn required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::default();

    // ── Database ─────────────────────────────────────────────────────
    let db_path =
        std::env::var("ONBOARD_DB_PATH").unwrap_or_else(|_| "./data/onboard.db".to_string());
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    tracing::info!(db_path, "Database ready");

    // ── Remote collaborators ─────────────────────────────────────────
    let gateway_url = required_env("ONBOARD_GATEWAY_URL")?;
    let gateway_token = SecretString::from(required_env("ONBOARD_GATEWAY_TOKEN")?);
    let messenger: Arc<dyn Messenger> = Arc::new(GatewayClient::new(
        gateway_url,
        gateway_token,
        config.http_timeout,
    ));

    let ocr_url = std::env::var("ONBOARD_OCR_URL")
        .unwrap_or_else(|_| "https://api.ocr.space/parse/image".to_string());
    let ocr_key = SecretString::from(required_env("ONBOARD_OCR_KEY")?);
    let recognizer: Arc<dyn TextRecognizer> =
        Arc::new(OcrSpaceClient::new(ocr_url, ocr_key, config.ocr_timeout));

    let partner_url = required_env("ONBOARD_PARTNER_URL")?;
    let partner_token = SecretString::from(required_env("ONBOARD_PARTNER_TOKEN")?);
    let partner: Arc<dyn PartnerClient> = Arc::new(HttpPartnerClient::new(
        partner_url,
        partner_token,
        config.http_timeout,
    ));

    // ── Engine + workers ─────────────────────────────────────────────
    let catalog = Arc::new(build_catalog());
    let engine = Arc::new(Engine::new(
        Arc::clone(&db),
        messenger,
        recognizer,
        partner,
        catalog,
        config.clone(),
    ));

    let _inbox_handle = spawn_inbox_drain(Arc::clone(&engine), config.inbox_interval);
    let _reaper_handle = spawn_reaper(Arc::clone(&engine), config.reaper_interval);
    tracing::info!(
        inbox_secs = config.inbox_interval.as_secs(),
        reaper_secs = config.reaper_interval.as_secs(),
        "Workers running"
    );

    // ── Webhook ──────────────────────────────────────────────────────
    let bind = std::env::var("ONBOARD_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let app = webhook_routes(WebhookState {
        store: Arc::clone(&db),
    });
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind, "Webhook listening");
    axum::serve(listener, app).await?;

    Ok(())
}
