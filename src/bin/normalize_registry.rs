//! Rewrite the device registry document into canonical form and exit.

use nutricycle_gateway::{config::AppConfig, services::registry::DeviceRegistry};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let path = std::env::args()
        .nth(1)
        .map(Into::into)
        .unwrap_or(config.registry_path);

    let (registry, migrated) = DeviceRegistry::load_with_report(&path).await;
    let changed = migrated + registry.normalize_all().await;

    tracing::info!(
        path = %path.display(),
        entries = registry.len().await,
        changed,
        "Registry normalized"
    );
    println!("{}", serde_json::json!({ "ok": true, "result": { "changed": changed } }));
}
