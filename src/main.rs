use std::sync::Arc;

use ratelimit_proxy::server::{serve, shutdown_signal, spawn_bucket_sweeper};
use ratelimit_proxy::{Config, Proxy, build_client};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIG_FILE_PATH.to_owned());

    let config = Config::load_from_file(&config_path)
        .and_then(|c| c.into_runtime())
        .unwrap_or_else(|e| {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        });

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        eprintln!("fatal: failed to bind {}: {e}", config.listen);
        std::process::exit(1);
    });

    let client = build_client(&config);
    let proxy = Arc::new(Proxy::from_config(&config, client));

    if let Some(interval) = config.bucket_sweep_interval {
        spawn_bucket_sweeper(Arc::clone(proxy.registry()), interval);
    }

    info!(
        listen = %config.listen,
        downstream = %config.downstream,
        config = %config_path,
        "proxy listening"
    );

    serve(listener, proxy, shutdown_signal()).await;
}
