use std::net::SocketAddr;

use astra_core::config::{env_str, AppConfig};
use astra_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let logs_dir = canonical_logs_dir_from_root(&config.data_dir);
    let (_log_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
    tracing::info!(
        "logging initialized: dir={} prefix={}",
        log_info.logs_dir,
        log_info.prefix
    );

    let addr: SocketAddr = env_str("ASTRA_HTTP_ADDR", "127.0.0.1:8787").parse()?;
    let state = astra_server::build_state(config)?;
    astra_server::serve(addr, state).await
}
