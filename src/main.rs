use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("."))
                .join("llmux")
                .join("config.yaml")
        });
    llmux::config::init_config(config_path)?;

    let result = llmux::server::start_server().await;
    llmux::pipeline::Pipeline::global().shutdown();
    llmux::auth::QuotaManager::global().shutdown();
    result
}
