use anyhow::Result;
use qwengate::config;
use qwengate::server;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = config::load_config(None)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cfg.log.level.parse().unwrap_or_else(|_| "info".parse().unwrap()));
    if cfg.log.format == config::LogFormat::Json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    cfg.validate()?;
    server::run(cfg).await
}
