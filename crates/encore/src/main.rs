use encore::{EncoreConfig, LogFormat, ServerBuilder, UserIdAuthenticator};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EncoreConfig::load()?;
    config.validate()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    match config.server.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!(bind = %config.server.bind_addr, "Starting Encore");

    let builder = ServerBuilder::from_config(&config).await?;
    let auth = UserIdAuthenticator::new(builder.store_handle());
    let server = builder.build(auth).await?;
    info!(addr = %server.local_addr()?, "listening");

    tokio::select! {
        result = server.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
        }
    }
    Ok(())
}
