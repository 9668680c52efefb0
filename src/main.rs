use archestra_sandbox_lib::config::SandboxSettings;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("archestra_sandbox_lib=debug,info")),
        )
        .init();

    let settings = SandboxSettings::from_env();
    tracing::info!("Starting Archestra sandbox service, data in {}", settings.data_dir.display());

    archestra_sandbox_lib::run(settings).await
}
