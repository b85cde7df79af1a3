use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::config::WorkerConfig;
use worker::runtime::WorkerRuntime;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("vodhost-worker v{}", env!("CARGO_PKG_VERSION"));

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if config.api_key.is_none() {
        eprintln!("ERROR: VODHOST_WORKER_API_KEY environment variable required");
        eprintln!("Register a worker first: curl -X POST {}/api/worker/register", config.api_url);
        std::process::exit(1);
    }

    let runtime = match WorkerRuntime::new(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("ERROR: worker startup failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}
