use actix_web::{web, App, HttpServer};
use std::io;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alerts::AlertSender;
use coordinator::config::Config;
use coordinator::handlers;
use coordinator::jobs::janitor::Janitor;
use db_pool::{create_pool, DbConfig};
use job_queue::JobQueue;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env().expect("Failed to load configuration"));

    tracing::info!("Starting vodhost-coordinator v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage root: {}", config.storage.root.display());
    tracing::info!("Job queue mode: {}", config.queue.mode);

    config
        .ensure_storage_dirs()
        .await
        .expect("Failed to create storage directories");

    let db_config = DbConfig::from_env("coordinator").expect("DATABASE_URL is required");
    db_config.log_config();
    let pool = create_pool(db_config)
        .await
        .expect("Failed to create database pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    let queue = JobQueue::connect(config.queue_config())
        .await
        .expect("Failed to initialize job queue");
    let alert_sender = AlertSender::new(config.alert_config());

    let janitor = Janitor::new(
        pool.clone(),
        config.clone(),
        queue.clone(),
        alert_sender.clone(),
    );
    let janitor_handle = janitor.start();

    let bind_addr = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!("Listening on {bind_addr}");

    let pool_data = web::Data::new(pool);
    let config_data = web::Data::from(config.clone());
    let queue_data = web::Data::new(queue);
    let alerts_data = web::Data::new(alert_sender);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(pool_data.clone())
            .app_data(config_data.clone())
            .app_data(queue_data.clone())
            .app_data(alerts_data.clone())
            .wrap(tracing_actix_web::TracingLogger::default())
            .route("/health", web::get().to(|| async { "OK" }))
            .configure(handlers::configure_routes)
    })
    .bind(&bind_addr)?
    .run()
    .await;

    janitor_handle.abort();
    server
}
