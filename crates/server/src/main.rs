use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let db_path = std::env::var("VODSYNC_DB").unwrap_or_else(|_| "vodsync.db".to_string());
    info!(db_path = %db_path, "connecting to database");

    let pool = vodsync_db::connect(&db_path)
        .await
        .context("failed to connect to database")?;

    vodsync_db::migrate::run(&pool)
        .await
        .context("failed to run migrations")?;
    info!("migrations complete");

    let spider = Arc::new(vodsync_spider::client::SpiderClient::default());

    let scheduler = vodsync_server::scheduler::Scheduler::new(pool.clone(), spider.clone())
        .await
        .context("failed to create scheduler")?;
    scheduler
        .start()
        .await
        .context("failed to start scheduler")?;

    let app_state = vodsync_server::state::AppState {
        db: pool,
        spider,
        scheduler,
    };
    let app = vodsync_server::routes::build_router(app_state);

    let bind_addr = std::env::var("VODSYNC_BIND").unwrap_or_else(|_| "0.0.0.0:8090".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context("failed to bind")?;
    info!(addr = %bind_addr, "server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
