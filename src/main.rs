use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use idlewatch::{config::Config, create_router, db::Db, logic::rules, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "idlewatch=debug,tower_http=debug".into());
    // Structured JSON logs in production, human-readable everywhere else.
    if config.is_production() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!("idlewatch starting...");
    tracing::info!("Database: {}", config.database_path.display());

    let db = Db::open(&config.database_path)?;
    db.with(|conn| rules::seed_defaults(conn))?;

    let state = AppState::new(db, config.clone())?;

    // Periodic aggregation of the current month for every active account.
    let background = state.clone();
    tokio::spawn(async move {
        let interval = Duration::from_secs(background.config.aggregation_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            let state = background.clone();
            let result = tokio::task::spawn_blocking(move || {
                state.aggregator.run_pass(&state.db, Utc::now())
            })
            .await;
            match result {
                Ok(Ok(accounts)) => {
                    tracing::info!(accounts, "Background aggregation pass finished")
                }
                Ok(Err(err)) => tracing::error!(error = %err, "Background aggregation failed"),
                Err(err) => tracing::error!(error = %err, "Background aggregation task panicked"),
            }
        }
    });

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("🚀 Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
