use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskserver::automation::AutomationService;
use deskserver::config::{configure_settings_routes, AppConfig};
use deskserver::email::configure_email_routes;
use deskserver::email::outbound::Mailer;
use deskserver::shared::state::AppState;
use deskserver::shared::utils::create_conn;
use deskserver::tickets::configure_tickets_routes;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let pool = create_conn()?;
    {
        let mut conn = pool.get().context("no database connection for migrations")?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("migrations failed: {e}"))?;
    }

    let mailer = Mailer::new(config.smtp.clone());
    let state = Arc::new(AppState {
        conn: pool,
        config,
        mailer,
    });

    tokio::spawn(AutomationService::new(state.clone()).run());

    let app = Router::new()
        .merge(configure_tickets_routes())
        .merge(configure_email_routes())
        .merge(configure_settings_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("deskserver listening on {addr}");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
