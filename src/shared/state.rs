use crate::config::AppConfig;
use crate::email::outbound::Mailer;
use crate::shared::utils::DbPool;

/// Shared application state handed to every handler and to the automation
/// service. The service itself is stateless; everything durable lives in
/// Postgres behind the pool.
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub mailer: Mailer,
}
