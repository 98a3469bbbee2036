pub mod inbound;
pub mod outbound;
pub mod threads;

use std::sync::Arc;

use axum::routing::post;
use axum::Router;

use crate::shared::state::AppState;

pub fn configure_email_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/email/inbound", post(inbound::inbound_email_webhook))
}
