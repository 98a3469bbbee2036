use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::ApiError;
use crate::shared::models::{SupportSettings, UserRole};
use crate::shared::schema::support_settings;
use crate::shared::state::AppState;

/// Deployment-level configuration, loaded once from the environment at
/// startup. Runtime-tunable automation knobs live in [`SupportSettings`]
/// instead, so they can be changed without a restart.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub base_url: String,
    pub inbound_domain: String,
    pub smtp: SmtpConfig,
    pub partner_api_key: Option<String>,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub api_key: String,
    pub model: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let server = ServerConfig {
            host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
        };
        let base_url =
            std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        let inbound_domain = std::env::var("INBOUND_EMAIL_DOMAIN")
            .unwrap_or_else(|_| "tickets.localhost".to_string());
        let smtp = SmtpConfig {
            host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(587),
            username: std::env::var("SMTP_USERNAME").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
            from_address: std::env::var("SMTP_FROM")
                .unwrap_or_else(|_| "support@tickets.localhost".to_string()),
        };
        let llm = LlmConfig {
            endpoint: std::env::var("LLM_URL").ok(),
            api_key: std::env::var("LLM_API_KEY").unwrap_or_else(|_| "empty".to_string()),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        };
        Ok(AppConfig {
            server,
            base_url,
            inbound_domain,
            smtp,
            partner_api_key: std::env::var("PARTNER_API_KEY").ok(),
            llm,
        })
    }
}

/// Loads the settings singleton, falling back to defaults when the row has
/// never been written. Callers read this once per request or automation
/// tick rather than caching it in process.
pub fn load_settings(conn: &mut PgConnection) -> QueryResult<SupportSettings> {
    let existing = support_settings::table
        .order(support_settings::updated_at.desc())
        .first::<SupportSettings>(conn)
        .optional()?;
    Ok(existing.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub auto_solve_enabled: Option<bool>,
    pub auto_solve_hours: Option<i32>,
    pub auto_close_enabled: Option<bool>,
    pub auto_close_hours: Option<i32>,
    pub ai_drafts_enabled: Option<bool>,
}

pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<SupportSettings>, ApiError> {
    if !identity.role.is_staff() {
        return Err(ApiError::Forbidden);
    }
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    Ok(Json(load_settings(&mut conn)?))
}

/// Allow-listed settings patch: only the fields named here are mutable,
/// anything else in the payload is rejected by deserialization.
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<SupportSettings>, ApiError> {
    if identity.role != UserRole::Admin {
        return Err(ApiError::Forbidden);
    }
    for hours in [req.auto_solve_hours, req.auto_close_hours].into_iter().flatten() {
        if hours <= 0 {
            return Err(ApiError::validation(
                "invalid_threshold",
                "automation thresholds must be positive",
            ));
        }
    }
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let current = load_settings(&mut conn)?;
    let updated = SupportSettings {
        id: if current.id.is_nil() { Uuid::new_v4() } else { current.id },
        auto_solve_enabled: req.auto_solve_enabled.unwrap_or(current.auto_solve_enabled),
        auto_solve_hours: req.auto_solve_hours.unwrap_or(current.auto_solve_hours),
        auto_close_enabled: req.auto_close_enabled.unwrap_or(current.auto_close_enabled),
        auto_close_hours: req.auto_close_hours.unwrap_or(current.auto_close_hours),
        ai_drafts_enabled: req.ai_drafts_enabled.unwrap_or(current.ai_drafts_enabled),
        updated_at: Utc::now(),
    };
    diesel::insert_into(support_settings::table)
        .values(&updated)
        .on_conflict(support_settings::id)
        .do_update()
        .set((
            support_settings::auto_solve_enabled.eq(updated.auto_solve_enabled),
            support_settings::auto_solve_hours.eq(updated.auto_solve_hours),
            support_settings::auto_close_enabled.eq(updated.auto_close_enabled),
            support_settings::auto_close_hours.eq(updated.auto_close_hours),
            support_settings::ai_drafts_enabled.eq(updated.ai_drafts_enabled),
            support_settings::updated_at.eq(updated.updated_at),
        ))
        .execute(&mut conn)?;
    Ok(Json(updated))
}

pub fn configure_settings_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/settings", get(get_settings).put(update_settings))
}
