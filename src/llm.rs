//! Optional AI assistance: draft a suggested reply after a customer email
//! lands on a ticket. Strictly best-effort; a slow or failing model never
//! delays or fails the reply pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::shared::models::TicketChannel;
use crate::shared::state::AppState;
use crate::tickets::lifecycle::{insert_comment, load_ticket, NewComment};

/// Hard bound on the model round trip. Past it the draft is abandoned, not
/// retried.
const GENERATION_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn generate_draft(
    llm: &LlmConfig,
    subject: &str,
    customer_message: &str,
) -> Result<String, anyhow::Error> {
    let endpoint = llm
        .endpoint
        .as_ref()
        .ok_or_else(|| anyhow!("LLM_URL not configured"))?;
    let prompt = format!(
        "You are a support agent. Draft a short, friendly reply to this \
         customer message on the ticket \"{subject}\":\n\n{customer_message}"
    );
    let body = json!({
        "model": llm.model,
        "messages": [{ "role": "user", "content": prompt }],
    });

    let request = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", endpoint.trim_end_matches('/')))
        .bearer_auth(&llm.api_key)
        .json(&body)
        .send();
    let response = timeout(GENERATION_TIMEOUT, request)
        .await
        .context("LLM generation timed out")??;
    let payload: serde_json::Value = timeout(GENERATION_TIMEOUT, response.json())
        .await
        .context("LLM response read timed out")??;
    payload["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("LLM returned no content"))
}

/// Fire-and-forget draft generation, gated by the `ai_drafts_enabled`
/// setting. The draft lands as an internal system note agents can edit or
/// discard.
pub fn maybe_spawn_draft(state: Arc<AppState>, ticket_id: Uuid, customer_message: String) {
    if state.config.llm.endpoint.is_none() {
        return;
    }
    tokio::spawn(async move {
        let enabled = {
            let Ok(mut conn) = state.conn.get() else {
                return;
            };
            match crate::config::load_settings(&mut conn) {
                Ok(settings) => settings.ai_drafts_enabled,
                Err(e) => {
                    warn!("could not read settings for AI draft: {e}");
                    false
                }
            }
        };
        if !enabled {
            return;
        }

        let subject = {
            let Ok(mut conn) = state.conn.get() else {
                return;
            };
            match load_ticket(&mut conn, ticket_id) {
                Ok(ticket) => ticket.subject,
                Err(e) => {
                    warn!("AI draft skipped, ticket load failed: {e}");
                    return;
                }
            }
        };
        let draft = match generate_draft(&state.config.llm, &subject, &customer_message).await {
            Ok(draft) => draft,
            Err(e) => {
                debug!("AI draft abandoned for ticket {ticket_id}: {e}");
                return;
            }
        };

        let Ok(mut conn) = state.conn.get() else {
            return;
        };
        let body = format!("Suggested reply:\n\n{draft}");
        let author_id = match load_ticket(&mut conn, ticket_id) {
            Ok(ticket) => ticket.assignee_id.unwrap_or(ticket.requester_id),
            Err(_) => return,
        };
        let result = insert_comment(
            &mut conn,
            NewComment {
                ticket_id,
                author_id,
                body: crate::email::inbound::plain_to_html(&body),
                body_plain: body,
                is_internal: true,
                is_system: true,
                channel: TicketChannel::Internal,
                email_message_id: None,
                email_from: None,
            },
        );
        match result {
            Ok(_) => debug!("AI draft stored for ticket {ticket_id} at {}", Utc::now()),
            Err(e) => warn!("failed to store AI draft: {e}"),
        }
    });
}
