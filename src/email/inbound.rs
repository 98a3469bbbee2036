//! Inbound email processing.
//!
//! Turns a parsed inbound-email webhook payload into either a comment on an
//! existing ticket or a follow-up ticket, guarded by the per-ticket reply
//! token and sender verification. The webhook always gets HTTP 200 back,
//! whatever happened, so the provider never enters a retry storm.

use std::sync::Arc;

use axum::extract::State;
use axum::{Form, Json};
use diesel::prelude::*;
use mailparse::MailHeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::email::threads;
use crate::error::ApiError;
use crate::shared::models::{Ticket, TicketChannel, TicketPriority, TicketStatus};
use crate::shared::state::AppState;
use crate::tickets::lifecycle::{
    self, insert_comment, load_user, log_activity, NewComment, NewTicketInput, ReplyInput,
};

#[derive(Debug, Deserialize)]
pub struct InboundEmailPayload {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub headers: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InboundResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    CommentAdded,
    FollowUpCreated,
    Ignored(&'static str),
    Rejected(&'static str),
}

/// Markers that begin quoted or machine-appended content. The earliest
/// match across all of them is where the human-authored reply ends.
static QUOTE_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // "-----Original Message-----" style client separators
        r"(?mi)^\s*-{2,}\s*Original Message\s*-{2,}",
        // "On Mon, Jan 1 2024, John wrote:" possibly wrapped over lines
        r"(?msi)^On\b.{0,500}?\bwrote:",
        // Forwarded-header block: From:/Sent:/Date:/To: lines
        r"(?mi)^\s*From:.+\n\s*(?:Sent|Date|To):",
        // Quoted line
        r"(?m)^\s*>",
        // Long separator runs
        r"(?m)^\s*[_-]{10,}\s*$",
        // Signature delimiters
        r"(?m)^--\s*$",
        r"(?mi)^Sent from my (?:iPhone|iPad|Android|Galaxy|Windows Phone|mobile device)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("quote marker regex"))
    .collect()
});

static BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("blank run regex"));

/// Extracts the human-authored part of an email body: truncate at the
/// earliest quote marker, drop leftover quoted lines, collapse blank runs.
pub fn extract_reply(raw: &str) -> String {
    let normalized = raw.replace('\r', "");
    let mut cut = normalized.len();
    for marker in QUOTE_MARKERS.iter() {
        if let Some(m) = marker.find(&normalized) {
            cut = cut.min(m.start());
        }
    }
    let kept = normalized[..cut]
        .lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_RUN.replace_all(&kept, "\n\n").trim().to_string()
}

/// Replies shorter than two characters carry no usable content. Counted in
/// characters, not bytes, so a lone multibyte character still discards.
pub fn is_empty_reply(content: &str) -> bool {
    content.chars().count() < 2
}

/// Pulls the bare address out of a `From` header value, accepting both
/// `Name <addr>` and bare `addr` forms.
pub fn parse_sender_address(from: &str) -> Option<String> {
    let addr = match (from.find('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => from[start + 1..end].trim(),
        _ => from.trim(),
    };
    if addr.contains('@') {
        Some(addr.to_string())
    } else {
        None
    }
}

/// Canonical form used for sender verification: lowercased, with any
/// `+tag` suffix stripped from the local part.
pub fn normalize_email(addr: &str) -> String {
    let lower = addr.trim().to_lowercase();
    match lower.split_once('@') {
        Some((local, domain)) => {
            let local = local.split('+').next().unwrap_or(local);
            format!("{local}@{domain}")
        }
        None => lower,
    }
}

/// Minimal plain-text-to-HTML rendering: entity escaping and line breaks.
/// Anything fancier is the frontend's problem.
pub fn plain_to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;");
    escaped.replace('\n', "<br>")
}

fn parse_message_id(headers: Option<&str>) -> Option<String> {
    let raw = headers?;
    let (parsed, _) = mailparse::parse_headers(raw.as_bytes()).ok()?;
    parsed.get_first_value("Message-ID")
}

pub async fn inbound_email_webhook(
    State(state): State<Arc<AppState>>,
    Form(payload): Form<InboundEmailPayload>,
) -> Json<InboundResponse> {
    match process_inbound(&state, &payload) {
        Ok(InboundOutcome::CommentAdded) | Ok(InboundOutcome::FollowUpCreated) => {
            Json(InboundResponse {
                status: "success",
                reason: None,
            })
        }
        Ok(InboundOutcome::Ignored(reason)) => Json(InboundResponse {
            status: "ignored",
            reason: Some(reason),
        }),
        Ok(InboundOutcome::Rejected(reason)) => Json(InboundResponse {
            status: "rejected",
            reason: Some(reason),
        }),
        Err(e) => {
            // Internal failures are logged, never surfaced: a non-200 here
            // would only trigger provider retries of the same poison email.
            error!("inbound email processing failed: {e}");
            Json(InboundResponse {
                status: "error",
                reason: Some("internal_error"),
            })
        }
    }
}

fn process_inbound(
    state: &Arc<AppState>,
    payload: &InboundEmailPayload,
) -> Result<InboundOutcome, ApiError> {
    let Some(token) = threads::parse_reply_token(&payload.to) else {
        return Ok(InboundOutcome::Ignored("no_reply_token"));
    };

    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let Some(thread) = threads::find_thread_by_token(&mut conn, &token)? else {
        return Ok(InboundOutcome::Ignored("no_reply_token"));
    };
    let ticket = {
        use crate::shared::schema::tickets;
        match tickets::table
            .filter(tickets::id.eq(thread.ticket_id))
            .first::<Ticket>(&mut conn)
            .optional()?
        {
            Some(ticket) => ticket,
            None => return Ok(InboundOutcome::Ignored("ticket_not_found")),
        }
    };
    let requester = load_user(&mut conn, ticket.requester_id)?;

    // Sender verification is the only authentication on this path: the
    // From address must normalize to the ticket requester's address.
    let Some(sender) = parse_sender_address(&payload.from) else {
        warn!(
            "inbound email for ticket #{} had unparseable From header",
            ticket.ticket_number
        );
        return Ok(InboundOutcome::Rejected("sender_mismatch"));
    };
    if normalize_email(&sender) != normalize_email(&requester.email) {
        warn!(
            "inbound email sender mismatch on ticket #{}",
            ticket.ticket_number
        );
        return Ok(InboundOutcome::Rejected("sender_mismatch"));
    }

    let content = extract_reply(&payload.text);
    if is_empty_reply(&content) {
        return Ok(InboundOutcome::Ignored("empty_content"));
    }
    let body_html = plain_to_html(&content);
    let message_id = parse_message_id(payload.headers.as_deref());

    if ticket.status_enum() == TicketStatus::Closed {
        // Closed tickets never reopen by email; the reply becomes a fresh
        // follow-up ticket and the original only gets a provenance note.
        // The follow-up, the note and its activity row commit together.
        let (follow_up, jobs) = conn.transaction::<_, ApiError, _>(|conn| {
            let (follow_up, jobs) = lifecycle::create_ticket(
                conn,
                &state.config,
                NewTicketInput {
                    subject: format!("Follow-up: {}", ticket.subject),
                    body: body_html,
                    body_plain: content,
                    requester_id: requester.id,
                    channel: TicketChannel::Email,
                    priority: TicketPriority::Normal,
                    form_id: ticket.form_id,
                    category: ticket.category.clone(),
                    related_ticket_id: Some(ticket.id),
                },
            )?;
            let note = format!(
                "Customer replied by email after this ticket was closed; follow-up ticket #{} was created.",
                follow_up.ticket_number
            );
            insert_comment(
                conn,
                NewComment {
                    ticket_id: ticket.id,
                    author_id: requester.id,
                    body: note.clone(),
                    body_plain: note,
                    is_internal: false,
                    is_system: true,
                    channel: TicketChannel::Email,
                    email_message_id: None,
                    email_from: None,
                },
            )?;
            log_activity(
                conn,
                ticket.id,
                Some(requester.id),
                "follow_up_created",
                json!({ "followUpTicketId": follow_up.id, "followUpTicketNumber": follow_up.ticket_number }),
            )?;
            Ok((follow_up, jobs))
        })?;
        state.mailer.dispatch(jobs);
        info!(
            "inbound email on closed ticket #{} spawned follow-up #{}",
            ticket.ticket_number, follow_up.ticket_number
        );
        return Ok(InboundOutcome::FollowUpCreated);
    }

    let (_, jobs) = lifecycle::apply_reply(
        &mut conn,
        &state.config,
        ticket.id,
        &requester,
        ReplyInput {
            body: body_html,
            body_plain: content.clone(),
            is_internal: false,
            channel: TicketChannel::Email,
            email_message_id: message_id.as_deref(),
            email_from: Some(sender.as_str()),
        },
    )?;
    if let Some(message_id) = &message_id {
        threads::update_last_message_id(&mut conn, thread.id, message_id)?;
    }
    state.mailer.dispatch(jobs);
    info!("inbound email appended to ticket #{}", ticket.ticket_number);

    crate::llm::maybe_spawn_draft(state.clone(), ticket.id, content);
    Ok(InboundOutcome::CommentAdded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_on_wrote_quote_block() {
        let body = "Thanks, that fixed it!\n\nOn Mon, Jan 1 2024 John wrote:\n> original question";
        assert_eq!(extract_reply(body), "Thanks, that fixed it!");
    }

    #[test]
    fn strips_original_message_separator() {
        let body = "Here you go.\n\n-----Original Message-----\nFrom: support\nblah";
        assert_eq!(extract_reply(body), "Here you go.");
    }

    #[test]
    fn strips_forwarded_header_block() {
        let body = "See below.\n\nFrom: Agent <agent@example.com>\nSent: Monday\nTo: me\nSubject: hi\nbody";
        assert_eq!(extract_reply(body), "See below.");
    }

    #[test]
    fn strips_signature_delimiter_and_mobile_signature() {
        assert_eq!(extract_reply("Done.\n\n-- \nAlice"), "Done.");
        assert_eq!(extract_reply("Done.\n\nSent from my iPhone"), "Done.");
    }

    #[test]
    fn strips_leading_quoted_lines_but_keeps_reply() {
        let body = "I agree\n> earlier text\nmore of my reply";
        // Earliest marker is the quoted line; everything from there on goes.
        assert_eq!(extract_reply(body), "I agree");
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(extract_reply("a\n\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn short_extraction_is_empty_content() {
        assert!(is_empty_reply(&extract_reply("> quoted only\n> more")));
        assert!(is_empty_reply(&extract_reply("  \n\n")));
    }

    #[test]
    fn emptiness_counts_characters_not_bytes() {
        // Two bytes but one character.
        assert!(is_empty_reply("é"));
        assert!(is_empty_reply("👍"));
        assert!(!is_empty_reply("ok"));
        assert!(!is_empty_reply("éé"));
    }

    #[test]
    fn parses_both_from_header_forms() {
        assert_eq!(
            parse_sender_address("\"Alice A.\" <alice@example.com>"),
            Some("alice@example.com".to_string()),
        );
        assert_eq!(
            parse_sender_address("alice@example.com"),
            Some("alice@example.com".to_string()),
        );
        assert_eq!(parse_sender_address("not an address"), None);
    }

    #[test]
    fn normalization_strips_plus_tag_and_case() {
        assert_eq!(
            normalize_email("Alice+Support@Gmail.com"),
            normalize_email("alice@gmail.com"),
        );
        assert_eq!(normalize_email("BOB@EXAMPLE.COM"), "bob@example.com");
    }

    #[test]
    fn html_rendering_escapes_entities() {
        assert_eq!(
            plain_to_html("a < b & c\nnext \"line\""),
            "a &lt; b &amp; c<br>next &quot;line&quot;",
        );
    }

    #[test]
    fn message_id_parsed_from_raw_headers() {
        let headers = "Received: somewhere\nMessage-ID: <abc123@mail.example.com>\nSubject: Re: hi\n";
        assert_eq!(
            parse_message_id(Some(headers)),
            Some("<abc123@mail.example.com>".to_string()),
        );
        assert_eq!(parse_message_id(None), None);
    }
}
