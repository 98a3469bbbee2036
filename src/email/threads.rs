use chrono::Utc;
use diesel::prelude::*;
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use uuid::Uuid;

use crate::shared::models::EmailThread;
use crate::shared::schema::email_threads;

static REPLY_ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"reply\+([0-9a-f]{64})@").expect("reply address regex"));

/// Generates the per-ticket reply token: 32 random bytes, hex-encoded. The
/// token is a bearer capability; it is never rotated once issued.
pub fn generate_reply_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Formats the inbound routing address for a thread token.
pub fn reply_address(token: &str, domain: &str) -> String {
    format!("reply+{token}@{domain}")
}

/// Message-ID for an outbound conversation email. Recorded on the thread
/// so the next message in either direction can reference it.
pub fn new_message_id(domain: &str) -> String {
    format!("<{}@{}>", Uuid::new_v4(), domain)
}

/// Pulls the reply token out of a recipient field. The field may carry
/// display names or several addresses; the first token-shaped match wins.
pub fn parse_reply_token(to: &str) -> Option<String> {
    REPLY_ADDRESS_RE
        .captures(&to.to_lowercase())
        .map(|caps| caps[1].to_string())
}

/// Fetches the ticket's email thread, creating it on first use.
pub fn get_or_create_thread(
    conn: &mut PgConnection,
    ticket_id: Uuid,
) -> QueryResult<EmailThread> {
    let existing = email_threads::table
        .filter(email_threads::ticket_id.eq(ticket_id))
        .first::<EmailThread>(conn)
        .optional()?;
    if let Some(thread) = existing {
        return Ok(thread);
    }
    let now = Utc::now();
    let thread = EmailThread {
        id: Uuid::new_v4(),
        ticket_id,
        reply_token: generate_reply_token(),
        last_message_id: None,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(email_threads::table)
        .values(&thread)
        .execute(conn)?;
    Ok(thread)
}

pub fn find_thread_by_token(
    conn: &mut PgConnection,
    token: &str,
) -> QueryResult<Option<EmailThread>> {
    email_threads::table
        .filter(email_threads::reply_token.eq(token))
        .first::<EmailThread>(conn)
        .optional()
}

/// Records the most recent message id seen on the thread. Last writer wins;
/// the value only feeds In-Reply-To/References headers on the next send.
pub fn update_last_message_id(
    conn: &mut PgConnection,
    thread_id: Uuid,
    message_id: &str,
) -> QueryResult<()> {
    diesel::update(email_threads::table.filter(email_threads::id.eq(thread_id)))
        .set((
            email_threads::last_message_id.eq(Some(message_id.to_string())),
            email_threads::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_64_hex_chars() {
        let token = generate_reply_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn reply_address_round_trips() {
        let token = generate_reply_token();
        let addr = reply_address(&token, "tickets.example.com");
        assert_eq!(parse_reply_token(&addr), Some(token));
    }

    #[test]
    fn token_found_inside_display_name_form() {
        let token = "ab".repeat(32);
        let to = format!("\"Support\" <reply+{token}@tickets.example.com>, ops@example.com");
        assert_eq!(parse_reply_token(&to), Some(token));
    }

    #[test]
    fn message_ids_are_angle_bracketed_and_unique() {
        let a = new_message_id("tickets.example.com");
        let b = new_message_id("tickets.example.com");
        assert!(a.starts_with('<') && a.ends_with("@tickets.example.com>"));
        assert_ne!(a, b);
    }

    #[test]
    fn short_or_missing_tokens_are_ignored() {
        assert_eq!(parse_reply_token("support@tickets.example.com"), None);
        assert_eq!(parse_reply_token("reply+abc123@tickets.example.com"), None);
    }
}
