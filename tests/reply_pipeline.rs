//! End-to-end checks of the email reply pipeline's pure stages: reply-token
//! routing, quote stripping, sender normalization and the derived status
//! transition, without a database or SMTP server.

use chrono::Utc;
use uuid::Uuid;

use deskserver::email::inbound::{extract_reply, normalize_email, parse_sender_address};
use deskserver::email::outbound::{render, EmailJob, EmailTemplate};
use deskserver::email::threads::{generate_reply_token, parse_reply_token, reply_address};
use deskserver::error::ApiError;
use deskserver::shared::models::{
    Ticket, TicketChannel, TicketPriority, TicketStatus, TicketType, User, UserRole,
};
use deskserver::tickets::lifecycle::{reply_transition, ReplyEffect};
use deskserver::tickets::merge::merge_precheck;

fn ticket(status: TicketStatus) -> Ticket {
    let now = Utc::now();
    Ticket {
        id: Uuid::new_v4(),
        ticket_number: 1042,
        subject: "Printer on fire".to_string(),
        status: status.as_str().to_string(),
        priority: TicketPriority::Normal.as_str().to_string(),
        channel: TicketChannel::Email.as_str().to_string(),
        ticket_type: TicketType::Normal.as_str().to_string(),
        requester_id: Uuid::new_v4(),
        assignee_id: None,
        form_id: None,
        category: None,
        related_ticket_id: None,
        merged_into_id: None,
        problem_id: None,
        first_response_at: None,
        solved_at: None,
        closed_at: None,
        merged_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn requester() -> User {
    User {
        id: Uuid::new_v4(),
        email: "alice@example.com".to_string(),
        name: "Alice".to_string(),
        role: UserRole::User.as_str().to_string(),
        is_blocked: false,
        created_at: Utc::now(),
    }
}

#[test]
fn customer_email_reply_routes_and_reopens_pending_ticket() {
    // The notification carried this reply address; the customer's client
    // answers to it with a quoted copy of the agent's message below.
    let token = generate_reply_token();
    let to = format!("\"Acme Support\" <{}>", reply_address(&token, "tickets.acme.com"));
    assert_eq!(parse_reply_token(&to), Some(token));

    let body = "\
That did the trick, thank you!\r\n\
\r\n\
On Tue, Jun 3 2025 at 9:14 AM, Support Agent <agent@acme.com> wrote:\r\n\
> Could you try turning the printer off and on again?\r\n\
> \r\n\
> Best,\r\n\
> Agent";
    assert_eq!(extract_reply(body), "That did the trick, thank you!");

    let sender = parse_sender_address("Alice A. <Alice+tickets@Example.com>").expect("sender");
    assert_eq!(normalize_email(&sender), normalize_email("alice@example.com"));

    assert_eq!(
        reply_transition(TicketStatus::Pending, UserRole::User, false),
        ReplyEffect::ReopenFromPending,
    );
}

#[test]
fn solved_ticket_reply_reopens_but_closed_does_not() {
    assert_eq!(
        reply_transition(TicketStatus::Solved, UserRole::User, false),
        ReplyEffect::ReopenFromSolved,
    );
    // CLOSED is final for the reply transition; email handling spawns a
    // follow-up ticket instead.
    assert_eq!(
        reply_transition(TicketStatus::Closed, UserRole::User, false),
        ReplyEffect::NoChange,
    );
}

fn precheck_reason(target: &Ticket, sources: &[Ticket]) -> &'static str {
    match merge_precheck(target, sources) {
        Err(ApiError::Validation { reason, .. }) => reason,
        Err(_) => panic!("unexpected error variant"),
        Ok(()) => "ok",
    }
}

#[test]
fn merge_preconditions_enumerate_their_reasons() {
    let target = ticket(TicketStatus::Open);
    assert_eq!(precheck_reason(&target, &[]), "empty_merge");
    assert_eq!(
        precheck_reason(&target, &[target.clone()]),
        "merge_source_is_target",
    );
    assert_eq!(
        precheck_reason(&target, &[ticket(TicketStatus::Solved)]),
        "merge_source_terminal",
    );
    assert_eq!(
        precheck_reason(&ticket(TicketStatus::Closed), &[ticket(TicketStatus::Open)]),
        "merge_target_terminal",
    );
    assert_eq!(
        precheck_reason(&target, &[ticket(TicketStatus::Open), ticket(TicketStatus::Pending)]),
        "ok",
    );

    let mut merged_source = ticket(TicketStatus::Open);
    merged_source.merged_into_id = Some(Uuid::new_v4());
    assert_eq!(precheck_reason(&target, &[merged_source]), "merge_source_terminal");
}

#[test]
fn agent_reply_notification_renders_with_thread_reply_address() {
    let ticket = ticket(TicketStatus::Open);
    let requester = requester();
    let token = generate_reply_token();
    let reply = reply_address(&token, "tickets.acme.com");

    let job = EmailJob::for_ticket(
        EmailTemplate::AgentReply,
        &ticket,
        &requester,
        "https://support.acme.com",
        Some(reply.clone()),
    )
    .with_agent_name("Sam");

    assert_eq!(job.to, "alice@example.com");
    assert_eq!(job.reply_to.as_deref(), Some(reply.as_str()));
    let body = render(
        "Hi {userName}, {agentName} replied to #{ticketNumber}: {ticketUrl}",
        &job.placeholders,
    );
    assert_eq!(
        body,
        format!(
            "Hi Alice, Sam replied to #1042: https://support.acme.com/tickets/{}",
            ticket.id
        ),
    );
}
