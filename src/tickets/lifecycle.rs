//! Ticket lifecycle engine.
//!
//! Every status transition in the system funnels through here, whether it
//! originates from an agent in the UI, a partner API call, an inbound email
//! or the hourly automation. Each operation is a named command applied
//! inside a single transaction with its activity record, so a status change
//! without its audit row can never be observed.

use chrono::{Duration, Utc};
use diesel::prelude::*;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::email::outbound::{EmailJob, EmailTemplate};
use crate::email::threads;
use crate::error::ApiError;
use crate::shared::models::{
    BacklogSnapshot, Ticket, TicketActivity, TicketChannel, TicketComment, TicketPriority,
    TicketStatus, TicketType, User, UserRole,
};
use crate::shared::schema::{backlog_snapshots, ticket_activities, ticket_comments, tickets, users};
use crate::shared::utils::next_ticket_number;

pub fn load_ticket(conn: &mut PgConnection, ticket_id: Uuid) -> Result<Ticket, ApiError> {
    tickets::table
        .filter(tickets::id.eq(ticket_id))
        .first::<Ticket>(conn)
        .optional()?
        .ok_or(ApiError::NotFound("ticket"))
}

pub fn load_user(conn: &mut PgConnection, user_id: Uuid) -> Result<User, ApiError> {
    users::table
        .filter(users::id.eq(user_id))
        .first::<User>(conn)
        .optional()?
        .ok_or(ApiError::NotFound("user"))
}

pub fn log_activity(
    conn: &mut PgConnection,
    ticket_id: Uuid,
    actor_id: Option<Uuid>,
    action: &str,
    details: serde_json::Value,
) -> QueryResult<()> {
    let activity = TicketActivity {
        id: Uuid::new_v4(),
        ticket_id,
        actor_id,
        action: action.to_string(),
        details,
        created_at: Utc::now(),
    };
    diesel::insert_into(ticket_activities::table)
        .values(&activity)
        .execute(conn)?;
    Ok(())
}

pub struct NewComment<'a> {
    pub ticket_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub body_plain: String,
    pub is_internal: bool,
    pub is_system: bool,
    pub channel: TicketChannel,
    pub email_message_id: Option<&'a str>,
    pub email_from: Option<&'a str>,
}

pub fn insert_comment(conn: &mut PgConnection, new: NewComment) -> QueryResult<TicketComment> {
    let comment = TicketComment {
        id: Uuid::new_v4(),
        ticket_id: new.ticket_id,
        author_id: new.author_id,
        body: new.body,
        body_plain: new.body_plain,
        is_internal: new.is_internal,
        is_system: new.is_system,
        channel: new.channel.as_str().to_string(),
        email_message_id: new.email_message_id.map(str::to_string),
        email_from: new.email_from.map(str::to_string),
        created_at: Utc::now(),
    };
    diesel::insert_into(ticket_comments::table)
        .values(&comment)
        .execute(conn)?;
    Ok(comment)
}

/// Builds a conversation email for the ticket's thread: reply-to routed at
/// the thread token, In-Reply-To pointing at the last message seen on the
/// thread, and the new Message-ID recorded so the next message in either
/// direction references this one.
fn conversation_job(
    conn: &mut PgConnection,
    config: &AppConfig,
    template: EmailTemplate,
    ticket: &Ticket,
    requester: &User,
) -> Result<EmailJob, ApiError> {
    let thread = threads::get_or_create_thread(conn, ticket.id)?;
    let reply = threads::reply_address(&thread.reply_token, &config.inbound_domain);
    let message_id = threads::new_message_id(&config.inbound_domain);
    let job = EmailJob::for_ticket(template, ticket, requester, &config.base_url, Some(reply))
        .with_threading(&message_id, thread.last_message_id.as_deref());
    threads::update_last_message_id(conn, thread.id, &message_id)?;
    Ok(job)
}

/// Resolved + feedback-request emails queued whenever a ticket reaches
/// SOLVED, addressed to the requester with the thread reply address set so
/// an emailed "that didn't fix it" reopens the ticket.
pub fn resolution_email_jobs(
    conn: &mut PgConnection,
    config: &AppConfig,
    ticket: &Ticket,
) -> Result<Vec<EmailJob>, ApiError> {
    let requester = load_user(conn, ticket.requester_id)?;
    Ok(vec![
        conversation_job(conn, config, EmailTemplate::TicketResolved, ticket, &requester)?,
        EmailJob::for_ticket(
            EmailTemplate::FeedbackRequest,
            ticket,
            &requester,
            &config.base_url,
            None,
        ),
    ])
}

/// Applies an explicit status change. Setting the current status again is
/// allowed and still stamps `updated_at` and writes the activity row; the
/// audit trail records every request, not just effective transitions.
pub fn apply_status_change(
    conn: &mut PgConnection,
    config: &AppConfig,
    ticket_id: Uuid,
    new_status: TicketStatus,
    actor_id: Uuid,
) -> Result<(Ticket, Vec<EmailJob>), ApiError> {
    let now = Utc::now();
    let (ticket, mut jobs) = conn.transaction::<_, ApiError, _>(|conn| {
        let mut ticket = load_ticket(conn, ticket_id)?;
        if ticket.is_merged() {
            return Err(ApiError::validation(
                "ticket_merged",
                "merged tickets cannot be modified",
            ));
        }

        ticket.status = new_status.as_str().to_string();
        ticket.updated_at = now;
        let mut jobs = Vec::new();
        match new_status {
            TicketStatus::Solved => {
                ticket.solved_at = Some(now);
                jobs = resolution_email_jobs(conn, config, &ticket)?;
            }
            TicketStatus::Closed => {
                ticket.closed_at = Some(now);
            }
            _ => {}
        }

        diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
            .set((
                tickets::status.eq(&ticket.status),
                tickets::solved_at.eq(ticket.solved_at),
                tickets::closed_at.eq(ticket.closed_at),
                tickets::updated_at.eq(now),
            ))
            .execute(conn)?;
        log_activity(
            conn,
            ticket_id,
            Some(actor_id),
            "status_changed",
            json!({ "newStatus": new_status.as_str() }),
        )?;
        Ok((ticket, jobs))
    })?;

    // Solving a PROBLEM sweeps its open incidents. Runs outside the main
    // transaction so one incident failing cannot undo the problem's own
    // status change; each incident commits independently.
    if solve_cascades_to_incidents(new_status, ticket.type_enum()) {
        jobs.extend(crate::tickets::merge::cascade_problem_solved(
            conn,
            config,
            &ticket,
            Some(actor_id),
        ));
    }

    Ok((ticket, jobs))
}

/// Assigns (or unassigns) a ticket. Assignees must hold a staff role. When
/// the ticket is still NEW and the caller did not also request an explicit
/// status, taking assignment opens it.
pub fn apply_assignment(
    conn: &mut PgConnection,
    ticket_id: Uuid,
    assignee_id: Option<Uuid>,
    actor_id: Uuid,
    explicit_status: Option<TicketStatus>,
) -> Result<Ticket, ApiError> {
    let now = Utc::now();
    conn.transaction::<_, ApiError, _>(|conn| {
        let mut ticket = load_ticket(conn, ticket_id)?;
        if ticket.is_merged() {
            return Err(ApiError::validation(
                "ticket_merged",
                "merged tickets cannot be modified",
            ));
        }
        if let Some(assignee_id) = assignee_id {
            let assignee = load_user(conn, assignee_id)?;
            if !assignee.role_enum().is_staff() {
                return Err(ApiError::validation(
                    "assignee_not_agent",
                    "assignee must have the AGENT or ADMIN role",
                ));
            }
        }

        ticket.assignee_id = assignee_id;
        if assignee_id.is_some()
            && ticket.status_enum() == TicketStatus::New
            && explicit_status.is_none()
        {
            ticket.status = TicketStatus::Open.as_str().to_string();
        }
        ticket.updated_at = now;

        diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
            .set((
                tickets::assignee_id.eq(ticket.assignee_id),
                tickets::status.eq(&ticket.status),
                tickets::updated_at.eq(now),
            ))
            .execute(conn)?;
        log_activity(
            conn,
            ticket_id,
            Some(actor_id),
            "assignment_changed",
            json!({ "assigneeId": ticket.assignee_id }),
        )?;
        Ok(ticket)
    })
}

/// Whether reaching `new_status` fans out to linked incidents. Every path
/// that sets a ticket SOLVED, manual or automated, consults this rule.
pub fn solve_cascades_to_incidents(new_status: TicketStatus, ticket_type: TicketType) -> bool {
    new_status == TicketStatus::Solved && ticket_type == TicketType::Problem
}

/// The derived status effect of posting a reply. Kept as a standalone rule
/// so the transition logic is testable without a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyEffect {
    /// Agent answered publicly: ticket waits on the customer.
    AgentResponded,
    /// Customer answered while the ticket waited on them.
    ReopenFromPending,
    /// Customer answered a solved ticket: reopen and clear `solved_at`.
    ReopenFromSolved,
    NoChange,
}

pub fn reply_transition(
    status: TicketStatus,
    author_role: UserRole,
    is_internal: bool,
) -> ReplyEffect {
    if is_internal {
        return ReplyEffect::NoChange;
    }
    if author_role.is_staff() {
        if status.is_terminal() {
            ReplyEffect::NoChange
        } else {
            ReplyEffect::AgentResponded
        }
    } else {
        match status {
            TicketStatus::Pending => ReplyEffect::ReopenFromPending,
            TicketStatus::Solved => ReplyEffect::ReopenFromSolved,
            _ => ReplyEffect::NoChange,
        }
    }
}

pub struct ReplyInput<'a> {
    pub body: String,
    pub body_plain: String,
    pub is_internal: bool,
    pub channel: TicketChannel,
    pub email_message_id: Option<&'a str>,
    pub email_from: Option<&'a str>,
}

/// Posts a reply and applies the derived transition. Customers can never
/// create internal comments; the flag is silently coerced off rather than
/// rejected so older clients keep working.
pub fn apply_reply(
    conn: &mut PgConnection,
    config: &AppConfig,
    ticket_id: Uuid,
    author: &User,
    input: ReplyInput,
) -> Result<(TicketComment, Vec<EmailJob>), ApiError> {
    let now = Utc::now();
    conn.transaction::<_, ApiError, _>(|conn| {
        let ticket = load_ticket(conn, ticket_id)?;
        if ticket.is_merged() {
            return Err(ApiError::validation(
                "ticket_merged",
                "merged tickets cannot be modified",
            ));
        }

        let author_role = author.role_enum();
        let is_internal = input.is_internal && author_role.is_staff();
        let comment = insert_comment(
            conn,
            NewComment {
                ticket_id,
                author_id: author.id,
                body: input.body,
                body_plain: input.body_plain,
                is_internal,
                is_system: false,
                channel: input.channel,
                email_message_id: input.email_message_id,
                email_from: input.email_from,
            },
        )?;

        let mut jobs = Vec::new();
        match reply_transition(ticket.status_enum(), author_role, is_internal) {
            ReplyEffect::AgentResponded => {
                let first_response_at = ticket.first_response_at.or(Some(now));
                diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
                    .set((
                        tickets::status.eq(TicketStatus::Pending.as_str()),
                        tickets::first_response_at.eq(first_response_at),
                        tickets::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                let requester = load_user(conn, ticket.requester_id)?;
                jobs.push(
                    conversation_job(conn, config, EmailTemplate::AgentReply, &ticket, &requester)?
                        .with_agent_name(&author.name),
                );
            }
            ReplyEffect::ReopenFromPending => {
                diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
                    .set((
                        tickets::status.eq(TicketStatus::Open.as_str()),
                        tickets::updated_at.eq(now),
                    ))
                    .execute(conn)?;
            }
            ReplyEffect::ReopenFromSolved => {
                diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
                    .set((
                        tickets::status.eq(TicketStatus::Open.as_str()),
                        tickets::solved_at.eq(None::<chrono::DateTime<Utc>>),
                        tickets::updated_at.eq(now),
                    ))
                    .execute(conn)?;
            }
            ReplyEffect::NoChange => {
                diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
                    .set(tickets::updated_at.eq(now))
                    .execute(conn)?;
            }
        }

        log_activity(
            conn,
            ticket_id,
            Some(author.id),
            "comment_added",
            json!({ "commentId": comment.id, "isInternal": is_internal }),
        )?;
        Ok((comment, jobs))
    })
}

pub struct NewTicketInput {
    pub subject: String,
    pub body: String,
    pub body_plain: String,
    pub requester_id: Uuid,
    pub channel: TicketChannel,
    pub priority: TicketPriority,
    pub form_id: Option<Uuid>,
    pub category: Option<String>,
    pub related_ticket_id: Option<Uuid>,
}

/// Shared create path for all three entry points (web form, partner API,
/// email follow-up). Ticket, first comment, email thread and activity are
/// one atomic unit.
pub fn create_ticket(
    conn: &mut PgConnection,
    config: &AppConfig,
    input: NewTicketInput,
) -> Result<(Ticket, Vec<EmailJob>), ApiError> {
    let now = Utc::now();
    conn.transaction::<_, ApiError, _>(|conn| {
        let requester = load_user(conn, input.requester_id)?;
        let ticket = Ticket {
            id: Uuid::new_v4(),
            ticket_number: next_ticket_number(conn)?,
            subject: input.subject,
            status: TicketStatus::New.as_str().to_string(),
            priority: input.priority.as_str().to_string(),
            channel: input.channel.as_str().to_string(),
            ticket_type: TicketType::Normal.as_str().to_string(),
            requester_id: requester.id,
            assignee_id: None,
            form_id: input.form_id,
            category: input.category,
            related_ticket_id: input.related_ticket_id,
            merged_into_id: None,
            problem_id: None,
            first_response_at: None,
            solved_at: None,
            closed_at: None,
            merged_at: None,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(tickets::table)
            .values(&ticket)
            .execute(conn)?;

        insert_comment(
            conn,
            NewComment {
                ticket_id: ticket.id,
                author_id: requester.id,
                body: input.body,
                body_plain: input.body_plain,
                is_internal: false,
                is_system: false,
                channel: input.channel,
                email_message_id: None,
                email_from: None,
            },
        )?;
        log_activity(
            conn,
            ticket.id,
            Some(requester.id),
            "ticket_created",
            json!({ "channel": input.channel.as_str() }),
        )?;

        let jobs = vec![conversation_job(
            conn,
            config,
            EmailTemplate::TicketCreated,
            &ticket,
            &requester,
        )?];
        Ok((ticket, jobs))
    })
}

/// Hourly sweep: PENDING tickets whose latest human comment came from staff
/// and has aged past the threshold are considered answered and move to
/// SOLVED. Per-ticket failures are logged and skipped so one bad row cannot
/// stall the sweep. Returns the solve count and the email jobs queued by
/// problem cascades, for dispatch after the sweep.
pub fn run_auto_solve(
    conn: &mut PgConnection,
    config: &AppConfig,
    threshold_hours: i32,
) -> Result<(usize, Vec<EmailJob>), ApiError> {
    let cutoff = Utc::now() - Duration::hours(i64::from(threshold_hours));
    let pending: Vec<Ticket> = tickets::table
        .filter(tickets::status.eq(TicketStatus::Pending.as_str()))
        .filter(tickets::merged_into_id.is_null())
        .load(conn)?;

    let mut solved = 0;
    let mut jobs = Vec::new();
    for ticket in pending {
        match auto_solve_ticket(conn, config, &ticket, cutoff) {
            Ok(Some(ticket_jobs)) => {
                solved += 1;
                jobs.extend(ticket_jobs);
            }
            Ok(None) => {}
            Err(e) => error!("auto-solve failed for ticket #{}: {e}", ticket.ticket_number),
        }
    }
    if solved > 0 {
        info!("auto-solve transitioned {solved} tickets");
    }
    Ok((solved, jobs))
}

fn auto_solve_ticket(
    conn: &mut PgConnection,
    config: &AppConfig,
    ticket: &Ticket,
    cutoff: chrono::DateTime<Utc>,
) -> Result<Option<Vec<EmailJob>>, ApiError> {
    // System notes don't count as awaiting a response.
    let last_comment = ticket_comments::table
        .filter(ticket_comments::ticket_id.eq(ticket.id))
        .filter(ticket_comments::is_system.eq(false))
        .order(ticket_comments::created_at.desc())
        .first::<TicketComment>(conn)
        .optional()?;
    let Some(last_comment) = last_comment else {
        return Ok(None);
    };
    if last_comment.created_at >= cutoff || last_comment.author_id == ticket.requester_id {
        return Ok(None);
    }
    let author = load_user(conn, last_comment.author_id)?;
    if !author.role_enum().is_staff() {
        return Ok(None);
    }

    let now = Utc::now();
    conn.transaction::<_, ApiError, _>(|conn| {
        diesel::update(tickets::table.filter(tickets::id.eq(ticket.id)))
            .set((
                tickets::status.eq(TicketStatus::Solved.as_str()),
                tickets::solved_at.eq(Some(now)),
                tickets::updated_at.eq(now),
            ))
            .execute(conn)?;
        log_activity(
            conn,
            ticket.id,
            None,
            "status_changed",
            json!({ "newStatus": TicketStatus::Solved.as_str(), "reason": "auto_solve" }),
        )?;
        Ok(())
    })?;

    // An auto-solved PROBLEM sweeps its incidents the same as a manual
    // solve; runs after the commit, each incident isolated.
    let mut jobs = Vec::new();
    if solve_cascades_to_incidents(TicketStatus::Solved, ticket.type_enum()) {
        jobs = crate::tickets::merge::cascade_problem_solved(conn, config, ticket, None);
    }
    Ok(Some(jobs))
}

/// Hourly sweep: SOLVED tickets past the close threshold are bulk-closed,
/// with one activity row per ticket, as a single unit.
pub fn run_auto_close(conn: &mut PgConnection, threshold_hours: i32) -> Result<usize, ApiError> {
    let cutoff = Utc::now() - Duration::hours(i64::from(threshold_hours));
    let now = Utc::now();
    let closed_ids = conn.transaction::<Vec<Uuid>, ApiError, _>(|conn| {
        let ids: Vec<Uuid> = diesel::update(
            tickets::table
                .filter(tickets::status.eq(TicketStatus::Solved.as_str()))
                .filter(tickets::solved_at.lt(cutoff))
                .filter(tickets::merged_into_id.is_null()),
        )
        .set((
            tickets::status.eq(TicketStatus::Closed.as_str()),
            tickets::closed_at.eq(Some(now)),
            tickets::updated_at.eq(now),
        ))
        .returning(tickets::id)
        .get_results(conn)?;

        for ticket_id in &ids {
            log_activity(
                conn,
                *ticket_id,
                None,
                "status_changed",
                json!({ "newStatus": TicketStatus::Closed.as_str(), "reason": "auto_close" }),
            )?;
        }
        Ok(ids)
    })?;
    if !closed_ids.is_empty() {
        info!("auto-close closed {} tickets", closed_ids.len());
    }
    Ok(closed_ids.len())
}

/// Daily backlog snapshot keyed by UTC calendar date. Upsert semantics make
/// re-running within the same day safe: the second run updates the row.
pub fn capture_backlog_snapshot(conn: &mut PgConnection) -> Result<BacklogSnapshot, ApiError> {
    use diesel::dsl::count_star;

    let counts: Vec<(String, i64)> = tickets::table
        .filter(tickets::status.ne_all(vec![
            TicketStatus::Solved.as_str(),
            TicketStatus::Closed.as_str(),
        ]))
        .group_by(tickets::status)
        .select((tickets::status, count_star()))
        .load(conn)?;
    let count_for = |status: TicketStatus| -> i32 {
        counts
            .iter()
            .find(|(s, _)| s == status.as_str())
            .map(|(_, n)| *n as i32)
            .unwrap_or(0)
    };

    let now = Utc::now();
    let snapshot = BacklogSnapshot {
        id: Uuid::new_v4(),
        snapshot_date: now.date_naive(),
        new_count: count_for(TicketStatus::New),
        open_count: count_for(TicketStatus::Open),
        pending_count: count_for(TicketStatus::Pending),
        on_hold_count: count_for(TicketStatus::OnHold),
        created_at: now,
    };
    diesel::insert_into(backlog_snapshots::table)
        .values(&snapshot)
        .on_conflict(backlog_snapshots::snapshot_date)
        .do_update()
        .set((
            backlog_snapshots::new_count.eq(snapshot.new_count),
            backlog_snapshots::open_count.eq(snapshot.open_count),
            backlog_snapshots::pending_count.eq(snapshot.pending_count),
            backlog_snapshots::on_hold_count.eq(snapshot.on_hold_count),
        ))
        .execute(conn)?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_solve_path_cascades_problems_only() {
        // Manual status changes and the hourly auto-solve sweep both apply
        // this rule before fanning out to incidents.
        assert!(solve_cascades_to_incidents(TicketStatus::Solved, TicketType::Problem));
        assert!(!solve_cascades_to_incidents(TicketStatus::Solved, TicketType::Incident));
        assert!(!solve_cascades_to_incidents(TicketStatus::Solved, TicketType::Normal));
        assert!(!solve_cascades_to_incidents(TicketStatus::Closed, TicketType::Problem));
        assert!(!solve_cascades_to_incidents(TicketStatus::Pending, TicketType::Problem));
    }

    #[test]
    fn agent_public_reply_moves_ticket_to_pending() {
        for status in [TicketStatus::New, TicketStatus::Open, TicketStatus::Pending, TicketStatus::OnHold] {
            assert_eq!(
                reply_transition(status, UserRole::Agent, false),
                ReplyEffect::AgentResponded,
            );
        }
    }

    #[test]
    fn agent_reply_on_terminal_ticket_changes_nothing() {
        assert_eq!(
            reply_transition(TicketStatus::Solved, UserRole::Agent, false),
            ReplyEffect::NoChange,
        );
        assert_eq!(
            reply_transition(TicketStatus::Closed, UserRole::Admin, false),
            ReplyEffect::NoChange,
        );
    }

    #[test]
    fn internal_note_never_transitions() {
        assert_eq!(
            reply_transition(TicketStatus::Open, UserRole::Agent, true),
            ReplyEffect::NoChange,
        );
        assert_eq!(
            reply_transition(TicketStatus::Pending, UserRole::Admin, true),
            ReplyEffect::NoChange,
        );
    }

    #[test]
    fn customer_reply_reopens_pending_and_solved() {
        assert_eq!(
            reply_transition(TicketStatus::Pending, UserRole::User, false),
            ReplyEffect::ReopenFromPending,
        );
        assert_eq!(
            reply_transition(TicketStatus::Solved, UserRole::User, false),
            ReplyEffect::ReopenFromSolved,
        );
    }

    #[test]
    fn customer_reply_on_open_or_closed_is_a_plain_comment() {
        assert_eq!(
            reply_transition(TicketStatus::Open, UserRole::User, false),
            ReplyEffect::NoChange,
        );
        // CLOSED reopening is the email processor's follow-up path, not a
        // status transition here.
        assert_eq!(
            reply_transition(TicketStatus::Closed, UserRole::User, false),
            ReplyEffect::NoChange,
        );
    }
}
