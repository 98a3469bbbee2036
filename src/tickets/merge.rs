//! Duplicate-ticket merging and problem/incident linking.
//!
//! Merges collapse duplicates without losing the audit trail: sources close
//! with a pointer to the target, both sides get system comments, and the
//! whole effect is one transaction. Problem tickets fan their resolution
//! out to linked incidents.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::Identity;
use crate::config::AppConfig;
use crate::email::outbound::EmailJob;
use crate::error::ApiError;
use crate::shared::models::{
    Ticket, TicketChannel, TicketComment, TicketPriority, TicketStatus, TicketType, UserRole,
};
use crate::shared::schema::{ticket_comments, tickets};
use crate::tickets::lifecycle::{
    insert_comment, load_ticket, log_activity, resolution_email_jobs, NewComment,
};

/// Merge preconditions that depend only on ticket state. Split out so the
/// rules are testable without a store.
pub fn merge_precheck(target: &Ticket, sources: &[Ticket]) -> Result<(), ApiError> {
    if sources.is_empty() {
        return Err(ApiError::validation(
            "empty_merge",
            "at least one source ticket is required",
        ));
    }
    if target.status_enum().is_terminal() || target.is_merged() {
        return Err(ApiError::validation(
            "merge_target_terminal",
            "cannot merge into a solved or closed ticket",
        ));
    }
    for source in sources {
        if source.id == target.id {
            return Err(ApiError::validation(
                "merge_source_is_target",
                "a ticket cannot be merged into itself",
            ));
        }
        if source.status_enum().is_terminal() || source.is_merged() {
            return Err(ApiError::validation(
                "merge_source_terminal",
                format!("ticket #{} is already solved or closed", source.ticket_number),
            ));
        }
    }
    Ok(())
}

/// Merges the source tickets into the target as a single atomic unit.
/// Cross-requester merges are an admin-only operation.
pub fn merge_tickets(
    conn: &mut PgConnection,
    target_id: Uuid,
    source_ids: &[Uuid],
    actor: Identity,
    note: Option<String>,
) -> Result<Ticket, ApiError> {
    let now = Utc::now();
    conn.transaction::<_, ApiError, _>(|conn| {
        let target = load_ticket(conn, target_id)?;
        let mut sources = Vec::with_capacity(source_ids.len());
        for source_id in source_ids {
            sources.push(load_ticket(conn, *source_id)?);
        }
        merge_precheck(&target, &sources)?;

        let requesters_differ = sources.iter().any(|s| s.requester_id != target.requester_id);
        if requesters_differ && actor.role != UserRole::Admin {
            return Err(ApiError::validation(
                "merge_requires_admin",
                "merging tickets from different requesters requires admin privileges",
            ));
        }

        for source in &sources {
            diesel::update(tickets::table.filter(tickets::id.eq(source.id)))
                .set((
                    tickets::status.eq(TicketStatus::Closed.as_str()),
                    tickets::merged_into_id.eq(Some(target.id)),
                    tickets::merged_at.eq(Some(now)),
                    tickets::closed_at.eq(Some(now)),
                    tickets::updated_at.eq(now),
                ))
                .execute(conn)?;
            let body = format!(
                "This ticket was closed and merged into ticket #{}.",
                target.ticket_number
            );
            insert_comment(
                conn,
                NewComment {
                    ticket_id: source.id,
                    author_id: actor.user_id,
                    body: body.clone(),
                    body_plain: body,
                    is_internal: false,
                    is_system: true,
                    channel: TicketChannel::Internal,
                    email_message_id: None,
                    email_from: None,
                },
            )?;
            log_activity(
                conn,
                source.id,
                Some(actor.user_id),
                "merged_into",
                json!({ "targetTicketId": target.id, "targetTicketNumber": target.ticket_number }),
            )?;
        }

        let merged_numbers = sources
            .iter()
            .map(|s| format!("#{}", s.ticket_number))
            .collect::<Vec<_>>()
            .join(", ");
        let mut body = format!("Merged {merged_numbers} into this ticket.");
        if let Some(note) = &note {
            body.push_str("\n\n");
            body.push_str(note);
        }
        insert_comment(
            conn,
            NewComment {
                ticket_id: target.id,
                author_id: actor.user_id,
                body: body.clone(),
                body_plain: body,
                is_internal: true,
                is_system: true,
                channel: TicketChannel::Internal,
                email_message_id: None,
                email_from: None,
            },
        )?;
        if requesters_differ {
            let requester_ids = sources
                .iter()
                .map(|s| s.requester_id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let body = format!(
                "Merged tickets had different requesters than this ticket: {requester_ids}."
            );
            insert_comment(
                conn,
                NewComment {
                    ticket_id: target.id,
                    author_id: actor.user_id,
                    body: body.clone(),
                    body_plain: body,
                    is_internal: true,
                    is_system: true,
                    channel: TicketChannel::Internal,
                    email_message_id: None,
                    email_from: None,
                },
            )?;
        }
        log_activity(
            conn,
            target.id,
            Some(actor.user_id),
            "merge_completed",
            json!({
                "sourceTicketNumbers": sources.iter().map(|s| s.ticket_number).collect::<Vec<_>>()
            }),
        )?;

        diesel::update(tickets::table.filter(tickets::id.eq(target.id)))
            .set(tickets::updated_at.eq(now))
            .execute(conn)?;
        load_ticket(conn, target.id)
    })
}

/// Changes a ticket's type. PROBLEM and INCIDENT tickets are always urgent;
/// leaving INCIDENT severs any problem link.
pub fn set_ticket_type(
    conn: &mut PgConnection,
    ticket_id: Uuid,
    new_type: TicketType,
    actor_id: Uuid,
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

        ticket.ticket_type = new_type.as_str().to_string();
        if matches!(new_type, TicketType::Problem | TicketType::Incident) {
            ticket.priority = TicketPriority::Urgent.as_str().to_string();
        }
        if new_type != TicketType::Incident {
            ticket.problem_id = None;
        }
        ticket.updated_at = now;

        diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
            .set((
                tickets::ticket_type.eq(&ticket.ticket_type),
                tickets::priority.eq(&ticket.priority),
                tickets::problem_id.eq(ticket.problem_id),
                tickets::updated_at.eq(now),
            ))
            .execute(conn)?;
        log_activity(
            conn,
            ticket_id,
            Some(actor_id),
            "type_changed",
            json!({ "newType": new_type.as_str() }),
        )?;
        Ok(ticket)
    })
}

/// Links an incident to a problem, or clears the link with `None`. The link
/// target is validated to actually be a PROBLEM at link time.
pub fn link_incident_to_problem(
    conn: &mut PgConnection,
    incident_id: Uuid,
    problem_id: Option<Uuid>,
    actor_id: Uuid,
) -> Result<Ticket, ApiError> {
    let now = Utc::now();
    conn.transaction::<_, ApiError, _>(|conn| {
        let incident = load_ticket(conn, incident_id)?;
        if incident.type_enum() != TicketType::Incident {
            return Err(ApiError::validation(
                "not_an_incident",
                "only INCIDENT tickets can be linked to a problem",
            ));
        }
        if let Some(problem_id) = problem_id {
            let problem = load_ticket(conn, problem_id)?;
            if problem.type_enum() != TicketType::Problem {
                return Err(ApiError::validation(
                    "link_target_not_problem",
                    format!("ticket #{} is not a PROBLEM ticket", problem.ticket_number),
                ));
            }
        }

        diesel::update(tickets::table.filter(tickets::id.eq(incident_id)))
            .set((
                tickets::problem_id.eq(problem_id),
                tickets::updated_at.eq(now),
            ))
            .execute(conn)?;
        log_activity(
            conn,
            incident_id,
            Some(actor_id),
            "problem_link_changed",
            json!({ "problemId": problem_id }),
        )?;
        load_ticket(conn, incident_id)
    })
}

/// Fans a solved problem out to its open incidents. Each incident commits
/// in its own transaction and failures are logged and skipped, so one
/// corrupt incident cannot block the rest of the cascade.
pub fn cascade_problem_solved(
    conn: &mut PgConnection,
    config: &AppConfig,
    problem: &Ticket,
    actor_id: Option<Uuid>,
) -> Vec<EmailJob> {
    let resolution = match ticket_comments::table
        .filter(ticket_comments::ticket_id.eq(problem.id))
        .filter(ticket_comments::is_internal.eq(false))
        .filter(ticket_comments::is_system.eq(false))
        .order(ticket_comments::created_at.desc())
        .first::<TicketComment>(conn)
        .optional()
    {
        Ok(comment) => comment,
        Err(e) => {
            error!(
                "cascade aborted: failed to load resolution comment for problem #{}: {e}",
                problem.ticket_number
            );
            return Vec::new();
        }
    };

    let incidents: Vec<Ticket> = match tickets::table
        .filter(tickets::problem_id.eq(problem.id))
        .filter(tickets::status.ne_all(vec![
            TicketStatus::Solved.as_str(),
            TicketStatus::Closed.as_str(),
        ]))
        .load(conn)
    {
        Ok(incidents) => incidents,
        Err(e) => {
            error!(
                "cascade aborted: failed to list incidents for problem #{}: {e}",
                problem.ticket_number
            );
            return Vec::new();
        }
    };

    let mut jobs = Vec::new();
    for incident in &incidents {
        match solve_incident_from_problem(conn, config, problem, incident, resolution.as_ref(), actor_id)
        {
            Ok(incident_jobs) => jobs.extend(incident_jobs),
            Err(e) => error!(
                "cascade failed for incident #{} (problem #{}): {e}",
                incident.ticket_number, problem.ticket_number
            ),
        }
    }
    if !incidents.is_empty() {
        info!(
            "problem #{} cascade solved {} incidents",
            problem.ticket_number,
            incidents.len()
        );
    }
    jobs
}

fn solve_incident_from_problem(
    conn: &mut PgConnection,
    config: &AppConfig,
    problem: &Ticket,
    incident: &Ticket,
    resolution: Option<&TicketComment>,
    actor_id: Option<Uuid>,
) -> Result<Vec<EmailJob>, ApiError> {
    let now = Utc::now();
    conn.transaction::<_, ApiError, _>(|conn| {
        let mut incident = incident.clone();
        incident.status = TicketStatus::Solved.as_str().to_string();
        incident.solved_at = Some(now);
        diesel::update(tickets::table.filter(tickets::id.eq(incident.id)))
            .set((
                tickets::status.eq(&incident.status),
                tickets::solved_at.eq(incident.solved_at),
                tickets::updated_at.eq(now),
            ))
            .execute(conn)?;

        let (body, body_plain, author_id) = match resolution {
            Some(comment) => (comment.body.clone(), comment.body_plain.clone(), comment.author_id),
            None => {
                let text = format!(
                    "Resolved together with problem ticket #{}.",
                    problem.ticket_number
                );
                (text.clone(), text, actor_id.unwrap_or(problem.requester_id))
            }
        };
        insert_comment(
            conn,
            NewComment {
                ticket_id: incident.id,
                author_id,
                body,
                body_plain,
                is_internal: false,
                is_system: true,
                channel: TicketChannel::Internal,
                email_message_id: None,
                email_from: None,
            },
        )?;
        log_activity(
            conn,
            incident.id,
            actor_id,
            "status_changed",
            json!({
                "newStatus": TicketStatus::Solved.as_str(),
                "reason": "auto_solved_with_problem",
                "problemTicketId": problem.id,
            }),
        )?;
        resolution_email_jobs(conn, config, &incident)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ticket(number: i64, status: TicketStatus, requester: Uuid) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::new_v4(),
            ticket_number: number,
            subject: format!("ticket {number}"),
            status: status.as_str().to_string(),
            priority: TicketPriority::Normal.as_str().to_string(),
            channel: TicketChannel::Web.as_str().to_string(),
            ticket_type: TicketType::Normal.as_str().to_string(),
            requester_id: requester,
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

    #[test]
    fn merge_rejects_terminal_target() {
        let requester = Uuid::new_v4();
        let target = ticket(1, TicketStatus::Solved, requester);
        let sources = vec![ticket(2, TicketStatus::Open, requester)];
        assert!(merge_precheck(&target, &sources).is_err());
    }

    #[test]
    fn merge_rejects_terminal_source() {
        let requester = Uuid::new_v4();
        let target = ticket(1, TicketStatus::Open, requester);
        let sources = vec![ticket(2, TicketStatus::Closed, requester)];
        assert!(merge_precheck(&target, &sources).is_err());
    }

    #[test]
    fn merge_rejects_self_merge() {
        let requester = Uuid::new_v4();
        let target = ticket(1, TicketStatus::Open, requester);
        let mut source = ticket(1, TicketStatus::Open, requester);
        source.id = target.id;
        assert!(merge_precheck(&target, &[source]).is_err());
    }

    #[test]
    fn merge_rejects_empty_source_list() {
        let target = ticket(1, TicketStatus::Open, Uuid::new_v4());
        assert!(merge_precheck(&target, &[]).is_err());
    }

    #[test]
    fn merge_rejects_already_merged_source() {
        let requester = Uuid::new_v4();
        let target = ticket(1, TicketStatus::Open, requester);
        let mut source = ticket(2, TicketStatus::Open, requester);
        source.merged_into_id = Some(Uuid::new_v4());
        assert!(merge_precheck(&target, &[source]).is_err());
    }

    #[test]
    fn merge_accepts_open_tickets() {
        let requester = Uuid::new_v4();
        let target = ticket(1, TicketStatus::Open, requester);
        let sources = vec![
            ticket(2, TicketStatus::New, requester),
            ticket(3, TicketStatus::Pending, requester),
        ];
        assert!(merge_precheck(&target, &sources).is_ok());
    }
}
