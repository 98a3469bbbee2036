pub mod lifecycle;
pub mod merge;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{verify_partner_key, Identity};
use crate::email::inbound::plain_to_html;
use crate::error::ApiError;
use crate::shared::models::{
    BacklogSnapshot, Ticket, TicketChannel, TicketComment, TicketPriority, TicketStatus,
    TicketType, User, UserRole,
};
use crate::shared::schema::{backlog_snapshots, ticket_comments, tickets, users};
use crate::shared::state::AppState;
use crate::tickets::lifecycle::{NewTicketInput, ReplyInput};

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    pub body: String,
    pub priority: Option<String>,
    pub category: Option<String>,
    pub form_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PartnerCreateTicketRequest {
    pub subject: String,
    pub body: String,
    pub requester_email: String,
    pub requester_name: Option<String>,
    pub priority: Option<String>,
}

/// Allow-listed update payload: only these fields are mutable through the
/// generic update endpoint. Status and assignment changes route through the
/// lifecycle engine so the derived transitions stay in one place.
#[derive(Debug, Deserialize)]
pub struct UpdateTicketRequest {
    pub subject: Option<String>,
    pub priority: Option<String>,
    pub category: Option<String>,
    pub status: Option<String>,
    pub assignee_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct AssignTicketRequest {
    pub assignee_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    pub body: String,
    pub is_internal: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct MergeTicketsRequest {
    pub source_ids: Vec<Uuid>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeTypeRequest {
    pub ticket_type: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkProblemRequest {
    pub problem_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub assignee_id: Option<Uuid>,
    pub requester_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TicketWithComments {
    pub ticket: Ticket,
    pub comments: Vec<TicketComment>,
}

fn parse_status(value: &str) -> Result<TicketStatus, ApiError> {
    TicketStatus::parse(value)
        .ok_or_else(|| ApiError::validation("invalid_status", format!("unknown status: {value}")))
}

fn parse_priority(value: &str) -> Result<TicketPriority, ApiError> {
    TicketPriority::parse(value).ok_or_else(|| {
        ApiError::validation("invalid_priority", format!("unknown priority: {value}"))
    })
}

fn load_identity_user(conn: &mut PgConnection, identity: Identity) -> Result<User, ApiError> {
    lifecycle::load_user(conn, identity.user_id)
}

/// Customers may only touch their own tickets; staff see everything.
fn check_ticket_access(ticket: &Ticket, identity: Identity) -> Result<(), ApiError> {
    if identity.role.is_staff() || ticket.requester_id == identity.user_id {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<CreateTicketRequest>,
) -> Result<Json<Ticket>, ApiError> {
    if req.subject.trim().is_empty() {
        return Err(ApiError::validation("missing_subject", "subject is required"));
    }
    let priority = match req.priority.as_deref() {
        Some(p) => parse_priority(p)?,
        None => TicketPriority::Normal,
    };
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let (ticket, jobs) = lifecycle::create_ticket(
        &mut conn,
        &state.config,
        NewTicketInput {
            subject: req.subject,
            body: plain_to_html(&req.body),
            body_plain: req.body,
            requester_id: identity.user_id,
            channel: TicketChannel::Web,
            priority,
            form_id: req.form_id,
            category: req.category,
            related_ticket_id: None,
        },
    )?;
    state.mailer.dispatch(jobs);
    Ok(Json(ticket))
}

/// Partner API submission: authenticated by API key, with just-in-time user
/// creation for unknown requester addresses.
pub async fn partner_create_ticket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PartnerCreateTicketRequest>,
) -> Result<Json<Ticket>, ApiError> {
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    verify_partner_key(state.config.partner_api_key.as_deref(), provided)?;
    if req.subject.trim().is_empty() {
        return Err(ApiError::validation("missing_subject", "subject is required"));
    }
    if !req.requester_email.contains('@') {
        return Err(ApiError::validation(
            "invalid_email",
            "requester_email is not a valid address",
        ));
    }
    let priority = match req.priority.as_deref() {
        Some(p) => parse_priority(p)?,
        None => TicketPriority::Normal,
    };

    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let requester = find_or_create_user(&mut conn, &req.requester_email, req.requester_name.as_deref())?;
    if requester.is_blocked {
        return Err(ApiError::Forbidden);
    }
    let (ticket, jobs) = lifecycle::create_ticket(
        &mut conn,
        &state.config,
        NewTicketInput {
            subject: req.subject,
            body: plain_to_html(&req.body),
            body_plain: req.body,
            requester_id: requester.id,
            channel: TicketChannel::Api,
            priority,
            form_id: None,
            category: None,
            related_ticket_id: None,
        },
    )?;
    state.mailer.dispatch(jobs);
    Ok(Json(ticket))
}

fn find_or_create_user(
    conn: &mut PgConnection,
    email: &str,
    name: Option<&str>,
) -> Result<User, ApiError> {
    let email = email.trim().to_lowercase();
    let existing = users::table
        .filter(users::email.eq(&email))
        .first::<User>(conn)
        .optional()?;
    if let Some(user) = existing {
        return Ok(user);
    }
    let user = User {
        id: Uuid::new_v4(),
        name: name
            .map(str::to_string)
            .unwrap_or_else(|| email.split('@').next().unwrap_or("customer").to_string()),
        email,
        role: UserRole::User.as_str().to_string(),
        is_blocked: false,
        created_at: Utc::now(),
    };
    diesel::insert_into(users::table)
        .values(&user)
        .execute(conn)?;
    Ok(user)
}

pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Ticket>>, ApiError> {
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    let mut q = tickets::table.into_boxed();
    if identity.role.is_staff() {
        if let Some(requester_id) = query.requester_id {
            q = q.filter(tickets::requester_id.eq(requester_id));
        }
    } else {
        q = q.filter(tickets::requester_id.eq(identity.user_id));
    }
    if let Some(status) = query.status {
        parse_status(&status)?;
        q = q.filter(tickets::status.eq(status));
    }
    if let Some(assignee_id) = query.assignee_id {
        q = q.filter(tickets::assignee_id.eq(assignee_id));
    }

    let result = q
        .order(tickets::created_at.desc())
        .limit(limit)
        .offset(offset)
        .load::<Ticket>(&mut conn)?;
    Ok(Json(result))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<TicketWithComments>, ApiError> {
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let ticket = lifecycle::load_ticket(&mut conn, id)?;
    check_ticket_access(&ticket, identity)?;

    let mut q = ticket_comments::table
        .filter(ticket_comments::ticket_id.eq(id))
        .into_boxed();
    if !identity.role.is_staff() {
        q = q.filter(ticket_comments::is_internal.eq(false));
    }
    let comments = q
        .order(ticket_comments::created_at.asc())
        .load::<TicketComment>(&mut conn)?;
    Ok(Json(TicketWithComments { ticket, comments }))
}

pub async fn update_ticket(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTicketRequest>,
) -> Result<Json<Ticket>, ApiError> {
    identity.require_staff()?;
    let explicit_status = req.status.as_deref().map(parse_status).transpose()?;
    if let Some(priority) = req.priority.as_deref() {
        parse_priority(priority)?;
    }

    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let ticket = lifecycle::load_ticket(&mut conn, id)?;
    if ticket.is_merged() {
        return Err(ApiError::validation(
            "ticket_merged",
            "merged tickets cannot be modified",
        ));
    }

    let now = Utc::now();
    if req.subject.is_some() || req.priority.is_some() || req.category.is_some() {
        conn.transaction::<_, ApiError, _>(|conn| {
            if let Some(subject) = &req.subject {
                diesel::update(tickets::table.filter(tickets::id.eq(id)))
                    .set((tickets::subject.eq(subject), tickets::updated_at.eq(now)))
                    .execute(conn)?;
            }
            if let Some(priority) = &req.priority {
                diesel::update(tickets::table.filter(tickets::id.eq(id)))
                    .set((tickets::priority.eq(priority), tickets::updated_at.eq(now)))
                    .execute(conn)?;
            }
            if let Some(category) = &req.category {
                diesel::update(tickets::table.filter(tickets::id.eq(id)))
                    .set((tickets::category.eq(category), tickets::updated_at.eq(now)))
                    .execute(conn)?;
            }
            Ok(())
        })?;
    }

    if req.assignee_id.is_some() {
        lifecycle::apply_assignment(
            &mut conn,
            id,
            req.assignee_id,
            identity.user_id,
            explicit_status,
        )?;
    }
    if let Some(status) = explicit_status {
        let (_, jobs) =
            lifecycle::apply_status_change(&mut conn, &state.config, id, status, identity.user_id)?;
        state.mailer.dispatch(jobs);
    }

    Ok(Json(lifecycle::load_ticket(&mut conn, id)?))
}

pub async fn assign_ticket(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignTicketRequest>,
) -> Result<Json<Ticket>, ApiError> {
    identity.require_staff()?;
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let ticket = lifecycle::apply_assignment(&mut conn, id, req.assignee_id, identity.user_id, None)?;
    Ok(Json(ticket))
}

pub async fn change_status(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangeStatusRequest>,
) -> Result<Json<Ticket>, ApiError> {
    identity.require_staff()?;
    let status = parse_status(&req.status)?;
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let (ticket, jobs) =
        lifecycle::apply_status_change(&mut conn, &state.config, id, status, identity.user_id)?;
    state.mailer.dispatch(jobs);
    Ok(Json(ticket))
}

pub async fn add_comment(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<Json<TicketComment>, ApiError> {
    if req.body.trim().is_empty() {
        return Err(ApiError::validation("empty_body", "comment body is required"));
    }
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let ticket = lifecycle::load_ticket(&mut conn, id)?;
    check_ticket_access(&ticket, identity)?;
    let author = load_identity_user(&mut conn, identity)?;

    let (comment, jobs) = lifecycle::apply_reply(
        &mut conn,
        &state.config,
        id,
        &author,
        ReplyInput {
            body: plain_to_html(&req.body),
            body_plain: req.body,
            is_internal: req.is_internal.unwrap_or(false),
            channel: TicketChannel::Web,
            email_message_id: None,
            email_from: None,
        },
    )?;
    state.mailer.dispatch(jobs);
    Ok(Json(comment))
}

pub async fn list_comments(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TicketComment>>, ApiError> {
    let with_comments = get_ticket(State(state), identity, Path(id)).await?;
    Ok(Json(with_comments.0.comments))
}

pub async fn merge_tickets(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(req): Json<MergeTicketsRequest>,
) -> Result<Json<Ticket>, ApiError> {
    identity.require_staff()?;
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let ticket = merge::merge_tickets(&mut conn, id, &req.source_ids, identity, req.note)?;
    Ok(Json(ticket))
}

pub async fn change_type(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangeTypeRequest>,
) -> Result<Json<Ticket>, ApiError> {
    identity.require_staff()?;
    let new_type = TicketType::parse(&req.ticket_type).ok_or_else(|| {
        ApiError::validation("invalid_type", format!("unknown ticket type: {}", req.ticket_type))
    })?;
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let ticket = merge::set_ticket_type(&mut conn, id, new_type, identity.user_id)?;
    Ok(Json(ticket))
}

pub async fn link_problem(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(req): Json<LinkProblemRequest>,
) -> Result<Json<Ticket>, ApiError> {
    identity.require_staff()?;
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let ticket = merge::link_incident_to_problem(&mut conn, id, req.problem_id, identity.user_id)?;
    Ok(Json(ticket))
}

/// Admin-only hard delete. The one other path that deletes tickets is the
/// scam marking below; everything else only closes.
pub async fn delete_ticket(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if identity.role != UserRole::Admin {
        return Err(ApiError::Forbidden);
    }
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    lifecycle::load_ticket(&mut conn, id)?;
    delete_ticket_rows(&mut conn, id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Marks the requester as a scammer: blocks the user and hard-deletes the
/// ticket with its dependents.
pub async fn mark_requester_scam(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if identity.role != UserRole::Admin {
        return Err(ApiError::Forbidden);
    }
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let ticket = lifecycle::load_ticket(&mut conn, id)?;
    conn.transaction::<_, ApiError, _>(|conn| {
        diesel::update(users::table.filter(users::id.eq(ticket.requester_id)))
            .set(users::is_blocked.eq(true))
            .execute(conn)?;
        delete_ticket_rows(conn, id)?;
        Ok(())
    })?;
    Ok(StatusCode::NO_CONTENT)
}

fn delete_ticket_rows(conn: &mut PgConnection, id: Uuid) -> Result<(), ApiError> {
    use crate::shared::schema::{email_threads, ticket_activities};
    conn.transaction::<_, ApiError, _>(|conn| {
        diesel::delete(ticket_comments::table.filter(ticket_comments::ticket_id.eq(id)))
            .execute(conn)?;
        diesel::delete(ticket_activities::table.filter(ticket_activities::ticket_id.eq(id)))
            .execute(conn)?;
        diesel::delete(email_threads::table.filter(email_threads::ticket_id.eq(id)))
            .execute(conn)?;
        diesel::delete(tickets::table.filter(tickets::id.eq(id))).execute(conn)?;
        Ok(())
    })
}

/// Daily backlog counts for trend charts, most recent first.
pub async fn list_backlog_snapshots(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<Vec<BacklogSnapshot>>, ApiError> {
    identity.require_staff()?;
    let mut conn = state.conn.get().map_err(ApiError::pool)?;
    let snapshots = backlog_snapshots::table
        .order(backlog_snapshots::snapshot_date.desc())
        .limit(90)
        .load::<BacklogSnapshot>(&mut conn)?;
    Ok(Json(snapshots))
}

pub fn configure_tickets_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tickets", get(list_tickets).post(create_ticket))
        .route("/api/partner/tickets", post(partner_create_ticket))
        .route("/api/tickets/backlog", get(list_backlog_snapshots))
        .route(
            "/api/tickets/:id",
            get(get_ticket).put(update_ticket).delete(delete_ticket),
        )
        .route("/api/tickets/:id/assign", put(assign_ticket))
        .route("/api/tickets/:id/status", put(change_status))
        .route("/api/tickets/:id/comments", get(list_comments).post(add_comment))
        .route("/api/tickets/:id/merge", post(merge_tickets))
        .route("/api/tickets/:id/type", put(change_type))
        .route("/api/tickets/:id/problem", put(link_problem))
        .route("/api/tickets/:id/scam", post(mark_requester_scam))
}
