use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::schema::{
    backlog_snapshots, email_threads, support_settings, ticket_activities, ticket_comments,
    tickets, users,
};

/// Ticket lifecycle states. Stored as uppercase strings in the `status`
/// column; unknown values are rejected at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    New,
    Open,
    Pending,
    OnHold,
    Solved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::New => "NEW",
            TicketStatus::Open => "OPEN",
            TicketStatus::Pending => "PENDING",
            TicketStatus::OnHold => "ON_HOLD",
            TicketStatus::Solved => "SOLVED",
            TicketStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(TicketStatus::New),
            "OPEN" => Some(TicketStatus::Open),
            "PENDING" => Some(TicketStatus::Pending),
            "ON_HOLD" => Some(TicketStatus::OnHold),
            "SOLVED" => Some(TicketStatus::Solved),
            "CLOSED" => Some(TicketStatus::Closed),
            _ => None,
        }
    }

    /// SOLVED and CLOSED tickets do not take further agent-reply transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TicketStatus::Solved | TicketStatus::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketPriority::Low => "LOW",
            TicketPriority::Normal => "NORMAL",
            TicketPriority::High => "HIGH",
            TicketPriority::Urgent => "URGENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(TicketPriority::Low),
            "NORMAL" => Some(TicketPriority::Normal),
            "HIGH" => Some(TicketPriority::High),
            "URGENT" => Some(TicketPriority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketChannel {
    Email,
    Web,
    Api,
    Slack,
    Internal,
}

impl TicketChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketChannel::Email => "EMAIL",
            TicketChannel::Web => "WEB",
            TicketChannel::Api => "API",
            TicketChannel::Slack => "SLACK",
            TicketChannel::Internal => "INTERNAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EMAIL" => Some(TicketChannel::Email),
            "WEB" => Some(TicketChannel::Web),
            "API" => Some(TicketChannel::Api),
            "SLACK" => Some(TicketChannel::Slack),
            "INTERNAL" => Some(TicketChannel::Internal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketType {
    Normal,
    Problem,
    Incident,
}

impl TicketType {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketType::Normal => "NORMAL",
            TicketType::Problem => "PROBLEM",
            TicketType::Incident => "INCIDENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NORMAL" => Some(TicketType::Normal),
            "PROBLEM" => Some(TicketType::Problem),
            "INCIDENT" => Some(TicketType::Incident),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    User,
    Agent,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::User => "USER",
            UserRole::Agent => "AGENT",
            UserRole::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(UserRole::User),
            "AGENT" => Some(UserRole::Agent),
            "ADMIN" => Some(UserRole::Admin),
            _ => None,
        }
    }

    pub fn is_staff(self) -> bool {
        matches!(self, UserRole::Agent | UserRole::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn role_enum(&self) -> UserRole {
        UserRole::parse(&self.role).unwrap_or(UserRole::User)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = tickets)]
pub struct Ticket {
    pub id: Uuid,
    pub ticket_number: i64,
    pub subject: String,
    pub status: String,
    pub priority: String,
    pub channel: String,
    pub ticket_type: String,
    pub requester_id: Uuid,
    pub assignee_id: Option<Uuid>,
    pub form_id: Option<Uuid>,
    pub category: Option<String>,
    pub related_ticket_id: Option<Uuid>,
    pub merged_into_id: Option<Uuid>,
    pub problem_id: Option<Uuid>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub solved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn status_enum(&self) -> TicketStatus {
        TicketStatus::parse(&self.status).unwrap_or(TicketStatus::New)
    }

    pub fn type_enum(&self) -> TicketType {
        TicketType::parse(&self.ticket_type).unwrap_or(TicketType::Normal)
    }

    pub fn is_merged(&self) -> bool {
        self.merged_into_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = ticket_comments)]
pub struct TicketComment {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub body_plain: String,
    pub is_internal: bool,
    pub is_system: bool,
    pub channel: String,
    pub email_message_id: Option<String>,
    pub email_from: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = ticket_activities)]
pub struct TicketActivity {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = email_threads)]
pub struct EmailThread {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub reply_token: String,
    pub last_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = backlog_snapshots)]
pub struct BacklogSnapshot {
    pub id: Uuid,
    pub snapshot_date: NaiveDate,
    pub new_count: i32,
    pub open_count: i32,
    pub pending_count: i32,
    pub on_hold_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = support_settings)]
pub struct SupportSettings {
    pub id: Uuid,
    pub auto_solve_enabled: bool,
    pub auto_solve_hours: i32,
    pub auto_close_enabled: bool,
    pub auto_close_hours: i32,
    pub ai_drafts_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl Default for SupportSettings {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            auto_solve_enabled: true,
            auto_solve_hours: 72,
            auto_close_enabled: true,
            auto_close_hours: 96,
            ai_drafts_enabled: false,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_strings() {
        for status in [
            TicketStatus::New,
            TicketStatus::Open,
            TicketStatus::Pending,
            TicketStatus::OnHold,
            TicketStatus::Solved,
            TicketStatus::Closed,
        ] {
            assert_eq!(TicketStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert_eq!(TicketStatus::parse("RESOLVED"), None);
        assert_eq!(TicketStatus::parse("open"), None);
        assert_eq!(TicketStatus::parse(""), None);
    }

    #[test]
    fn only_solved_and_closed_are_terminal() {
        assert!(TicketStatus::Solved.is_terminal());
        assert!(TicketStatus::Closed.is_terminal());
        assert!(!TicketStatus::New.is_terminal());
        assert!(!TicketStatus::Open.is_terminal());
        assert!(!TicketStatus::Pending.is_terminal());
        assert!(!TicketStatus::OnHold.is_terminal());
    }

    #[test]
    fn staff_roles() {
        assert!(UserRole::Agent.is_staff());
        assert!(UserRole::Admin.is_staff());
        assert!(!UserRole::User.is_staff());
    }
}
