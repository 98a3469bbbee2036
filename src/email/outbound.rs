use std::collections::HashMap;

use lettre::message::{header::ContentType, Mailbox, MessageBuilder};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{error, info};

use crate::config::SmtpConfig;
use crate::shared::models::{Ticket, User};

/// Notification templates the lifecycle engine can request. Layout lives in
/// the template text; the engine only supplies a flat placeholder map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    TicketCreated,
    AgentReply,
    TicketResolved,
    FeedbackRequest,
}

impl EmailTemplate {
    fn subject(self) -> &'static str {
        match self {
            EmailTemplate::TicketCreated => "[#{ticketNumber}] We received your request",
            EmailTemplate::AgentReply => "[#{ticketNumber}] New reply on: {ticketSubject}",
            EmailTemplate::TicketResolved => "[#{ticketNumber}] Your request has been resolved",
            EmailTemplate::FeedbackRequest => "[#{ticketNumber}] How did we do?",
        }
    }

    fn body(self) -> &'static str {
        match self {
            EmailTemplate::TicketCreated => {
                "Hi {userName},\n\nWe received your request \"{ticketSubject}\" and created \
                 ticket #{ticketNumber}. You can follow it here: {ticketUrl}\n\nReplying to \
                 this email adds to the ticket."
            }
            EmailTemplate::AgentReply => {
                "Hi {userName},\n\n{agentName} replied to ticket #{ticketNumber} \
                 ({ticketSubject}). View the conversation: {ticketUrl}\n\nYou can answer by \
                 replying to this email."
            }
            EmailTemplate::TicketResolved => {
                "Hi {userName},\n\nTicket #{ticketNumber} ({ticketSubject}) has been marked as \
                 solved. If this didn't fix things, just reply and the ticket will reopen.\n\n\
                 {ticketUrl}"
            }
            EmailTemplate::FeedbackRequest => {
                "Hi {userName},\n\nYour ticket #{ticketNumber} was resolved. We'd love to hear \
                 how we did: {feedbackUrl}"
            }
        }
    }
}

/// One outbound email request. Jobs are collected by lifecycle operations
/// and dispatched after the owning transaction commits, so a send failure
/// can never roll back a ticket mutation.
#[derive(Debug, Clone)]
pub struct EmailJob {
    pub to: String,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub template: EmailTemplate,
    pub placeholders: HashMap<String, String>,
}

impl EmailJob {
    pub fn for_ticket(
        template: EmailTemplate,
        ticket: &Ticket,
        requester: &User,
        base_url: &str,
        reply_address: Option<String>,
    ) -> Self {
        let mut placeholders = HashMap::new();
        placeholders.insert("userName".to_string(), requester.name.clone());
        placeholders.insert("ticketNumber".to_string(), ticket.ticket_number.to_string());
        placeholders.insert("ticketSubject".to_string(), ticket.subject.clone());
        placeholders.insert(
            "ticketUrl".to_string(),
            format!("{}/tickets/{}", base_url, ticket.id),
        );
        placeholders.insert(
            "feedbackUrl".to_string(),
            format!("{}/tickets/{}/feedback", base_url, ticket.id),
        );
        EmailJob {
            to: requester.email.clone(),
            reply_to: reply_address,
            message_id: None,
            in_reply_to: None,
            template,
            placeholders,
        }
    }

    pub fn with_agent_name(mut self, agent_name: &str) -> Self {
        self.placeholders
            .insert("agentName".to_string(), agent_name.to_string());
        self
    }

    /// Attaches conversation threading: the Message-ID this send carries
    /// and the previous message on the thread it answers.
    pub fn with_threading(mut self, message_id: &str, in_reply_to: Option<&str>) -> Self {
        self.message_id = Some(message_id.to_string());
        self.in_reply_to = in_reply_to.map(str::to_string);
        self
    }
}

/// Substitutes `{placeholder}` tokens; unknown tokens are left in place so a
/// template typo shows up in the delivered mail instead of silently
/// vanishing.
pub fn render(template: &str, placeholders: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in placeholders {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

#[derive(Clone)]
pub struct Mailer {
    smtp: SmtpConfig,
}

impl Mailer {
    pub fn new(smtp: SmtpConfig) -> Self {
        Self { smtp }
    }

    /// Fire-and-forget dispatch. Each job runs on the blocking pool with its
    /// own error channel: failures are logged and dropped, never surfaced to
    /// the request that queued them.
    pub fn dispatch(&self, jobs: Vec<EmailJob>) {
        for job in jobs {
            let mailer = self.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = mailer.send_job(&job) {
                    error!("outbound email to {} failed: {e}", job.to);
                }
            });
        }
    }

    fn send_job(&self, job: &EmailJob) -> Result<(), anyhow::Error> {
        let subject = render(job.template.subject(), &job.placeholders);
        let body = render(job.template.body(), &job.placeholders);

        let mut builder = MessageBuilder::new()
            .from(self.smtp.from_address.parse::<Mailbox>()?)
            .to(job.to.parse::<Mailbox>()?)
            .subject(&subject)
            .header(ContentType::TEXT_PLAIN);
        if let Some(reply_to) = &job.reply_to {
            builder = builder.reply_to(reply_to.parse::<Mailbox>()?);
        }
        if let Some(message_id) = &job.message_id {
            builder = builder.message_id(Some(message_id.clone()));
        }
        if let Some(in_reply_to) = &job.in_reply_to {
            builder = builder
                .in_reply_to(in_reply_to.clone())
                .references(in_reply_to.clone());
        }
        let message: Message = builder.body(body)?;

        let mut transport = SmtpTransport::starttls_relay(&self.smtp.host)?
            .port(self.smtp.port);
        if let (Some(user), Some(pass)) = (&self.smtp.username, &self.smtp.password) {
            transport = transport.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        transport.build().send(&message)?;
        info!("sent {:?} email to {}", job.template, job.to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_known_placeholders() {
        let mut map = HashMap::new();
        map.insert("userName".to_string(), "Alice".to_string());
        map.insert("ticketNumber".to_string(), "42".to_string());
        let out = render("Hi {userName}, ticket #{ticketNumber} ({missing})", &map);
        assert_eq!(out, "Hi Alice, ticket #42 ({missing})");
    }

    #[test]
    fn threading_answers_the_previous_message_on_the_thread() {
        let job = EmailJob {
            to: "alice@example.com".to_string(),
            reply_to: None,
            message_id: None,
            in_reply_to: None,
            template: EmailTemplate::AgentReply,
            placeholders: HashMap::new(),
        }
        .with_threading("<new@tickets.example.com>", Some("<old@mail.example.com>"));
        assert_eq!(job.message_id.as_deref(), Some("<new@tickets.example.com>"));
        assert_eq!(job.in_reply_to.as_deref(), Some("<old@mail.example.com>"));

        // First message on a thread has nothing to answer.
        let first = EmailJob {
            to: "alice@example.com".to_string(),
            reply_to: None,
            message_id: None,
            in_reply_to: None,
            template: EmailTemplate::TicketCreated,
            placeholders: HashMap::new(),
        }
        .with_threading("<new@tickets.example.com>", None);
        assert!(first.in_reply_to.is_none());
    }

    #[test]
    fn templates_reference_only_known_placeholders() {
        let known = [
            "userName",
            "ticketNumber",
            "ticketSubject",
            "ticketUrl",
            "agentName",
            "feedbackUrl",
        ];
        for template in [
            EmailTemplate::TicketCreated,
            EmailTemplate::AgentReply,
            EmailTemplate::TicketResolved,
            EmailTemplate::FeedbackRequest,
        ] {
            for text in [template.subject(), template.body()] {
                let mut rest = text;
                while let Some(start) = rest.find('{') {
                    let tail = &rest[start + 1..];
                    let end = tail.find('}').expect("unterminated placeholder");
                    assert!(known.contains(&&tail[..end]), "unknown placeholder in {text}");
                    rest = &tail[end + 1..];
                }
            }
        }
    }
}
