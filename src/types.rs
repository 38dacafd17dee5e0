use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    Assigned,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::Assigned => "assigned",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }

    /// Resolved and closed stop the resolution clock.
    pub fn is_terminal(self) -> bool {
        matches!(self, TicketStatus::Resolved | TicketStatus::Closed)
    }

    /// Whether `self -> to` is a legal lifecycle move. Staying put is always legal.
    pub fn can_transition_to(self, to: TicketStatus) -> bool {
        if self == to {
            return true;
        }
        match self {
            TicketStatus::New | TicketStatus::Assigned | TicketStatus::InProgress => true,
            TicketStatus::Resolved => {
                matches!(to, TicketStatus::Closed | TicketStatus::InProgress)
            }
            TicketStatus::Closed => to == TicketStatus::InProgress,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of events a subscription can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "ticket.created")]
    TicketCreated,
    #[serde(rename = "ticket.updated")]
    TicketUpdated,
    #[serde(rename = "ticket.assigned")]
    TicketAssigned,
    #[serde(rename = "ticket.resolved")]
    TicketResolved,
    #[serde(rename = "ticket.closed")]
    TicketClosed,
    #[serde(rename = "comment.added")]
    CommentAdded,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TicketCreated => "ticket.created",
            EventType::TicketUpdated => "ticket.updated",
            EventType::TicketAssigned => "ticket.assigned",
            EventType::TicketResolved => "ticket.resolved",
            EventType::TicketClosed => "ticket.closed",
            EventType::CommentAdded => "comment.added",
        }
    }

    /// Event raised when a ticket enters `status` through a status change.
    pub fn for_status(status: TicketStatus) -> Self {
        match status {
            TicketStatus::Resolved => EventType::TicketResolved,
            TicketStatus::Closed => EventType::TicketClosed,
            TicketStatus::Assigned => EventType::TicketAssigned,
            TicketStatus::New | TicketStatus::InProgress => EventType::TicketUpdated,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaPolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: Priority,
    pub response_time_hours: f64,
    pub resolution_time_hours: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The subset of a ticket the core reads and mutates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TicketStatus,
    pub created_by: String,
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub sla_policy_id: Option<String>,
    pub response_due: Option<DateTime<Utc>>,
    pub resolution_due: Option<DateTime<Utc>>,
    pub response_breached: bool,
    pub resolution_breached: bool,
}

impl Ticket {
    /// A fresh ticket in `new` with no SLA attached yet.
    pub fn new(
        id: String,
        title: String,
        description: String,
        priority: Priority,
        created_by: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            title,
            description,
            priority,
            status: TicketStatus::New,
            created_by,
            assigned_to: None,
            created_at,
            updated_at: None,
            first_response_at: None,
            resolved_at: None,
            closed_at: None,
            sla_policy_id: None,
            response_due: None,
            resolution_due: None,
            response_breached: false,
            resolution_breached: false,
        }
    }

    pub fn sla_snapshot(&self) -> SlaSnapshot {
        SlaSnapshot {
            ticket_id: self.id.clone(),
            status: self.status,
            sla_policy_id: self.sla_policy_id.clone(),
            response_due: self.response_due,
            resolution_due: self.resolution_due,
            response_breached: self.response_breached,
            resolution_breached: self.resolution_breached,
            first_response_at: self.first_response_at,
            resolved_at: self.resolved_at,
            closed_at: self.closed_at,
        }
    }

    pub fn is_breached(&self) -> bool {
        self.response_breached || self.resolution_breached
    }
}

/// SLA fields and breach flags as served back to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaSnapshot {
    pub ticket_id: String,
    pub status: TicketStatus,
    pub sla_policy_id: Option<String>,
    pub response_due: Option<DateTime<Utc>>,
    pub resolution_due: Option<DateTime<Utc>>,
    pub response_breached: bool,
    pub resolution_breached: bool,
    pub first_response_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub ticket_id: String,
    pub author_id: String,
    pub body: String,
    pub is_internal: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub events: BTreeSet<EventType>,
    pub is_active: bool,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn listens_to(&self, event: EventType) -> bool {
        self.is_active && self.events.contains(&event)
    }

    /// The signing key, if one is configured. An empty secret signs nothing.
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }
}

/// One delivery attempt. Written once by the dispatcher, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: String,
    pub subscription_id: String,
    pub event_type: EventType,
    pub payload: String,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl DeliveryLogEntry {
    /// True when the target answered with any HTTP status.
    pub fn reached_target(&self) -> bool {
        self.response_status.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub subscription_id: String,
    pub delivery_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

/// Compliance summary over a window of recently created tickets. Rates and
/// averages are rounded to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaMetrics {
    pub period_days: u32,
    pub tickets_with_sla: u64,
    pub total_sla_breaches: u64,
    /// Percentage of SLA-tracked tickets with neither flag raised; 100 when
    /// no ticket is tracked.
    pub sla_compliance_rate: f64,
    pub avg_response_time_hours: f64,
    pub avg_resolution_time_hours: f64,
    pub total_resolved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_dot_separated() {
        let json = serde_json::to_string(&EventType::CommentAdded).unwrap();
        assert_eq!(json, "\"comment.added\"");
        let parsed: EventType = serde_json::from_str("\"ticket.resolved\"").unwrap();
        assert_eq!(parsed, EventType::TicketResolved);
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        assert!(serde_json::from_str::<EventType>("\"ticket.createdX\"").is_err());
    }

    #[test]
    fn resolved_may_only_close_or_reopen() {
        use TicketStatus::*;
        assert!(Resolved.can_transition_to(Closed));
        assert!(Resolved.can_transition_to(InProgress));
        assert!(!Resolved.can_transition_to(New));
        assert!(!Resolved.can_transition_to(Assigned));
        assert!(New.can_transition_to(Closed));
        assert!(InProgress.can_transition_to(Assigned));
        assert!(Closed.can_transition_to(InProgress));
        assert!(!Closed.can_transition_to(Resolved));
    }

    #[test]
    fn inactive_subscription_listens_to_nothing() {
        let sub = WebhookSubscription {
            id: "wh_1".into(),
            name: "ops".into(),
            url: "http://localhost/hook".into(),
            secret: Some(String::new()),
            events: [EventType::TicketCreated].into_iter().collect(),
            is_active: false,
            last_triggered_at: None,
            created_at: Utc::now(),
        };
        assert!(!sub.listens_to(EventType::TicketCreated));
        assert_eq!(sub.signing_secret(), None);
    }
}
