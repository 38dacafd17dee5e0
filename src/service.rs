//! The helpdesk core: ticket lifecycle operations wired to SLA tracking and
//! webhook dispatch.
//!
//! Every mutating operation commits its own ticket state first, then hands
//! the resulting event to the dispatcher without waiting on delivery.

use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::error::{PolicyError, RegistryError, ServiceError};
use crate::lifecycle::{self, StatusChange};
use crate::registry::{NewWebhook, WebhookPatch};
use crate::sla::{self, NewSlaPolicy, SlaPolicyPatch};
use crate::store::SharedStore;
use crate::types::{
    Comment, DeliveryLogEntry, EventType, Priority, SlaMetrics, SlaPolicy, SlaSnapshot,
    SubscriptionStats, Ticket, TicketStatus, WebhookSubscription,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

type Result<T> = std::result::Result<T, ServiceError>;

const fn default_limit() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTicket {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    pub created_by: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewComment {
    pub author_id: String,
    pub body: String,
    #[serde(default)]
    pub is_internal: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: default_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    pub priority: Option<Priority>,
    /// `Some(true)`: either flag raised. `Some(false)`: neither.
    pub sla_breached: Option<bool>,
    #[serde(flatten)]
    pub page: Page,
}

#[derive(Debug, Default)]
struct TicketBook {
    tickets: HashMap<String, Ticket>,
    comments: HashMap<String, Vec<Comment>>,
}

pub struct HelpdeskCore {
    book: RwLock<TicketBook>,
    store: SharedStore,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
}

/// Payload `data` for ticket events.
fn ticket_data(ticket: &Ticket, change: Option<StatusChange>) -> Value {
    let mut data = json!({
        "ticket_id": ticket.id,
        "title": ticket.title,
        "priority": ticket.priority,
        "status": ticket.status,
        "created_by": ticket.created_by,
        "assigned_to": ticket.assigned_to,
        "created_at": ticket.created_at,
        "sla": ticket.sla_snapshot(),
    });
    if let Some(change) = change {
        data["old_status"] = json!(change.old);
        data["new_status"] = json!(change.new);
    }
    data
}

fn elapsed_hours(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / 3_600_000_000.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl HelpdeskCore {
    pub fn new(store: SharedStore, dispatcher: Arc<Dispatcher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            book: RwLock::new(TicketBook::default()),
            store,
            dispatcher,
            clock,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // ---------------------------------------------------------------------
    // Ticket lifecycle
    // ---------------------------------------------------------------------

    pub async fn create_ticket(&self, input: NewTicket) -> Ticket {
        let now = self.clock.now();
        let mut ticket = Ticket::new(
            format!("tkt_{}", Uuid::new_v4().simple()),
            input.title,
            input.description,
            input.priority,
            input.created_by,
            now,
        );
        {
            // Lock order is store then book. The policy must still exist
            // when the ticket becomes visible to `delete_policy`.
            let st = self.store.read().await;
            sla::apply_policy(&mut ticket, &st.policies);
            self.book
                .write()
                .await
                .tickets
                .insert(ticket.id.clone(), ticket.clone());
        }
        tracing::info!(ticket_id = %ticket.id, priority = ticket.priority.as_str(), "ticket created");

        self.dispatcher
            .dispatch(EventType::TicketCreated, ticket_data(&ticket, None))
            .await;
        ticket
    }

    pub async fn change_status(&self, ticket_id: &str, to: TicketStatus) -> Result<Ticket> {
        let now = self.clock.now();
        let (ticket, change) = {
            let mut book = self.book.write().await;
            let ticket = book
                .tickets
                .get_mut(ticket_id)
                .ok_or_else(|| ServiceError::TicketNotFound(ticket_id.to_string()))?;
            // Judge the old status first so a late resolution still counts.
            sla::evaluate_breach(ticket, now);
            let change = lifecycle::transition(ticket, to, now)?;
            sla::evaluate_breach(ticket, now);
            (ticket.clone(), change)
        };

        if let Some(change) = change {
            tracing::info!(ticket_id, from = %change.old, to = %change.new, "ticket status changed");
            self.dispatcher
                .dispatch(EventType::for_status(change.new), ticket_data(&ticket, Some(change)))
                .await;
        }
        Ok(ticket)
    }

    /// Hand the ticket to `assignee_id` and move it to `assigned`. Always
    /// raises `ticket.assigned`, even when only the assignee changed.
    pub async fn assign(&self, ticket_id: &str, assignee_id: &str) -> Result<Ticket> {
        let now = self.clock.now();
        let (ticket, change) = {
            let mut book = self.book.write().await;
            let ticket = book
                .tickets
                .get_mut(ticket_id)
                .ok_or_else(|| ServiceError::TicketNotFound(ticket_id.to_string()))?;
            sla::evaluate_breach(ticket, now);
            let change = lifecycle::transition(ticket, TicketStatus::Assigned, now)?;
            ticket.assigned_to = Some(assignee_id.to_string());
            ticket.updated_at = Some(now);
            sla::evaluate_breach(ticket, now);
            (ticket.clone(), change)
        };

        tracing::info!(ticket_id, assignee_id, "ticket assigned");
        self.dispatcher
            .dispatch(EventType::TicketAssigned, ticket_data(&ticket, change))
            .await;
        Ok(ticket)
    }

    pub async fn add_comment(&self, ticket_id: &str, input: NewComment) -> Result<Comment> {
        let now = self.clock.now();
        let comment = Comment {
            id: format!("cmt_{}", Uuid::new_v4().simple()),
            ticket_id: ticket_id.to_string(),
            author_id: input.author_id,
            body: input.body,
            is_internal: input.is_internal,
            created_at: now,
        };

        let ticket = {
            let mut book = self.book.write().await;
            let ticket = book
                .tickets
                .get_mut(ticket_id)
                .ok_or_else(|| ServiceError::TicketNotFound(ticket_id.to_string()))?;
            // Breach is judged against the moment just before this response.
            sla::evaluate_breach(ticket, now);
            if lifecycle::record_comment(ticket, comment.is_internal, now) {
                tracing::info!(ticket_id, "first response recorded");
            }
            let ticket = ticket.clone();
            book.comments
                .entry(ticket_id.to_string())
                .or_default()
                .push(comment.clone());
            ticket
        };

        if !comment.is_internal {
            let data = json!({
                "comment_id": comment.id,
                "ticket_id": ticket.id,
                "author_id": comment.author_id,
                "body": comment.body,
                "created_at": comment.created_at,
                "sla": ticket.sla_snapshot(),
            });
            self.dispatcher.dispatch(EventType::CommentAdded, data).await;
        }
        Ok(comment)
    }

    pub async fn comments(&self, ticket_id: &str) -> Result<Vec<Comment>> {
        let book = self.book.read().await;
        if !book.tickets.contains_key(ticket_id) {
            return Err(ServiceError::TicketNotFound(ticket_id.to_string()));
        }
        Ok(book.comments.get(ticket_id).cloned().unwrap_or_default())
    }

    // ---------------------------------------------------------------------
    // Reads: every read re-evaluates breach flags
    // ---------------------------------------------------------------------

    pub async fn get_ticket(&self, ticket_id: &str) -> Result<Ticket> {
        let now = self.clock.now();
        let mut book = self.book.write().await;
        let ticket = book
            .tickets
            .get_mut(ticket_id)
            .ok_or_else(|| ServiceError::TicketNotFound(ticket_id.to_string()))?;
        sla::evaluate_breach(ticket, now);
        Ok(ticket.clone())
    }

    pub async fn sla_snapshot(&self, ticket_id: &str) -> Result<SlaSnapshot> {
        self.get_ticket(ticket_id).await.map(|t| t.sla_snapshot())
    }

    /// Newest first.
    pub async fn list_tickets(&self, filter: &TicketFilter) -> Vec<Ticket> {
        let now = self.clock.now();
        let mut book = self.book.write().await;
        let mut items: Vec<Ticket> = book
            .tickets
            .values_mut()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.priority.map_or(true, |p| t.priority == p))
            .map(|t| {
                sla::evaluate_breach(t, now);
                t.clone()
            })
            .filter(|t| filter.sla_breached.map_or(true, |b| t.is_breached() == b))
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        items
            .into_iter()
            .skip(filter.page.skip)
            .take(filter.page.limit)
            .collect()
    }

    /// SLA compliance over tickets created in the last `period_days` days.
    /// Breach flags are brought up to date first.
    pub async fn sla_metrics(&self, period_days: u32) -> SlaMetrics {
        let now = self.clock.now();
        let since = chrono::Duration::try_days(i64::from(period_days))
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut book = self.book.write().await;

        let mut with_sla = 0u64;
        let mut breaches = 0u64;
        let mut response_hours = Vec::new();
        let mut resolution_hours = Vec::new();
        for ticket in book.tickets.values_mut().filter(|t| t.created_at >= since) {
            sla::evaluate_breach(ticket, now);
            if ticket.sla_policy_id.is_some() {
                with_sla += 1;
                if ticket.is_breached() {
                    breaches += 1;
                }
            }
            if let Some(at) = ticket.first_response_at {
                response_hours.push(elapsed_hours(ticket.created_at, at));
            }
            if let Some(at) = ticket.resolved_at {
                resolution_hours.push(elapsed_hours(ticket.created_at, at));
            }
        }

        let compliance = if with_sla == 0 {
            100.0
        } else {
            (with_sla - breaches) as f64 / with_sla as f64 * 100.0
        };
        SlaMetrics {
            period_days,
            tickets_with_sla: with_sla,
            total_sla_breaches: breaches,
            sla_compliance_rate: round2(compliance),
            avg_response_time_hours: round2(mean(&response_hours)),
            avg_resolution_time_hours: round2(mean(&resolution_hours)),
            total_resolved: resolution_hours.len() as u64,
        }
    }

    // ---------------------------------------------------------------------
    // SLA policies
    // ---------------------------------------------------------------------

    pub async fn create_policy(&self, input: NewSlaPolicy) -> Result<SlaPolicy> {
        let mut st = self.store.write().await;
        let policy = st.policies.create(input, self.clock.now())?;
        st.save_policies()?;
        tracing::info!(policy_id = %policy.id, priority = policy.priority.as_str(), "SLA policy created");
        Ok(policy)
    }

    pub async fn update_policy(&self, id: &str, patch: SlaPolicyPatch) -> Result<SlaPolicy> {
        let mut st = self.store.write().await;
        let policy = st.policies.update(id, patch, self.clock.now())?;
        st.save_policies()?;
        Ok(policy)
    }

    /// Refused while any ticket still references the policy.
    pub async fn delete_policy(&self, id: &str) -> Result<SlaPolicy> {
        let mut st = self.store.write().await;
        if st.policies.get(id).is_none() {
            return Err(PolicyError::NotFound(id.to_string()).into());
        }
        let in_use = self
            .book
            .read()
            .await
            .tickets
            .values()
            .any(|t| t.sla_policy_id.as_deref() == Some(id));
        if in_use {
            return Err(PolicyError::InUse(id.to_string()).into());
        }
        let policy = st.policies.remove(id)?;
        st.save_policies()?;
        Ok(policy)
    }

    pub async fn get_policy(&self, id: &str) -> Result<SlaPolicy> {
        self.store
            .read()
            .await
            .policies
            .get(id)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(id.to_string()).into())
    }

    pub async fn list_policies(&self, active_only: bool) -> Vec<SlaPolicy> {
        self.store
            .read()
            .await
            .policies
            .list(active_only)
            .into_iter()
            .cloned()
            .collect()
    }

    // ---------------------------------------------------------------------
    // Webhook subscriptions and delivery log
    // ---------------------------------------------------------------------

    pub async fn create_webhook(&self, input: NewWebhook) -> Result<WebhookSubscription> {
        let mut st = self.store.write().await;
        let sub = st.registry.create(input, self.clock.now())?;
        st.save_webhooks()?;
        tracing::info!(subscription_id = %sub.id, url = %sub.url, "webhook created");
        Ok(sub)
    }

    pub async fn update_webhook(&self, id: &str, patch: WebhookPatch) -> Result<WebhookSubscription> {
        let mut st = self.store.write().await;
        let sub = st.registry.update(id, patch)?;
        st.save_webhooks()?;
        Ok(sub)
    }

    pub async fn delete_webhook(&self, id: &str) -> Result<WebhookSubscription> {
        let mut st = self.store.write().await;
        let sub = st.registry.remove(id)?;
        st.save_webhooks()?;
        Ok(sub)
    }

    pub async fn get_webhook(&self, id: &str) -> Result<WebhookSubscription> {
        self.store
            .read()
            .await
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()).into())
    }

    pub async fn list_webhooks(&self) -> Vec<WebhookSubscription> {
        self.store
            .read()
            .await
            .registry
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Delivery attempts for one subscription, newest first.
    pub async fn delivery_log(&self, subscription_id: &str, page: Page) -> Result<Vec<DeliveryLogEntry>> {
        let st = self.store.read().await;
        if st.registry.get(subscription_id).is_none() {
            return Err(RegistryError::NotFound(subscription_id.to_string()).into());
        }
        Ok(st
            .deliveries_page(subscription_id, page.skip, page.limit)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn subscription_stats(&self, subscription_id: &str) -> Result<SubscriptionStats> {
        self.store
            .read()
            .await
            .stats(subscription_id)
            .ok_or_else(|| RegistryError::NotFound(subscription_id.to_string()).into())
    }

    /// Let in-flight deliveries finish, then flush the store.
    pub async fn shutdown(&self) -> Result<()> {
        self.dispatcher.wait_idle().await;
        self.store.read().await.save_all()?;
        Ok(())
    }
}
