//! SLA policy store and tracker.
//!
//! Policies are a flat priority -> (response, resolution) budget lookup. The
//! tracker stamps due times on a ticket once, at creation, and re-evaluates
//! breach flags lazily whenever the ticket is read, listed or updated.

use crate::error::PolicyError;
use crate::types::{Priority, SlaPolicy, Ticket};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSlaPolicy {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: Priority,
    pub response_time_hours: f64,
    pub resolution_time_hours: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlaPolicyPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub response_time_hours: Option<f64>,
    pub resolution_time_hours: Option<f64>,
    pub is_active: Option<bool>,
}

/// Convert a fractional hour budget to a duration, at microsecond precision.
pub fn hours(h: f64) -> Option<Duration> {
    let us = (h * 3_600_000_000.0).round();
    if !us.is_finite() || us <= 0.0 || us >= i64::MAX as f64 {
        return None;
    }
    Some(Duration::microseconds(us as i64))
}

fn check_hours(field: &'static str, value: f64) -> Result<(), PolicyError> {
    if value.is_finite() && value > 0.0 && hours(value).is_some() {
        Ok(())
    } else {
        Err(PolicyError::InvalidHours { field, value })
    }
}

#[derive(Debug, Default)]
pub struct SlaPolicyStore {
    policies: HashMap<String, SlaPolicy>,
}

impl SlaPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policies(items: impl IntoIterator<Item = SlaPolicy>) -> Self {
        Self {
            policies: items.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn create(&mut self, input: NewSlaPolicy, now: DateTime<Utc>) -> Result<SlaPolicy, PolicyError> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(PolicyError::EmptyName);
        }
        if self.policies.values().any(|p| p.name == name) {
            return Err(PolicyError::DuplicateName(name));
        }
        check_hours("response_time_hours", input.response_time_hours)?;
        check_hours("resolution_time_hours", input.resolution_time_hours)?;

        let policy = SlaPolicy {
            id: format!("sla_{}", &Uuid::new_v4().simple().to_string()[..12]),
            name,
            description: input.description,
            priority: input.priority,
            response_time_hours: input.response_time_hours,
            resolution_time_hours: input.resolution_time_hours,
            is_active: input.is_active,
            created_at: now,
            updated_at: None,
        };
        self.policies.insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }

    pub fn update(
        &mut self,
        id: &str,
        patch: SlaPolicyPatch,
        now: DateTime<Utc>,
    ) -> Result<SlaPolicy, PolicyError> {
        if !self.policies.contains_key(id) {
            return Err(PolicyError::NotFound(id.to_string()));
        }
        if let Some(name) = &patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(PolicyError::EmptyName);
            }
            if self.policies.values().any(|p| p.id != id && p.name == name) {
                return Err(PolicyError::DuplicateName(name.to_string()));
            }
        }
        if let Some(h) = patch.response_time_hours {
            check_hours("response_time_hours", h)?;
        }
        if let Some(h) = patch.resolution_time_hours {
            check_hours("resolution_time_hours", h)?;
        }

        let policy = self
            .policies
            .get_mut(id)
            .ok_or_else(|| PolicyError::NotFound(id.to_string()))?;
        if let Some(name) = patch.name {
            policy.name = name.trim().to_string();
        }
        if patch.description.is_some() {
            policy.description = patch.description;
        }
        if let Some(priority) = patch.priority {
            policy.priority = priority;
        }
        if let Some(h) = patch.response_time_hours {
            policy.response_time_hours = h;
        }
        if let Some(h) = patch.resolution_time_hours {
            policy.resolution_time_hours = h;
        }
        if let Some(active) = patch.is_active {
            policy.is_active = active;
        }
        policy.updated_at = Some(now);
        Ok(policy.clone())
    }

    pub fn remove(&mut self, id: &str) -> Result<SlaPolicy, PolicyError> {
        self.policies
            .remove(id)
            .ok_or_else(|| PolicyError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&SlaPolicy> {
        self.policies.get(id)
    }

    /// Oldest first.
    pub fn list(&self, active_only: bool) -> Vec<&SlaPolicy> {
        let mut items: Vec<&SlaPolicy> = self
            .policies
            .values()
            .filter(|p| !active_only || p.is_active)
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// The authoritative active policy for `priority`: the oldest active one.
    pub fn active_for(&self, priority: Priority) -> Option<&SlaPolicy> {
        self.policies
            .values()
            .filter(|p| p.is_active && p.priority == priority)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
    }
}

/// Write `value` into `slot` only if it is empty. Returns whether it wrote.
pub fn set_once<T>(slot: &mut Option<T>, value: T) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(value);
    true
}

/// Raise `flag` if it is not already raised. Never lowers it.
pub fn latch(flag: &mut bool) -> bool {
    if *flag {
        return false;
    }
    *flag = true;
    true
}

/// Attach the active policy for the ticket's priority and stamp due times.
///
/// Leaves every SLA field unset when no active policy exists or the deadline
/// arithmetic overflows; neither case fails ticket creation.
pub fn apply_policy(ticket: &mut Ticket, policies: &SlaPolicyStore) -> bool {
    let Some(policy) = policies.active_for(ticket.priority) else {
        tracing::debug!(ticket_id = %ticket.id, priority = ticket.priority.as_str(), "no active SLA policy");
        return false;
    };

    let response_due = hours(policy.response_time_hours)
        .and_then(|d| ticket.created_at.checked_add_signed(d));
    let resolution_due = hours(policy.resolution_time_hours)
        .and_then(|d| ticket.created_at.checked_add_signed(d));

    match (response_due, resolution_due) {
        (Some(response_due), Some(resolution_due)) => {
            ticket.sla_policy_id = Some(policy.id.clone());
            ticket.response_due = Some(response_due);
            ticket.resolution_due = Some(resolution_due);
            true
        }
        _ => {
            tracing::warn!(
                ticket_id = %ticket.id,
                policy_id = %policy.id,
                "SLA deadline out of range, ticket left without SLA"
            );
            false
        }
    }
}

/// Flags newly raised by one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreachUpdate {
    pub response: bool,
    pub resolution: bool,
}

impl BreachUpdate {
    pub fn any(self) -> bool {
        self.response || self.resolution
    }
}

/// Earliest moment the ticket reached resolved or closed.
fn first_settled_at(ticket: &Ticket) -> Option<DateTime<Utc>> {
    match (ticket.resolved_at, ticket.closed_at) {
        (Some(r), Some(c)) => Some(r.min(c)),
        (r, c) => r.or(c),
    }
}

/// Re-check both SLA windows against `now`. The two checks are independent
/// and can only ever raise a flag. A ticket first settled on or before its
/// resolution deadline has met that window for good, even if reopened later.
pub fn evaluate_breach(ticket: &mut Ticket, now: DateTime<Utc>) -> BreachUpdate {
    let mut update = BreachUpdate::default();

    if let Some(due) = ticket.response_due {
        if ticket.first_response_at.is_none() && now > due {
            update.response = latch(&mut ticket.response_breached);
        }
    }

    if let Some(due) = ticket.resolution_due {
        let met = first_settled_at(ticket).is_some_and(|at| at <= due);
        if !met && !ticket.status.is_terminal() && now > due {
            update.resolution = latch(&mut ticket.resolution_breached);
        }
    }

    if update.any() {
        tracing::info!(
            ticket_id = %ticket.id,
            response = update.response,
            resolution = update.resolution,
            "SLA breached"
        );
    }
    update
}
