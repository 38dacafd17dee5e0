//! Ticket status transitions and their timestamp side effects.

use crate::error::LifecycleError;
use crate::sla::set_once;
use crate::types::{Ticket, TicketStatus};
use chrono::{DateTime, Utc};

/// A status change that actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub old: TicketStatus,
    pub new: TicketStatus,
}

/// Move `ticket` to `to`.
///
/// Returns `None` when the status is unchanged. `resolved_at` and `closed_at`
/// record the first entry into their status and are never overwritten.
pub fn transition(
    ticket: &mut Ticket,
    to: TicketStatus,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>, LifecycleError> {
    let from = ticket.status;
    if from == to {
        return Ok(None);
    }
    if !from.can_transition_to(to) {
        return Err(LifecycleError::IllegalTransition { from, to });
    }

    ticket.status = to;
    ticket.updated_at = Some(now);
    match to {
        TicketStatus::Resolved => {
            set_once(&mut ticket.resolved_at, now);
        }
        TicketStatus::Closed => {
            set_once(&mut ticket.closed_at, now);
        }
        _ => {}
    }

    Ok(Some(StatusChange { old: from, new: to }))
}

/// Account for a new comment. Only a public comment counts as the first
/// response. Returns whether it did.
pub fn record_comment(ticket: &mut Ticket, is_internal: bool, now: DateTime<Utc>) -> bool {
    ticket.updated_at = Some(now);
    if is_internal {
        return false;
    }
    set_once(&mut ticket.first_response_at, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sla::{apply_policy, evaluate_breach, NewSlaPolicy, SlaPolicyStore};
    use crate::types::Priority;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn ticket() -> Ticket {
        Ticket::new(
            "tkt_1".into(),
            "VPN down".into(),
            "Cannot connect".into(),
            Priority::High,
            "u_1".into(),
            t0(),
        )
    }

    #[test]
    fn unchanged_status_has_no_side_effect() {
        let mut t = ticket();
        assert_eq!(transition(&mut t, TicketStatus::New, t0()).unwrap(), None);
        assert_eq!(t.updated_at, None);
    }

    #[test]
    fn resolved_at_is_first_occurrence_only() {
        let mut t = ticket();
        let first = t0() + Duration::hours(1);
        let change = transition(&mut t, TicketStatus::Resolved, first).unwrap();
        assert_eq!(
            change,
            Some(StatusChange {
                old: TicketStatus::New,
                new: TicketStatus::Resolved
            })
        );
        transition(&mut t, TicketStatus::InProgress, first + Duration::hours(1)).unwrap();
        transition(&mut t, TicketStatus::Resolved, first + Duration::hours(2)).unwrap();
        assert_eq!(t.resolved_at, Some(first));
    }

    #[test]
    fn closed_at_survives_reopen() {
        let mut t = ticket();
        let first = t0() + Duration::hours(2);
        transition(&mut t, TicketStatus::Closed, first).unwrap();
        transition(&mut t, TicketStatus::InProgress, first + Duration::hours(1)).unwrap();
        transition(&mut t, TicketStatus::Closed, first + Duration::hours(3)).unwrap();
        assert_eq!(t.closed_at, Some(first));
        assert_eq!(t.resolved_at, None);
    }

    #[test]
    fn illegal_transition_leaves_ticket_untouched() {
        let mut t = ticket();
        transition(&mut t, TicketStatus::Resolved, t0()).unwrap();
        let before = t.clone();
        let err = transition(&mut t, TicketStatus::Assigned, t0() + Duration::hours(1)).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::IllegalTransition {
                from: TicketStatus::Resolved,
                to: TicketStatus::Assigned
            }
        ));
        assert_eq!(t, before);
    }

    #[test]
    fn internal_comment_is_not_a_response() {
        let mut t = ticket();
        assert!(!record_comment(&mut t, true, t0() + Duration::minutes(5)));
        assert_eq!(t.first_response_at, None);

        let at = t0() + Duration::minutes(10);
        assert!(record_comment(&mut t, false, at));
        assert!(!record_comment(&mut t, false, at + Duration::minutes(1)));
        assert_eq!(t.first_response_at, Some(at));
    }

    #[test]
    fn new_to_closed_without_response_breaches_on_response_window_only() {
        let mut store = SlaPolicyStore::new();
        store
            .create(
                NewSlaPolicy {
                    name: "High".into(),
                    description: None,
                    priority: Priority::High,
                    response_time_hours: 4.0,
                    resolution_time_hours: 24.0,
                    is_active: true,
                },
                t0(),
            )
            .unwrap();

        let mut t = ticket();
        apply_policy(&mut t, &store);
        transition(&mut t, TicketStatus::Closed, t0() + Duration::hours(1)).unwrap();

        evaluate_breach(&mut t, t0() + Duration::hours(2));
        assert!(!t.response_breached && !t.resolution_breached);

        evaluate_breach(&mut t, t0() + Duration::hours(48));
        assert!(t.response_breached);
        assert!(!t.resolution_breached);
    }
}
