use crate::error::RegistryError;
use crate::types::{EventType, WebhookSubscription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

fn default_true() -> bool {
    true
}

/// Distinguishes an absent field from an explicit `null`.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewWebhook {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub events: BTreeSet<EventType>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    /// `null` clears the secret.
    #[serde(default, deserialize_with = "double_option")]
    pub secret: Option<Option<String>>,
    pub events: Option<BTreeSet<EventType>>,
    pub is_active: Option<bool>,
}

fn check_url(url: &str) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    let parsed = reqwest::Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(())
}

/// Subscriptions keyed by id.
#[derive(Debug, Default)]
pub struct WebhookRegistry {
    subscriptions: HashMap<String, WebhookSubscription>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_subscriptions(items: impl IntoIterator<Item = WebhookSubscription>) -> Self {
        Self {
            subscriptions: items.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Active subscriptions whose event set contains `event`, in no
    /// particular order.
    pub fn subscribers_for(&self, event: EventType) -> Vec<WebhookSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.listens_to(event))
            .cloned()
            .collect()
    }

    pub fn create(
        &mut self,
        input: NewWebhook,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscription, RegistryError> {
        check_url(&input.url)?;
        if input.events.is_empty() {
            return Err(RegistryError::NoEvents);
        }

        let sub = WebhookSubscription {
            id: format!("wh_{}", &Uuid::new_v4().to_string()[..8]),
            name: input.name,
            url: input.url,
            secret: input.secret,
            events: input.events,
            is_active: input.is_active,
            last_triggered_at: None,
            created_at: now,
        };
        self.subscriptions.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    pub fn update(
        &mut self,
        id: &str,
        patch: WebhookPatch,
    ) -> Result<WebhookSubscription, RegistryError> {
        if let Some(url) = &patch.url {
            check_url(url)?;
        }
        if patch.events.as_ref().is_some_and(|e| e.is_empty()) {
            return Err(RegistryError::NoEvents);
        }

        let sub = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if let Some(name) = patch.name {
            sub.name = name;
        }
        if let Some(url) = patch.url {
            sub.url = url;
        }
        if let Some(secret) = patch.secret {
            sub.secret = secret;
        }
        if let Some(events) = patch.events {
            sub.events = events;
        }
        if let Some(active) = patch.is_active {
            sub.is_active = active;
        }
        Ok(sub.clone())
    }

    pub fn remove(&mut self, id: &str) -> Result<WebhookSubscription, RegistryError> {
        self.subscriptions
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&WebhookSubscription> {
        self.subscriptions.get(id)
    }

    pub fn list(&self) -> Vec<&WebhookSubscription> {
        let mut items: Vec<&WebhookSubscription> = self.subscriptions.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Stamp the time of the latest delivery that reached the target.
    pub fn mark_triggered(&mut self, id: &str, at: DateTime<Utc>) {
        if let Some(sub) = self.subscriptions.get_mut(id) {
            // Deliveries finish out of order; keep the latest.
            if sub.last_triggered_at.map_or(true, |prev| prev < at) {
                sub.last_triggered_at = Some(at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(name: &str, events: &[EventType]) -> NewWebhook {
        NewWebhook {
            name: name.into(),
            url: format!("https://hooks.example.com/{name}"),
            secret: None,
            events: events.iter().copied().collect(),
            is_active: true,
        }
    }

    #[test]
    fn subscribers_are_matched_by_set_membership() {
        let mut reg = WebhookRegistry::new();
        let now = Utc::now();
        let a = reg
            .create(hook("a", &[EventType::TicketCreated, EventType::TicketClosed]), now)
            .unwrap();
        reg.create(hook("b", &[EventType::CommentAdded]), now).unwrap();
        let mut c = hook("c", &[EventType::TicketCreated]);
        c.is_active = false;
        reg.create(c, now).unwrap();

        let subs = reg.subscribers_for(EventType::TicketCreated);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, a.id);
        assert_eq!(reg.subscribers_for(EventType::TicketClosed).len(), 1);
        assert!(reg.subscribers_for(EventType::TicketUpdated).is_empty());
    }

    #[test]
    fn rejects_bad_urls_and_empty_event_sets() {
        let mut reg = WebhookRegistry::new();
        let mut bad = hook("x", &[EventType::TicketCreated]);
        bad.url = "ftp://example.com/hook".into();
        assert!(matches!(
            reg.create(bad, Utc::now()),
            Err(RegistryError::InvalidUrl { .. })
        ));
        assert!(matches!(
            reg.create(hook("y", &[]), Utc::now()),
            Err(RegistryError::NoEvents)
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn patch_null_clears_secret() {
        let mut reg = WebhookRegistry::new();
        let mut input = hook("s", &[EventType::TicketCreated]);
        input.secret = Some("k".into());
        let sub = reg.create(input, Utc::now()).unwrap();

        let untouched: WebhookPatch = serde_json::from_str(r#"{"name":"renamed"}"#).unwrap();
        let updated = reg.update(&sub.id, untouched).unwrap();
        assert_eq!(updated.secret.as_deref(), Some("k"));

        let cleared: WebhookPatch = serde_json::from_str(r#"{"secret":null}"#).unwrap();
        let updated = reg.update(&sub.id, cleared).unwrap();
        assert_eq!(updated.secret, None);
        assert_eq!(updated.name, "renamed");
    }

    #[test]
    fn mark_triggered_keeps_latest() {
        let mut reg = WebhookRegistry::new();
        let sub = reg
            .create(hook("t", &[EventType::TicketCreated]), Utc::now())
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(10);
        reg.mark_triggered(&sub.id, later);
        reg.mark_triggered(&sub.id, later - chrono::Duration::seconds(5));
        assert_eq!(reg.get(&sub.id).unwrap().last_triggered_at, Some(later));
    }
}
