use crate::error::StoreError;
use crate::registry::WebhookRegistry;
use crate::sla::SlaPolicyStore;
use crate::types::{DeliveryLogEntry, SlaPolicy, SubscriptionStats, WebhookSubscription};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type SharedStore = Arc<RwLock<Store>>;

const WEBHOOKS_FILE: &str = "webhooks.json";
const POLICIES_FILE: &str = "sla_policies.json";
const DELIVERIES_DIR: &str = "deliveries";

/// Policies, subscriptions and the delivery log, optionally backed by JSON
/// files under a data directory. Without a data directory everything stays
/// in memory.
#[derive(Debug, Default)]
pub struct Store {
    pub policies: SlaPolicyStore,
    pub registry: WebhookRegistry,
    deliveries: HashMap<String, Vec<DeliveryLogEntry>>,
    data_dir: Option<PathBuf>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir: Some(data_dir),
            ..Self::default()
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    pub fn load(&mut self) -> Result<(), StoreError> {
        let Some(dir) = self.data_dir.clone() else {
            return Ok(());
        };

        let webhooks_path = dir.join(WEBHOOKS_FILE);
        if webhooks_path.exists() {
            let content = std::fs::read_to_string(&webhooks_path)?;
            let items: Vec<WebhookSubscription> = serde_json::from_str(&content)?;
            self.registry = WebhookRegistry::from_subscriptions(items);
        }

        let policies_path = dir.join(POLICIES_FILE);
        if policies_path.exists() {
            let content = std::fs::read_to_string(&policies_path)?;
            let items: Vec<SlaPolicy> = serde_json::from_str(&content)?;
            self.policies = SlaPolicyStore::from_policies(items);
        }

        // Delivery logs are one JSON object per line, appended as attempts finish.
        let deliveries_dir = dir.join(DELIVERIES_DIR);
        if deliveries_dir.exists() {
            for entry in std::fs::read_dir(&deliveries_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let content = std::fs::read_to_string(&path)?;
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<DeliveryLogEntry>(line) {
                        Ok(item) => self
                            .deliveries
                            .entry(item.subscription_id.clone())
                            .or_default()
                            .push(item),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "skipping corrupt delivery log line")
                        }
                    }
                }
            }
        }

        tracing::info!(
            webhooks = self.registry.len(),
            policies = self.policies.len(),
            "store loaded"
        );
        Ok(())
    }

    pub fn save_webhooks(&self) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let content = serde_json::to_string_pretty(&self.registry.list())?;
        std::fs::write(dir.join(WEBHOOKS_FILE), content)?;
        Ok(())
    }

    pub fn save_policies(&self) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let content = serde_json::to_string_pretty(&self.policies.list(false))?;
        std::fs::write(dir.join(POLICIES_FILE), content)?;
        Ok(())
    }

    pub fn save_all(&self) -> Result<(), StoreError> {
        self.save_webhooks()?;
        self.save_policies()
    }

    fn append_delivery_file(&self, entry: &DeliveryLogEntry) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let dir = dir.join(DELIVERIES_DIR);
        std::fs::create_dir_all(&dir)?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.jsonl", entry.subscription_id)))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Append a finished attempt to the log. When the attempt reached the
    /// target, the subscription's last-triggered time moves forward.
    pub fn record_delivery(&mut self, entry: DeliveryLogEntry) -> Result<(), StoreError> {
        if entry.reached_target() {
            if let Some(at) = entry.delivered_at {
                self.registry.mark_triggered(&entry.subscription_id, at);
            }
        }
        let persisted = self.append_delivery_file(&entry);
        self.deliveries
            .entry(entry.subscription_id.clone())
            .or_default()
            .push(entry);
        persisted
    }

    /// Newest first by `triggered_at`, not by arrival order.
    pub fn deliveries_page(
        &self,
        subscription_id: &str,
        skip: usize,
        limit: usize,
    ) -> Vec<&DeliveryLogEntry> {
        let Some(entries) = self.deliveries.get(subscription_id) else {
            return Vec::new();
        };
        let mut items: Vec<&DeliveryLogEntry> = entries.iter().collect();
        items.sort_by(|a, b| {
            b.triggered_at
                .cmp(&a.triggered_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        items.into_iter().skip(skip).take(limit).collect()
    }

    pub fn delivery_count(&self, subscription_id: &str) -> u64 {
        self.deliveries
            .get(subscription_id)
            .map_or(0, |e| e.len() as u64)
    }

    pub fn stats(&self, subscription_id: &str) -> Option<SubscriptionStats> {
        let sub = self.registry.get(subscription_id)?;
        Some(SubscriptionStats {
            subscription_id: sub.id.clone(),
            delivery_count: self.delivery_count(subscription_id),
            last_triggered_at: sub.last_triggered_at,
        })
    }
}
