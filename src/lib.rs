//! Helpdesk SLA tracking and webhook notification core.
//!
//! Ticket lifecycle transitions drive two things: SLA deadline bookkeeping
//! (due times stamped at creation, breach flags raised lazily on access) and
//! asynchronous, signed webhook delivery with an append-only delivery log.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http_server;
pub mod lifecycle;
pub mod registry;
pub mod service;
pub mod sla;
pub mod store;
pub mod types;
pub mod verification;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, LifecycleError, PolicyError, RegistryError, ServiceError, StoreError};
pub use service::HelpdeskCore;
pub use store::{SharedStore, Store};
