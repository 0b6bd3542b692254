//! Service layer for the session service.
//!
//! # Components
//!
//! - `session_store` - persistence seam over the repositories, plus an in-memory mock
//! - `lifecycle_actions` - guarded status transitions and their side effects
//! - `role_selection` - the public role selection engine
//! - `session_service` - command path used by the HTTP handlers
//! - `notifier` - member notifications and session presentation
//! - `event_sync` - external calendar event sync

pub mod event_sync;
pub mod lifecycle_actions;
pub mod notifier;
pub mod role_selection;
pub mod session_service;
pub mod session_store;

pub use event_sync::{DisabledEventSync, EventSync, HttpEventSync};
pub use lifecycle_actions::{LifecycleActions, SessionLifecycle, TransitionResult};
pub use notifier::{LogNotifier, Notifier, WebhookNotifier};
pub use role_selection::RoleSelectionEngine;
pub use session_service::SessionService;
pub use session_store::{PgSessionStore, SessionStore};
