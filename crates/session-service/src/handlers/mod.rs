//! HTTP request handlers for the session service.

pub mod health;
pub mod metrics;
pub mod scheduler;
pub mod sessions;

pub use health::health_check;
pub use metrics::metrics_handler;
pub use scheduler::scheduled_tasks;
pub use sessions::{
    cancel_session, create_session, end_session, get_session, remove_member,
    reschedule_session, select_role,
};
