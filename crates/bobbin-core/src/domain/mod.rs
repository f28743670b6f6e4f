//! Domain model (ids, tasks, dlq items, flags, outcomes, posture, events).

pub mod capability;
pub mod dlq;
pub mod errors;
pub mod events;
pub mod flag;
pub mod health;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;
pub mod tenant;

pub use capability::Capability;
pub use dlq::{DlqItem, DlqStatus, ReplayRun};
pub use errors::{BobbinError, ErrorKind};
pub use events::{AuditAction, AuditEvent};
pub use flag::{FeatureFlag, FlagScope, FlagUpdate, OperatingMode};
pub use health::{Check, CheckStatus, Checks, HealthPosture, Overall};
pub use ids::{DlqItemId, TaskId, TraceId, WorkerId};
pub use outcome::{FailureKind, HandlerError, Outcome};
pub use state::TaskStatus;
pub use task::{NewTask, TaskRecord, Transition};
pub use tenant::TenantId;
