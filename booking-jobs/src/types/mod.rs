pub mod events;
pub mod ids;
pub mod job;

pub use events::JobEvent;
pub use ids::{JobId, LockToken};
pub use job::{DedupePolicy, Deferred, Job, JobStatus, NewJob};
pub(crate) use job::{Outcome, Superseded};
