pub mod envelope;
pub mod events;
pub mod ids;
pub mod options;
pub mod record;

pub use envelope::TaskEnvelope;
pub use events::JobEvent;
pub use ids::{ClaimToken, JobId};
pub use options::{BackoffPolicy, EnqueueOptions, RetentionPolicy};
pub use record::{ClaimedJob, FailOutcome, JobRecord, JobStatus};
