use async_trait::async_trait;
use serde_json::Value;

use crate::{ProcessError, TaskEnvelope};

/// The seam between the worker and whatever does the actual work.
///
/// Exactly one outcome per invocation: an opaque success payload, or an
/// error the worker reports to the queue verbatim. Implementations must not
/// retry internally - the queue owns the retry schedule, and a second layer
/// of retries would amplify load on a struggling downstream.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process one envelope to completion or failure
    async fn process(&self, envelope: &TaskEnvelope) -> Result<Value, ProcessError>;
}
