//! Index of long-running operations by owning session.
//!
//! The tracker never caches progress. It only maps an operation id to the
//! session that owns it, and every poll asks that session again.

use std::fmt;

use dashmap::DashMap;
use skiff::{
    AdaptorError, AdaptorResult, CopyStatus, FileSystem, JobStatus, Scheduler,
};

use crate::error::{GatewayError, GatewayResult};

/// What kind of work an operation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Background copy
    Transfer,
    /// Job submitted for batch execution
    BatchJob,
    /// Job whose streams were forwarded to a client
    InteractiveJob,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Transfer => f.write_str("copy operation"),
            OperationKind::BatchJob | OperationKind::InteractiveJob => f.write_str("job"),
        }
    }
}

/// Association of an operation with the session it runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord<R> {
    /// Operation id handed to the client
    pub id: String,
    /// Kind of work
    pub kind: OperationKind,
    /// Id of the owning session
    pub owner: String,
    /// Id the session uses for the operation
    pub external_id: String,
    /// Parameters the operation was started with
    pub request: R,
}

/// Session side of an operation: status and cancellation.
pub trait OperationBackend: Send + Sync {
    /// Status reported by the session.
    type Status;

    /// Fresh status of the operation.
    fn status(&self, external_id: &str) -> AdaptorResult<Self::Status>;

    /// Cancel the operation and return its status.
    fn cancel(&self, external_id: &str) -> AdaptorResult<Self::Status>;

    /// Whether a status is terminal.
    fn is_done(status: &Self::Status) -> bool;
}

impl OperationBackend for dyn FileSystem {
    type Status = CopyStatus;

    fn status(&self, external_id: &str) -> AdaptorResult<CopyStatus> {
        self.copy_status(external_id)
    }

    fn cancel(&self, external_id: &str) -> AdaptorResult<CopyStatus> {
        self.cancel_copy(external_id)
    }

    fn is_done(status: &CopyStatus) -> bool {
        status.done
    }
}

impl OperationBackend for dyn Scheduler {
    type Status = JobStatus;

    fn status(&self, external_id: &str) -> AdaptorResult<JobStatus> {
        self.job_status(external_id)
    }

    fn cancel(&self, external_id: &str) -> AdaptorResult<JobStatus> {
        self.cancel_job(external_id)
    }

    fn is_done(status: &JobStatus) -> bool {
        status.done
    }
}

/// Concurrent index from `(owner, operation id)` to operation record.
pub struct OperationTracker<R> {
    records: DashMap<(String, String), OperationRecord<R>>,
}

impl<R> fmt::Debug for OperationTracker<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTracker")
            .field("records", &self.records.len())
            .finish()
    }
}

impl<R> Default for OperationTracker<R> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl<R: Clone> OperationTracker<R> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an operation.
    pub fn register(&self, record: OperationRecord<R>) {
        tracing::debug!(owner = %record.owner, id = %record.id, kind = %record.kind, "tracking operation");
        self.records
            .insert((record.owner.clone(), record.id.clone()), record);
    }

    /// Record of an operation.
    pub fn find(&self, owner: &str, id: &str) -> GatewayResult<OperationRecord<R>> {
        self.records
            .get(&key(owner, id))
            .map(|r| r.clone())
            .ok_or_else(|| {
                GatewayError::not_found(format!("no such operation {id} on {owner}"))
            })
    }

    /// Stop tracking an operation. Unknown operations are ignored.
    pub fn forget(&self, owner: &str, id: &str) -> Option<OperationRecord<R>> {
        self.records.remove(&key(owner, id)).map(|(_, r)| r)
    }

    /// Run `call` with the id the owning session uses for an operation.
    ///
    /// When the session no longer knows the operation it is forgotten and
    /// `NOT_FOUND` is returned.
    pub fn with_external_id<T>(
        &self,
        owner: &str,
        id: &str,
        call: impl FnOnce(&str) -> AdaptorResult<T>,
    ) -> GatewayResult<T> {
        let record = self.find(owner, id)?;
        call(&record.external_id).map_err(|err| self.gone(owner, &record, err))
    }

    /// Ask the owning session for the current status.
    pub fn poll<B>(&self, backend: &B, owner: &str, id: &str) -> GatewayResult<B::Status>
    where
        B: OperationBackend + ?Sized,
    {
        self.with_external_id(owner, id, |external_id| backend.status(external_id))
    }

    /// Cancel an operation. The record stays until it is deleted.
    pub fn cancel<B>(&self, backend: &B, owner: &str, id: &str) -> GatewayResult<B::Status>
    where
        B: OperationBackend + ?Sized,
    {
        self.with_external_id(owner, id, |external_id| backend.cancel(external_id))
    }

    /// Cancel the operation if it is still running, then forget it.
    ///
    /// The record is forgotten even when polling or cancelling fails. An
    /// operation the session no longer knows counts as deleted.
    pub fn delete_if_done<B>(&self, backend: &B, owner: &str, id: &str) -> GatewayResult<()>
    where
        B: OperationBackend + ?Sized,
    {
        let record = self.find(owner, id)?;
        let outcome = backend.status(&record.external_id).and_then(|status| {
            if B::is_done(&status) {
                Ok(())
            } else {
                backend.cancel(&record.external_id).map(drop)
            }
        });
        self.forget(owner, id);
        match outcome {
            Ok(()) | Err(AdaptorError::NoSuchCopy(_) | AdaptorError::NoSuchJob(_)) => Ok(()),
            Err(err) => Err(GatewayError::from(err)),
        }
    }

    /// Records owned by `owner`, sorted by operation id.
    pub fn list(&self, owner: &str) -> Vec<OperationRecord<R>> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.owner == owner)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Forget every operation of `owner` and return the records.
    pub fn forget_owner(&self, owner: &str) -> Vec<OperationRecord<R>> {
        let records = self.list(owner);
        for record in &records {
            self.forget(owner, &record.id);
        }
        records
    }

    fn gone(&self, owner: &str, record: &OperationRecord<R>, err: AdaptorError) -> GatewayError {
        match err {
            AdaptorError::NoSuchCopy(_) | AdaptorError::NoSuchJob(_) => {
                self.forget(owner, &record.id);
                GatewayError::not_found(format!(
                    "no such {} {} on {owner}",
                    record.kind, record.id
                ))
            }
            other => GatewayError::from(other),
        }
    }
}

fn key(owner: &str, id: &str) -> (String, String) {
    (owner.to_string(), id.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Backend whose operations are a map of id to (done, cancelled).
    #[derive(Default)]
    struct FakeBackend {
        ops: Mutex<HashMap<String, (bool, bool)>>,
    }

    impl FakeBackend {
        fn with(id: &str, done: bool) -> Self {
            let backend = Self::default();
            backend
                .ops
                .lock()
                .unwrap()
                .insert(id.to_string(), (done, false));
            backend
        }

        fn cancelled(&self, id: &str) -> bool {
            self.ops.lock().unwrap().get(id).is_some_and(|op| op.1)
        }
    }

    impl OperationBackend for FakeBackend {
        type Status = (bool, bool);

        fn status(&self, external_id: &str) -> AdaptorResult<(bool, bool)> {
            self.ops
                .lock()
                .unwrap()
                .get(external_id)
                .copied()
                .ok_or_else(|| AdaptorError::NoSuchJob(external_id.to_string()))
        }

        fn cancel(&self, external_id: &str) -> AdaptorResult<(bool, bool)> {
            let mut ops = self.ops.lock().unwrap();
            let op = ops
                .get_mut(external_id)
                .ok_or_else(|| AdaptorError::NoSuchJob(external_id.to_string()))?;
            *op = (true, true);
            Ok(*op)
        }

        fn is_done(status: &(bool, bool)) -> bool {
            status.0
        }
    }

    fn record(id: &str) -> OperationRecord<()> {
        OperationRecord {
            id: id.to_string(),
            kind: OperationKind::BatchJob,
            owner: "sched#1".to_string(),
            external_id: id.to_string(),
            request: (),
        }
    }

    #[test]
    fn test_unknown_operation_is_not_found_with_id() {
        let tracker = OperationTracker::<()>::new();
        let backend = FakeBackend::default();
        let err = tracker.poll(&backend, "sched#1", "job-7").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("job-7"));
        let err = tracker.cancel(&backend, "sched#1", "job-7").unwrap_err();
        assert!(err.message.contains("job-7"));
    }

    #[test]
    fn test_cancel_keeps_record() {
        let tracker = OperationTracker::new();
        let backend = FakeBackend::with("job-1", false);
        tracker.register(record("job-1"));
        tracker.cancel(&backend, "sched#1", "job-1").unwrap();
        assert!(backend.cancelled("job-1"));
        assert!(tracker.find("sched#1", "job-1").is_ok());
    }

    #[test]
    fn test_delete_cancels_running_operation() {
        let tracker = OperationTracker::new();
        let backend = FakeBackend::with("job-1", false);
        tracker.register(record("job-1"));
        tracker.delete_if_done(&backend, "sched#1", "job-1").unwrap();
        assert!(backend.cancelled("job-1"));
        assert!(tracker.list("sched#1").is_empty());
    }

    #[test]
    fn test_delete_finished_operation_does_not_cancel() {
        let tracker = OperationTracker::new();
        let backend = FakeBackend::with("job-1", true);
        tracker.register(record("job-1"));
        tracker.delete_if_done(&backend, "sched#1", "job-1").unwrap();
        assert!(!backend.cancelled("job-1"));
        assert!(tracker.find("sched#1", "job-1").is_err());
    }

    #[test]
    fn test_operation_unknown_to_backend_is_forgotten() {
        let tracker = OperationTracker::new();
        let backend = FakeBackend::default();
        tracker.register(record("job-1"));
        let err = tracker.poll(&backend, "sched#1", "job-1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(tracker.list("sched#1").is_empty());
    }

    #[test]
    fn test_poll_twice_is_idempotent() {
        let tracker = OperationTracker::new();
        let backend = FakeBackend::with("job-1", false);
        tracker.register(record("job-1"));
        let first = tracker.poll(&backend, "sched#1", "job-1").unwrap();
        let second = tracker.poll(&backend, "sched#1", "job-1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_forget_owner_only_touches_owner() {
        let tracker = OperationTracker::new();
        tracker.register(record("job-1"));
        let mut other = record("job-2");
        other.owner = "sched#2".to_string();
        tracker.register(other);
        assert_eq!(tracker.forget_owner("sched#1").len(), 1);
        assert_eq!(tracker.list("sched#2").len(), 1);
    }
}
