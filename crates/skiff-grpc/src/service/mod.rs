//! gRPC service implementations and the state they share.

use std::sync::Arc;

use dashmap::DashMap;
use skiff::{CopyMode, FileSystem, JobDescription, RemotePath, Scheduler};
use tonic::Status;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{CloseReport, HandleKind, HandleRegistry, SessionRequest};
use crate::tracker::OperationTracker;

mod filesystem;
mod scheduler;

pub use filesystem::FileSystemGateway;
pub use scheduler::SchedulerGateway;

/// Parameters a background copy was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyParameters {
    /// Source path on the owning file system
    pub source: RemotePath,
    /// Handle id of the destination file system
    pub destination_filesystem: String,
    /// Destination path
    pub destination: RemotePath,
    /// What to do with existing targets
    pub mode: CopyMode,
    /// Copy directories recursively
    pub recursive: bool,
}

/// Registries and trackers shared by both services.
#[derive(Debug)]
pub struct GatewayState {
    /// Open file system sessions
    pub file_systems: HandleRegistry<dyn FileSystem>,
    /// Open scheduler sessions
    pub schedulers: HandleRegistry<dyn Scheduler>,
    /// Background copies by owning file system
    pub copies: OperationTracker<CopyParameters>,
    /// Submitted jobs by owning scheduler
    pub jobs: OperationTracker<JobDescription>,
    /// Id of the file system registered on behalf of each scheduler
    shared_file_systems: DashMap<String, String>,
    /// Gateway settings
    pub config: GatewayConfig,
}

impl GatewayState {
    /// Create empty state.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            file_systems: HandleRegistry::new(HandleKind::FileSystem),
            schedulers: HandleRegistry::new(HandleKind::Scheduler),
            copies: OperationTracker::new(),
            jobs: OperationTracker::new(),
            shared_file_systems: DashMap::new(),
            config,
        }
    }

    /// Register the file system of scheduler `owner`, or return the id of a
    /// live one created from the same request.
    ///
    /// A file system registered here is closed along with the last scheduler
    /// that shared it. One the client opened itself is only reused.
    pub(crate) fn share_file_system(
        &self,
        owner: &str,
        request: SessionRequest,
        fs: Arc<dyn FileSystem>,
    ) -> String {
        let opened_by_client = self
            .file_systems
            .find_live(&request)
            .is_some_and(|id| !self.shared_file_systems.iter().any(|e| *e.value() == id));
        let id = self.file_systems.put_or_reuse(request, fs);
        if !opened_by_client {
            self.shared_file_systems.insert(owner.to_string(), id.clone());
        }
        id
    }

    /// Close scheduler `id`, forget its jobs and release the file system
    /// shared on its behalf.
    pub(crate) fn close_scheduler(&self, id: &str) -> GatewayResult<()> {
        self.schedulers.get(id)?;
        let forgotten = self.jobs.forget_owner(id);
        tracing::debug!(scheduler = %id, jobs = forgotten.len(), "forgetting jobs of closed scheduler");
        let closed = self.schedulers.close(id);
        self.release_shared_file_system(id);
        closed
    }

    fn release_shared_file_system(&self, scheduler: &str) {
        let Some((_, fs_id)) = self.shared_file_systems.remove(scheduler) else {
            return;
        };
        if self.shared_file_systems.iter().any(|e| *e.value() == fs_id) {
            return;
        }
        self.copies.forget_owner(&fs_id);
        // Already gone if the client closed it first.
        let Some((fs, _)) = self.file_systems.remove(&fs_id) else {
            return;
        };
        tracing::debug!(scheduler = %scheduler, filesystem = %fs_id, "closing shared file system");
        if let Err(err) = fs.close() {
            tracing::warn!(filesystem = %fs_id, error = %err, "failed to close shared file system");
        }
    }

    /// Close every session. Schedulers go first since they may use file
    /// systems that are registered too.
    pub fn close_all(&self) -> (CloseReport, CloseReport) {
        for (id, _) in self.schedulers.list() {
            self.jobs.forget_owner(&id);
        }
        for (id, _) in self.file_systems.list() {
            self.copies.forget_owner(&id);
        }
        self.shared_file_systems.clear();
        let schedulers = self.schedulers.close_all();
        let file_systems = self.file_systems.close_all();
        (schedulers, file_systems)
    }
}

/// Run a blocking library call on a thread that may block.
pub(crate) async fn blocking<T, F>(call: F) -> Result<T, Status>
where
    F: FnOnce() -> GatewayResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(GatewayError::from)?
        .map_err(Status::from)
}

/// Id carried by an optional handle field.
pub(crate) fn required_id<'a>(id: Option<&'a str>, field: &str) -> Result<&'a str, Status> {
    match id {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(Status::invalid_argument(format!("{field} is required"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use skiff::{Credential, LocalScheduler, Session};

    fn open_scheduler(state: &GatewayState, label: &str) -> (String, Arc<dyn Scheduler>) {
        let scheduler: Arc<dyn Scheduler> =
            Arc::new(LocalScheduler::open("", &Credential::default(), &BTreeMap::new()).unwrap());
        let request = SessionRequest {
            adaptor: "local".to_string(),
            location: label.to_string(),
            credential: Credential::default(),
            properties: BTreeMap::new(),
        };
        let id = state.schedulers.put(request, Arc::clone(&scheduler)).unwrap();
        (id, scheduler)
    }

    fn share(state: &GatewayState, scheduler_id: &str, scheduler: &dyn Scheduler) -> (String, Arc<dyn FileSystem>) {
        let fs = scheduler.file_system().unwrap();
        let id = state.share_file_system(scheduler_id, request_of(fs.as_ref()), Arc::clone(&fs));
        (id, fs)
    }

    fn request_of(fs: &dyn FileSystem) -> SessionRequest {
        SessionRequest {
            adaptor: fs.adaptor_name().to_string(),
            location: fs.location().to_string(),
            credential: Credential::default(),
            properties: fs.properties().clone(),
        }
    }

    #[test]
    fn test_closing_scheduler_closes_its_file_system() {
        let state = GatewayState::new(GatewayConfig::default());
        let (id, scheduler) = open_scheduler(&state, "a");
        let (fs_id, fs) = share(&state, &id, scheduler.as_ref());
        assert!(state.file_systems.get(&fs_id).is_ok());

        state.close_scheduler(&id).unwrap();
        assert!(state.schedulers.is_empty());
        assert!(state.file_systems.get(&fs_id).is_err());
        assert!(!fs.is_open());
    }

    #[test]
    fn test_shared_file_system_outlives_all_but_last_scheduler() {
        let state = GatewayState::new(GatewayConfig::default());
        let (first, first_scheduler) = open_scheduler(&state, "a");
        let (second, second_scheduler) = open_scheduler(&state, "b");
        let (fs_id, _) = share(&state, &first, first_scheduler.as_ref());
        let (reused, _) = share(&state, &second, second_scheduler.as_ref());
        assert_eq!(fs_id, reused);

        state.close_scheduler(&first).unwrap();
        assert!(state.file_systems.get(&fs_id).is_ok());
        state.close_scheduler(&second).unwrap();
        assert!(state.file_systems.is_empty());
    }

    #[test]
    fn test_client_file_system_survives_scheduler_close() {
        let state = GatewayState::new(GatewayConfig::default());
        let (id, scheduler) = open_scheduler(&state, "a");
        let fs = scheduler.file_system().unwrap();
        let client_id = state
            .file_systems
            .put(request_of(fs.as_ref()), Arc::clone(&fs))
            .unwrap();

        let (shared_id, _) = share(&state, &id, scheduler.as_ref());
        assert_eq!(shared_id, client_id);

        state.close_scheduler(&id).unwrap();
        assert!(state.file_systems.get(&client_id).is_ok());
        assert!(fs.is_open());
    }

    #[test]
    fn test_close_unknown_scheduler_is_not_found() {
        let state = GatewayState::new(GatewayConfig::default());
        let err = state.close_scheduler("nope").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
