//! Scheduler adaptor interface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AdaptorResult, StatusError};
use crate::filesystem::FileSystem;
use crate::session::Session;
use crate::stream::InteractiveStreams;

/// What to run and how.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct JobDescription {
    /// Program to execute
    pub executable: String,
    /// Program arguments
    pub arguments: Vec<String>,
    /// Working directory; relative paths resolve against the scheduler's
    /// file system working directory
    pub working_directory: Option<String>,
    /// Extra environment variables
    pub environment: BTreeMap<String, String>,
    /// Queue to submit to; `None` selects the default queue
    pub queue_name: Option<String>,
    /// Maximum run time in minutes
    pub max_runtime: Option<u32>,
    /// Number of nodes
    pub node_count: Option<u32>,
    /// Processes per node
    pub processes_per_node: Option<u32>,
    /// Start one process regardless of node and process counts
    pub start_single_process: bool,
    /// File to feed to standard input (batch jobs only)
    pub stdin: Option<String>,
    /// File receiving standard output (batch jobs only)
    pub stdout: Option<String>,
    /// File receiving standard error (batch jobs only)
    pub stderr: Option<String>,
    /// Scheduler specific options
    pub job_options: BTreeMap<String, String>,
}

/// State of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Identifier assigned by the scheduler
    pub job_id: String,
    /// Back-end specific state name
    pub state: String,
    /// Job is running
    pub running: bool,
    /// Job has finished (successfully or not)
    pub done: bool,
    /// Exit code, once known
    pub exit_code: Option<i32>,
    /// Failure, if the job could not run to completion
    pub error: Option<StatusError>,
    /// Additional back-end specific information
    pub scheduler_specific_information: BTreeMap<String, String>,
}

/// State of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Queue name
    pub queue_name: String,
    /// Failure, if the status could not be determined
    pub error: Option<StatusError>,
    /// Additional back-end specific information
    pub scheduler_specific_information: BTreeMap<String, String>,
}

/// A session to a job scheduler.
///
/// All methods block; callers running on an async runtime must move them to
/// a thread that is allowed to block.
pub trait Scheduler: Session {
    /// Names of all queues.
    fn queue_names(&self) -> AdaptorResult<Vec<String>>;

    /// Queue used when a job description names none.
    fn default_queue_name(&self) -> AdaptorResult<String>;

    /// Status of one queue.
    fn queue_status(&self, queue: &str) -> AdaptorResult<QueueStatus>;

    /// Status of several queues; an empty list means all queues.
    ///
    /// Unknown queues are reported inside their status rather than failing
    /// the whole call.
    fn queue_statuses(&self, queues: &[String]) -> AdaptorResult<Vec<QueueStatus>>;

    /// Identifiers of the jobs in `queues`; an empty list means all queues.
    fn jobs(&self, queues: &[String]) -> AdaptorResult<Vec<String>>;

    /// Submit a job that runs without a client attached.
    fn submit_batch_job(&self, description: &JobDescription) -> AdaptorResult<String>;

    /// Start a job whose standard streams are handed to the caller.
    fn submit_interactive_job(&self, description: &JobDescription)
    -> AdaptorResult<InteractiveStreams>;

    /// Status of one job.
    fn job_status(&self, job_id: &str) -> AdaptorResult<JobStatus>;

    /// Status of several jobs. Unknown jobs are reported inside their status.
    fn job_statuses(&self, job_ids: &[String]) -> Vec<JobStatus>;

    /// Cancel a job and return its status.
    fn cancel_job(&self, job_id: &str) -> AdaptorResult<JobStatus>;

    /// Block until the job is done or `timeout` elapses. Zero waits forever.
    fn wait_until_done(&self, job_id: &str, timeout: Duration) -> AdaptorResult<JobStatus>;

    /// Block until the job is running (or done) or `timeout` elapses. Zero
    /// waits forever.
    fn wait_until_running(&self, job_id: &str, timeout: Duration) -> AdaptorResult<JobStatus>;

    /// File system the scheduler's jobs see.
    fn file_system(&self) -> AdaptorResult<Arc<dyn FileSystem>>;
}
