//! The `local` scheduler adaptor: processes on the gateway host.
//!
//! Jobs go into one of three queues. `single` runs one job at a time,
//! `multi` runs up to a configurable number of jobs and `unlimited` starts
//! every job immediately. Each started job gets a reaper thread that polls
//! the child, enforces the maximum run time and carries out cancellation.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::adaptor::{
    PropertyType, SchedulerAdaptorDescription, natural_property, property, validate_properties,
};
use crate::credential::Credential;
use crate::error::{AdaptorError, AdaptorResult, StatusError};
use crate::filesystem::FileSystem;
use crate::path::RemotePath;
use crate::scheduler::{JobDescription, JobStatus, QueueStatus, Scheduler};
use crate::session::Session;
use crate::stream::InteractiveStreams;

use super::{LocalFileSystem, RETAINED_FINISHED, check_local_credential, lock};

const ADAPTOR: &str = "local";
const ID_PREFIX: &str = "local-";
const QUEUES: [&str; 3] = ["single", "multi", "unlimited"];
const DEFAULT_QUEUE: &str = "multi";

const MULTI_LIMIT_PROPERTY: &str = "skiff.adaptors.schedulers.local.queue.multi.maxConcurrentJobs";
const POLL_DELAY_PROPERTY: &str = "skiff.adaptors.schedulers.local.pollingDelay";

/// Everything needed to start a job, resolved at submission.
#[derive(Debug)]
struct Launch {
    program: String,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
    working_directory: PathBuf,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    max_runtime: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Cancelled,
    Timeout(u32),
}

#[derive(Debug, Clone)]
enum Phase {
    Pending,
    Running,
    Finished {
        state: &'static str,
        exit_code: Option<i32>,
        error: Option<StatusError>,
    },
}

#[derive(Debug)]
struct Job {
    id: String,
    queue: &'static str,
    launch: Option<Launch>,
    phase: Phase,
    kill: Option<KillReason>,
}

impl Job {
    fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Finished { .. })
    }

    fn status(&self) -> JobStatus {
        let mut info = BTreeMap::new();
        info.insert("queue".to_string(), self.queue.to_string());
        let (state, running, done, exit_code, error) = match &self.phase {
            Phase::Pending => ("PENDING", false, false, None, None),
            Phase::Running => ("RUNNING", true, false, None, None),
            Phase::Finished {
                state,
                exit_code,
                error,
            } => (*state, false, true, *exit_code, error.clone()),
        };
        JobStatus {
            job_id: self.id.clone(),
            state: state.to_string(),
            running,
            done,
            exit_code,
            error,
            scheduler_specific_information: info,
        }
    }

    fn finish_killed(&mut self, reason: KillReason, exit_code: Option<i32>) {
        let error = match reason {
            KillReason::Cancelled => AdaptorError::JobCancelled(self.id.clone()),
            KillReason::Timeout(minutes) => AdaptorError::backend(
                ADAPTOR,
                format!("job exceeded its maximum run time of {minutes} minutes"),
            ),
        };
        self.phase = Phase::Finished {
            state: "KILLED",
            exit_code,
            error: Some(StatusError::from(&error)),
        };
    }
}

#[derive(Debug, Default)]
struct Jobs {
    next: u64,
    entries: BTreeMap<u64, Job>,
}

/// Job bookkeeping shared with the reaper threads.
#[derive(Debug)]
struct JobTable {
    jobs: Mutex<Jobs>,
    changed: Condvar,
    multi_limit: usize,
    poll_delay: Duration,
}

impl JobTable {
    fn lock(&self) -> MutexGuard<'_, Jobs> {
        lock(&self.jobs)
    }

    fn limit(&self, queue: &str) -> Option<usize> {
        match queue {
            "single" => Some(1),
            "multi" => Some(self.multi_limit),
            _ => None,
        }
    }

    fn insert(
        &self,
        jobs: &mut Jobs,
        queue: &'static str,
        launch: Option<Launch>,
        phase: Phase,
    ) -> u64 {
        let seq = jobs.next;
        jobs.next += 1;
        prune(&mut jobs.entries);
        jobs.entries.insert(
            seq,
            Job {
                id: format!("{ID_PREFIX}{seq}"),
                queue,
                launch,
                phase,
                kill: None,
            },
        );
        seq
    }

    /// Start pending jobs while their queue has room.
    fn dispatch(self: &Arc<Self>, jobs: &mut Jobs) {
        for queue in QUEUES {
            let limit = self.limit(queue);
            let mut running = jobs
                .entries
                .values()
                .filter(|j| j.queue == queue && matches!(j.phase, Phase::Running))
                .count();
            let pending: Vec<u64> = jobs
                .entries
                .iter()
                .filter(|(_, j)| j.queue == queue && matches!(j.phase, Phase::Pending))
                .map(|(seq, _)| *seq)
                .collect();
            for seq in pending {
                if limit.is_some_and(|l| running >= l) {
                    break;
                }
                if self.start(jobs, seq) {
                    running += 1;
                }
            }
        }
        self.changed.notify_all();
    }

    /// Spawn a pending batch job. Returns whether it is now running.
    fn start(self: &Arc<Self>, jobs: &mut Jobs, seq: u64) -> bool {
        let Some(job) = jobs.entries.get_mut(&seq) else {
            return false;
        };
        let Some(launch) = job.launch.take() else {
            return false;
        };
        match spawn_batch(&launch) {
            Ok(child) => {
                job.phase = Phase::Running;
                tracing::debug!(job = %job.id, program = %launch.program, "job started");
                self.spawn_reaper(seq, job, child, launch.max_runtime);
                matches!(job.phase, Phase::Running)
            }
            Err(err) => {
                tracing::debug!(job = %job.id, error = %err, "job failed to start");
                job.phase = Phase::Finished {
                    state: "ERROR",
                    exit_code: None,
                    error: Some(StatusError::from(&err)),
                };
                false
            }
        }
    }

    fn spawn_reaper(
        self: &Arc<Self>,
        seq: u64,
        job: &mut Job,
        child: Child,
        max_runtime: Option<Duration>,
    ) {
        let table = Arc::clone(self);
        let deadline = max_runtime.map(|d| Instant::now() + d);
        let timeout_minutes =
            max_runtime.map(|d| u32::try_from(d.as_secs() / 60).unwrap_or(u32::MAX));
        let spawned = thread::Builder::new()
            .name(format!("skiff-reaper-{}", job.id))
            .spawn(move || table.reap(seq, child, deadline, timeout_minutes));
        if let Err(err) = spawned {
            job.phase = Phase::Finished {
                state: "ERROR",
                exit_code: None,
                error: Some(StatusError::from(&AdaptorError::Io(err))),
            };
        }
    }

    /// Wait for a child to exit, killing it on request or when it runs too long.
    fn reap(
        self: Arc<Self>,
        seq: u64,
        mut child: Child,
        deadline: Option<Instant>,
        timeout_minutes: Option<u32>,
    ) {
        let outcome = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(err) => break Err(err),
            }

            let mut jobs = self.lock();
            if let (Some(deadline), Some(job)) = (deadline, jobs.entries.get_mut(&seq))
                && job.kill.is_none()
                && Instant::now() >= deadline
            {
                job.kill = Some(KillReason::Timeout(timeout_minutes.unwrap_or(0)));
            }
            let kill = jobs.entries.get(&seq).and_then(|j| j.kill);
            if kill.is_some() {
                drop(jobs);
                if let Err(err) = child.kill() {
                    tracing::debug!(error = %err, "failed to kill job");
                }
                break child.wait();
            }
            let _ = self
                .changed
                .wait_timeout(jobs, self.poll_delay)
                .unwrap_or_else(PoisonError::into_inner);
        };

        let mut jobs = self.lock();
        if let Some(job) = jobs.entries.get_mut(&seq) {
            match (outcome, job.kill) {
                (Ok(status), Some(reason)) => job.finish_killed(reason, exit_code(status)),
                (Ok(status), None) => {
                    job.phase = Phase::Finished {
                        state: "DONE",
                        exit_code: exit_code(status),
                        error: None,
                    };
                }
                (Err(err), _) => {
                    job.phase = Phase::Finished {
                        state: "ERROR",
                        exit_code: None,
                        error: Some(StatusError::from(&AdaptorError::Io(err))),
                    };
                }
            }
            tracing::debug!(job = %job.id, state = ?job.phase, "job finished");
        }
        self.dispatch(&mut jobs);
    }

    /// Request a job to stop. Pending jobs stop at once.
    fn cancel(&self, jobs: &mut Jobs, seq: u64) {
        if let Some(job) = jobs.entries.get_mut(&seq) {
            match job.phase {
                Phase::Pending => {
                    job.launch = None;
                    job.finish_killed(KillReason::Cancelled, None);
                }
                Phase::Running => {
                    job.kill.get_or_insert(KillReason::Cancelled);
                }
                Phase::Finished { .. } => {}
            }
        }
        self.changed.notify_all();
    }

    /// Block until `ready` holds for the job or `timeout` elapses.
    fn wait_for(
        &self,
        seq: u64,
        job_id: &str,
        timeout: Duration,
        ready: impl Fn(&Job) -> bool,
    ) -> AdaptorResult<JobStatus> {
        let waiting = |jobs: &mut Jobs| jobs.entries.get(&seq).is_some_and(|j| !ready(j));
        let jobs = self.lock();
        let jobs = if timeout.is_zero() {
            self.changed
                .wait_while(jobs, waiting)
                .unwrap_or_else(PoisonError::into_inner)
        } else {
            self.changed
                .wait_timeout_while(jobs, timeout, waiting)
                .unwrap_or_else(PoisonError::into_inner)
                .0
        };
        jobs.entries
            .get(&seq)
            .map(Job::status)
            .ok_or_else(|| AdaptorError::NoSuchJob(job_id.to_string()))
    }
}

fn spawn_batch(launch: &Launch) -> AdaptorResult<Child> {
    let open_input = |path: &PathBuf| {
        File::open(path).map_err(|e| AdaptorError::from_io(e, &path.display().to_string()))
    };
    let open_output = |path: &PathBuf| {
        File::create(path).map_err(|e| AdaptorError::from_io(e, &path.display().to_string()))
    };

    let mut command = command(launch);
    command.stdin(match &launch.stdin {
        Some(path) => Stdio::from(open_input(path)?),
        None => Stdio::null(),
    });
    command.stdout(match &launch.stdout {
        Some(path) => Stdio::from(open_output(path)?),
        None => Stdio::null(),
    });
    command.stderr(match &launch.stderr {
        Some(path) => Stdio::from(open_output(path)?),
        None => Stdio::null(),
    });
    command
        .spawn()
        .map_err(|e| AdaptorError::from_io(e, &launch.program))
}

fn command(launch: &Launch) -> Command {
    let mut command = Command::new(&launch.program);
    command
        .args(&launch.arguments)
        .envs(&launch.environment)
        .current_dir(&launch.working_directory);
    command
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    status.code().or_else(|| status.signal().map(|s| 128 + s))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

fn prune(entries: &mut BTreeMap<u64, Job>) {
    let finished: Vec<u64> = entries
        .iter()
        .filter(|(_, job)| job.is_done())
        .map(|(seq, _)| *seq)
        .collect();
    if finished.len() > RETAINED_FINISHED {
        for seq in &finished[..finished.len() - RETAINED_FINISHED] {
            entries.remove(seq);
        }
    }
}

fn parse_job_id(job_id: &str) -> AdaptorResult<u64> {
    job_id
        .strip_prefix(ID_PREFIX)
        .and_then(|seq| seq.parse().ok())
        .ok_or_else(|| AdaptorError::NoSuchJob(job_id.to_string()))
}

/// A session on the local process scheduler.
pub struct LocalScheduler {
    location: String,
    properties: BTreeMap<String, String>,
    open: AtomicBool,
    fs: Arc<LocalFileSystem>,
    table: Arc<JobTable>,
}

impl std::fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("location", &self.location)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl LocalScheduler {
    /// Adaptor name clients use to select this scheduler.
    pub const ADAPTOR_NAME: &'static str = ADAPTOR;

    /// What the adaptor supports.
    pub fn description() -> SchedulerAdaptorDescription {
        let parallelism = thread::available_parallelism().map_or(1, |n| n.get());
        SchedulerAdaptorDescription {
            name: Self::ADAPTOR_NAME.to_string(),
            description: "Runs jobs as processes on the machine the gateway runs on.".to_string(),
            supported_locations: vec!["(empty)".to_string(), "local://".to_string()],
            supported_properties: vec![
                property(
                    MULTI_LIMIT_PROPERTY,
                    PropertyType::Natural,
                    &parallelism.to_string(),
                    "Maximum number of jobs the multi queue runs at once.",
                ),
                property(
                    POLL_DELAY_PROPERTY,
                    PropertyType::Natural,
                    "50",
                    "Milliseconds between checks of a running job.",
                ),
            ],
            is_embedded: true,
            supports_batch: true,
            supports_interactive: true,
            uses_file_system: true,
        }
    }

    /// Open a scheduler session.
    pub fn open(
        location: &str,
        credential: &Credential,
        properties: &BTreeMap<String, String>,
    ) -> AdaptorResult<Self> {
        if !matches!(location, "" | "local://" | "local:") {
            return Err(AdaptorError::InvalidLocation(format!(
                "local scheduler cannot run jobs at {location:?}"
            )));
        }
        check_local_credential(location, credential)?;
        let properties = validate_properties(&Self::description().supported_properties, properties)?;
        let multi_limit = natural_property(&properties, MULTI_LIMIT_PROPERTY)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(1)
            .max(1);
        let poll_delay =
            Duration::from_millis(natural_property(&properties, POLL_DELAY_PROPERTY).unwrap_or(50));
        let fs = LocalFileSystem::open("", &Credential::default(), &BTreeMap::new())?;

        Ok(Self {
            location: location.to_string(),
            properties,
            open: AtomicBool::new(true),
            fs: Arc::new(fs),
            table: Arc::new(JobTable {
                jobs: Mutex::new(Jobs::default()),
                changed: Condvar::new(),
                multi_limit,
                poll_delay,
            }),
        })
    }

    fn ensure_open(&self) -> AdaptorResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AdaptorError::NotConnected("local scheduler is closed".to_string()))
        }
    }

    fn queue(&self, name: Option<&str>) -> AdaptorResult<&'static str> {
        let name = name.unwrap_or(DEFAULT_QUEUE);
        QUEUES
            .iter()
            .find(|q| **q == name)
            .copied()
            .ok_or_else(|| AdaptorError::NoSuchQueue(name.to_string()))
    }

    /// Check a description and resolve its paths against the file system.
    fn prepare(
        &self,
        description: &JobDescription,
        interactive: bool,
    ) -> AdaptorResult<(&'static str, Launch)> {
        if description.executable.is_empty() {
            return Err(AdaptorError::IncompleteJobDescription(
                "executable missing".to_string(),
            ));
        }
        let queue = self.queue(description.queue_name.as_deref())?;
        if description.node_count.is_some_and(|n| n > 1) {
            return Err(AdaptorError::InvalidJobDescription(
                "local scheduler only has a single node".to_string(),
            ));
        }
        if description.processes_per_node.is_some_and(|n| n > 1) && !description.start_single_process
        {
            return Err(AdaptorError::UnsupportedJobDescription(
                "local scheduler starts exactly one process per job".to_string(),
            ));
        }
        if !description.job_options.is_empty() {
            return Err(AdaptorError::UnsupportedJobDescription(
                "local scheduler does not support job options".to_string(),
            ));
        }
        let redirects =
            description.stdin.is_some() || description.stdout.is_some() || description.stderr.is_some();
        if interactive && redirects {
            return Err(AdaptorError::InvalidJobDescription(
                "interactive jobs cannot redirect their standard streams".to_string(),
            ));
        }

        let base = match &description.working_directory {
            Some(dir) => self.fs.absolute(&RemotePath::new(dir))?,
            None => self.fs.working_directory(),
        };
        let working_directory = self.fs.to_local(&base)?;
        if !working_directory.is_dir() {
            return Err(AdaptorError::InvalidJobDescription(format!(
                "working directory {base} does not exist"
            )));
        }
        let resolve = |path: &Option<String>| -> AdaptorResult<Option<PathBuf>> {
            path.as_deref()
                .map(|p| self.fs.to_local(&RemotePath::new(p).resolve_against(&base)))
                .transpose()
        };

        let launch = Launch {
            program: description.executable.clone(),
            arguments: description.arguments.clone(),
            environment: description.environment.clone(),
            working_directory,
            stdin: resolve(&description.stdin)?,
            stdout: resolve(&description.stdout)?,
            stderr: resolve(&description.stderr)?,
            max_runtime: description
                .max_runtime
                .filter(|m| *m > 0)
                .map(|m| Duration::from_secs(u64::from(m) * 60)),
        };
        Ok((queue, launch))
    }

    fn queue_status_of(&self, jobs: &Jobs, queue: &str) -> QueueStatus {
        let count = |running: bool| {
            jobs.entries
                .values()
                .filter(|j| j.queue == queue)
                .filter(|j| match j.phase {
                    Phase::Running => running,
                    Phase::Pending => !running,
                    Phase::Finished { .. } => false,
                })
                .count()
        };
        let mut info = BTreeMap::new();
        info.insert("running".to_string(), count(true).to_string());
        info.insert("pending".to_string(), count(false).to_string());
        info.insert(
            "max_concurrent_jobs".to_string(),
            self.table
                .limit(queue)
                .map_or_else(|| "unlimited".to_string(), |l| l.to_string()),
        );
        QueueStatus {
            queue_name: queue.to_string(),
            error: None,
            scheduler_specific_information: info,
        }
    }
}

impl Session for LocalScheduler {
    fn adaptor_name(&self) -> &str {
        Self::ADAPTOR_NAME
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Closing the scheduler kills every job it still runs.
    fn close(&self) -> AdaptorResult<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut jobs = self.table.lock();
        let unfinished: Vec<u64> = jobs
            .entries
            .iter()
            .filter(|(_, j)| !j.is_done())
            .map(|(seq, _)| *seq)
            .collect();
        for seq in unfinished {
            self.table.cancel(&mut jobs, seq);
        }
        drop(jobs);
        tracing::debug!("local scheduler closed");
        self.fs.close()
    }
}

impl Scheduler for LocalScheduler {
    fn queue_names(&self) -> AdaptorResult<Vec<String>> {
        self.ensure_open()?;
        Ok(QUEUES.iter().map(|q| q.to_string()).collect())
    }

    fn default_queue_name(&self) -> AdaptorResult<String> {
        self.ensure_open()?;
        Ok(DEFAULT_QUEUE.to_string())
    }

    fn queue_status(&self, queue: &str) -> AdaptorResult<QueueStatus> {
        self.ensure_open()?;
        let queue = self.queue(Some(queue))?;
        Ok(self.queue_status_of(&self.table.lock(), queue))
    }

    fn queue_statuses(&self, queues: &[String]) -> AdaptorResult<Vec<QueueStatus>> {
        self.ensure_open()?;
        let names: Vec<String> = if queues.is_empty() {
            QUEUES.iter().map(|q| q.to_string()).collect()
        } else {
            queues.to_vec()
        };
        let jobs = self.table.lock();
        Ok(names
            .iter()
            .map(|name| match self.queue(Some(name)) {
                Ok(queue) => self.queue_status_of(&jobs, queue),
                Err(err) => QueueStatus {
                    queue_name: name.clone(),
                    error: Some(StatusError::from(&err)),
                    scheduler_specific_information: BTreeMap::new(),
                },
            })
            .collect())
    }

    fn jobs(&self, queues: &[String]) -> AdaptorResult<Vec<String>> {
        self.ensure_open()?;
        let selected = queues
            .iter()
            .map(|q| self.queue(Some(q)))
            .collect::<AdaptorResult<Vec<_>>>()?;
        let jobs = self.table.lock();
        Ok(jobs
            .entries
            .values()
            .filter(|j| !j.is_done())
            .filter(|j| selected.is_empty() || selected.contains(&j.queue))
            .map(|j| j.id.clone())
            .collect())
    }

    fn submit_batch_job(&self, description: &JobDescription) -> AdaptorResult<String> {
        self.ensure_open()?;
        let (queue, launch) = self.prepare(description, false)?;
        let mut jobs = self.table.lock();
        let seq = self.table.insert(&mut jobs, queue, Some(launch), Phase::Pending);
        self.table.dispatch(&mut jobs);
        let id = format!("{ID_PREFIX}{seq}");
        tracing::debug!(job = %id, queue, "batch job submitted");
        Ok(id)
    }

    fn submit_interactive_job(
        &self,
        description: &JobDescription,
    ) -> AdaptorResult<InteractiveStreams> {
        self.ensure_open()?;
        let (queue, launch) = self.prepare(description, true)?;
        let mut child = command(&launch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AdaptorError::from_io(e, &launch.program))?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(AdaptorError::backend(ADAPTOR, "child process has no pipes"));
        };

        let mut jobs = self.table.lock();
        let seq = self.table.insert(&mut jobs, queue, None, Phase::Running);
        if let Some(job) = jobs.entries.get_mut(&seq) {
            self.table.spawn_reaper(seq, job, child, launch.max_runtime);
        }
        let job_id = format!("{ID_PREFIX}{seq}");
        tracing::debug!(job = %job_id, "interactive job started");
        Ok(InteractiveStreams {
            job_id,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }

    fn job_status(&self, job_id: &str) -> AdaptorResult<JobStatus> {
        self.ensure_open()?;
        let seq = parse_job_id(job_id)?;
        self.table
            .lock()
            .entries
            .get(&seq)
            .map(Job::status)
            .ok_or_else(|| AdaptorError::NoSuchJob(job_id.to_string()))
    }

    fn job_statuses(&self, job_ids: &[String]) -> Vec<JobStatus> {
        job_ids
            .iter()
            .map(|id| {
                self.job_status(id).unwrap_or_else(|err| JobStatus {
                    job_id: id.clone(),
                    state: "UNKNOWN".to_string(),
                    running: false,
                    done: false,
                    exit_code: None,
                    error: Some(StatusError::from(&err)),
                    scheduler_specific_information: BTreeMap::new(),
                })
            })
            .collect()
    }

    fn cancel_job(&self, job_id: &str) -> AdaptorResult<JobStatus> {
        self.ensure_open()?;
        let seq = parse_job_id(job_id)?;
        let mut jobs = self.table.lock();
        if !jobs.entries.contains_key(&seq) {
            return Err(AdaptorError::NoSuchJob(job_id.to_string()));
        }
        self.table.cancel(&mut jobs, seq);
        self.table.dispatch(&mut jobs);
        jobs.entries
            .get(&seq)
            .map(Job::status)
            .ok_or_else(|| AdaptorError::NoSuchJob(job_id.to_string()))
    }

    fn wait_until_done(&self, job_id: &str, timeout: Duration) -> AdaptorResult<JobStatus> {
        self.ensure_open()?;
        let seq = parse_job_id(job_id)?;
        self.table.wait_for(seq, job_id, timeout, Job::is_done)
    }

    fn wait_until_running(&self, job_id: &str, timeout: Duration) -> AdaptorResult<JobStatus> {
        self.ensure_open()?;
        let seq = parse_job_id(job_id)?;
        self.table.wait_for(seq, job_id, timeout, |job| {
            !matches!(job.phase, Phase::Pending)
        })
    }

    fn file_system(&self) -> AdaptorResult<Arc<dyn FileSystem>> {
        Ok(Arc::clone(&self.fs) as Arc<dyn FileSystem>)
    }
}
