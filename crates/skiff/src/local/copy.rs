//! Background copies started by the local file system.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{AdaptorError, AdaptorResult, StatusError};
use crate::filesystem::{CopyMode, CopyStatus, FileSystem};
use crate::path::RemotePath;

use super::{RETAINED_FINISHED, lock};

const ID_PREFIX: &str = "local-copy-";

/// Everything a copy has to do, resolved before the copy starts.
#[derive(Debug, Default)]
pub(crate) struct CopyPlan {
    /// Target directories to create, parents first
    pub directories: Vec<RemotePath>,
    /// Local source file, target path and size of every file
    pub files: Vec<(PathBuf, RemotePath, u64)>,
}

impl CopyPlan {
    fn total_bytes(&self) -> u64 {
        self.files.iter().map(|(_, _, size)| size).sum()
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Pending,
    Running,
    Done,
    Failed(StatusError),
    Cancelled,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Pending => "PENDING",
            Phase::Running => "RUNNING",
            Phase::Done => "DONE",
            Phase::Failed(_) => "FAILED",
            Phase::Cancelled => "CANCELLED",
        }
    }

    fn is_done(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed(_) | Phase::Cancelled)
    }
}

#[derive(Debug)]
struct CopyTask {
    id: String,
    bytes_to_copy: u64,
    bytes_copied: AtomicU64,
    cancel: AtomicBool,
    phase: Mutex<Phase>,
    changed: Condvar,
}

impl CopyTask {
    fn status(&self) -> CopyStatus {
        let phase = lock(&self.phase).clone();
        self.status_for(&phase)
    }

    fn status_for(&self, phase: &Phase) -> CopyStatus {
        let error = match phase {
            Phase::Failed(err) => Some(err.clone()),
            Phase::Cancelled => Some(StatusError::from(&AdaptorError::CopyCancelled(
                self.id.clone(),
            ))),
            _ => None,
        };
        CopyStatus {
            copy_id: self.id.clone(),
            state: phase.name().to_string(),
            done: phase.is_done(),
            running: matches!(phase, Phase::Running),
            bytes_to_copy: self.bytes_to_copy,
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            error,
        }
    }

    fn is_done(&self) -> bool {
        lock(&self.phase).is_done()
    }

    fn set_phase(&self, next: Phase) {
        *lock(&self.phase) = next;
        self.changed.notify_all();
    }

    fn run(&self, plan: CopyPlan, target_fs: Arc<dyn FileSystem>, mode: CopyMode, buffer: usize) {
        {
            let mut phase = lock(&self.phase);
            if phase.is_done() {
                return;
            }
            *phase = Phase::Running;
        }
        self.changed.notify_all();

        let next = match self.copy_all(&plan, target_fs.as_ref(), mode, buffer) {
            Ok(()) => Phase::Done,
            Err(AdaptorError::CopyCancelled(_)) => Phase::Cancelled,
            Err(err) => {
                tracing::debug!(copy = %self.id, error = %err, "copy failed");
                Phase::Failed(StatusError::from(&err))
            }
        };
        self.set_phase(next);
    }

    fn copy_all(
        &self,
        plan: &CopyPlan,
        target_fs: &dyn FileSystem,
        mode: CopyMode,
        buffer: usize,
    ) -> AdaptorResult<()> {
        for dir in &plan.directories {
            if !target_fs.exists(dir)? {
                target_fs.create_directories(dir)?;
            }
        }

        let mut buf = vec![0u8; buffer.max(1)];
        for (source, target, size) in &plan.files {
            self.check_cancelled()?;
            if target_fs.exists(target)? {
                match mode {
                    CopyMode::Create => {
                        return Err(AdaptorError::PathAlreadyExists(target.to_string()));
                    }
                    CopyMode::Ignore => {
                        self.bytes_copied.fetch_add(*size, Ordering::Relaxed);
                        continue;
                    }
                    CopyMode::Replace => {}
                }
            }

            let mut input = File::open(source)
                .map_err(|e| AdaptorError::from_io(e, &source.display().to_string()))?;
            let mut output = target_fs.write_to_file(target, Some(*size))?;
            loop {
                if self.cancel.load(Ordering::Relaxed) {
                    // The partial target is left behind, the same as an interrupted write.
                    let _ = output.close();
                    return Err(AdaptorError::CopyCancelled(self.id.clone()));
                }
                let n = input.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                output.write_all(&buf[..n])?;
                self.bytes_copied.fetch_add(n as u64, Ordering::Relaxed);
            }
            output.close()?;
        }
        Ok(())
    }

    fn check_cancelled(&self) -> AdaptorResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(AdaptorError::CopyCancelled(self.id.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct Copies {
    next: u64,
    entries: BTreeMap<u64, Arc<CopyTask>>,
}

/// Copies started by one file system session.
#[derive(Debug, Default)]
pub(crate) struct CopyEngine {
    copies: Mutex<Copies>,
}

impl CopyEngine {
    /// Start `plan` on a background thread and return the copy id.
    pub(crate) fn start(
        &self,
        plan: CopyPlan,
        target_fs: Arc<dyn FileSystem>,
        mode: CopyMode,
        buffer: usize,
    ) -> AdaptorResult<String> {
        let task = {
            let mut copies = lock(&self.copies);
            let seq = copies.next;
            copies.next += 1;
            prune(&mut copies.entries);
            let task = Arc::new(CopyTask {
                id: format!("{ID_PREFIX}{seq}"),
                bytes_to_copy: plan.total_bytes(),
                bytes_copied: AtomicU64::new(0),
                cancel: AtomicBool::new(false),
                phase: Mutex::new(Phase::Pending),
                changed: Condvar::new(),
            });
            copies.entries.insert(seq, Arc::clone(&task));
            task
        };

        let id = task.id.clone();
        let worker = Arc::clone(&task);
        let spawned = thread::Builder::new()
            .name(format!("skiff-{id}"))
            .spawn(move || worker.run(plan, target_fs, mode, buffer));
        if let Err(err) = spawned {
            let err = AdaptorError::Io(err);
            task.set_phase(Phase::Failed(StatusError::from(&err)));
            return Err(err);
        }
        tracing::debug!(copy = %id, "copy started");
        Ok(id)
    }

    pub(crate) fn status(&self, copy_id: &str) -> AdaptorResult<CopyStatus> {
        Ok(self.task(copy_id)?.status())
    }

    /// Ask the copy to stop. A copy that has not started yet stops at once.
    pub(crate) fn cancel(&self, copy_id: &str) -> AdaptorResult<CopyStatus> {
        let task = self.task(copy_id)?;
        task.cancel.store(true, Ordering::Relaxed);
        {
            let mut phase = lock(&task.phase);
            if matches!(*phase, Phase::Pending) {
                *phase = Phase::Cancelled;
            }
        }
        task.changed.notify_all();
        Ok(task.status())
    }

    pub(crate) fn wait(&self, copy_id: &str, timeout: Duration) -> AdaptorResult<CopyStatus> {
        let task = self.task(copy_id)?;
        let guard = lock(&task.phase);
        let guard = if timeout.is_zero() {
            task.changed
                .wait_while(guard, |phase| !phase.is_done())
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        } else {
            task.changed
                .wait_timeout_while(guard, timeout, |phase| !phase.is_done())
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0
        };
        Ok(task.status_for(&guard))
    }

    /// Cancel every copy that is still running.
    pub(crate) fn cancel_all(&self) {
        let tasks: Vec<_> = lock(&self.copies).entries.values().cloned().collect();
        for task in tasks {
            if !task.is_done() {
                let _ = self.cancel(&task.id);
            }
        }
    }

    fn task(&self, copy_id: &str) -> AdaptorResult<Arc<CopyTask>> {
        copy_id
            .strip_prefix(ID_PREFIX)
            .and_then(|seq| seq.parse::<u64>().ok())
            .and_then(|seq| lock(&self.copies).entries.get(&seq).cloned())
            .ok_or_else(|| AdaptorError::NoSuchCopy(copy_id.to_string()))
    }
}

/// Drop the oldest finished copies beyond the retention limit.
fn prune(entries: &mut BTreeMap<u64, Arc<CopyTask>>) {
    let finished: Vec<u64> = entries
        .iter()
        .filter(|(_, task)| task.is_done())
        .map(|(seq, _)| *seq)
        .collect();
    if finished.len() > RETAINED_FINISHED {
        for seq in &finished[..finished.len() - RETAINED_FINISHED] {
            entries.remove(seq);
        }
    }
}
