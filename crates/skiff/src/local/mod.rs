//! Adaptors backed by the machine the gateway runs on.

mod copy;
mod filesystem;
mod scheduler;

pub use filesystem::LocalFileSystem;
pub use scheduler::LocalScheduler;

use crate::credential::{Credential, location_host};
use crate::error::{AdaptorError, AdaptorResult};

/// Local adaptors only run as the current user.
fn check_local_credential(location: &str, credential: &Credential) -> AdaptorResult<()> {
    match credential.resolve(location_host(location)) {
        Credential::Default { .. } => Ok(()),
        other => Err(AdaptorError::InvalidCredential(format!(
            "local adaptors only accept the default credential, got {:?}",
            other
        ))),
    }
}

/// Finished entries kept around so their final status can still be queried.
const RETAINED_FINISHED: usize = 1000;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
