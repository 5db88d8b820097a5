//! Skiff: one interface over remote file systems and job schedulers.
//!
//! Adaptors open [`FileSystem`] and [`Scheduler`] sessions on a back end.
//! Every session call blocks, so async callers should run them on a
//! blocking thread. This crate ships the `file` and `local` adaptors, which
//! act on the machine the process runs on.

pub mod adaptor;
pub mod credential;
pub mod error;
pub mod filesystem;
pub mod path;
pub mod scheduler;
pub mod session;
pub mod stream;

mod local;

pub use credential::Credential;
pub use error::{AdaptorError, AdaptorResult, StatusError, StatusErrorType};
pub use filesystem::{CopyMode, CopyStatus, FileSystem, PathAttributes, PosixFilePermission};
pub use local::{LocalFileSystem, LocalScheduler};
pub use path::RemotePath;
pub use scheduler::{JobDescription, JobStatus, QueueStatus, Scheduler};
pub use session::Session;
pub use stream::{ByteSink, ByteSource, InteractiveStreams};
