//! File system adaptor interface.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AdaptorResult, StatusError};
use crate::path::RemotePath;
use crate::session::Session;
use crate::stream::{ByteSink, ByteSource};

/// POSIX permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PosixFilePermission {
    /// Read by owner
    OwnerRead,
    /// Write by owner
    OwnerWrite,
    /// Execute by owner
    OwnerExecute,
    /// Read by group
    GroupRead,
    /// Write by group
    GroupWrite,
    /// Execute by group
    GroupExecute,
    /// Read by others
    OthersRead,
    /// Write by others
    OthersWrite,
    /// Execute by others
    OthersExecute,
}

impl PosixFilePermission {
    /// All permissions with their mode bit.
    pub const ALL: [(PosixFilePermission, u32); 9] = [
        (Self::OwnerRead, 0o400),
        (Self::OwnerWrite, 0o200),
        (Self::OwnerExecute, 0o100),
        (Self::GroupRead, 0o040),
        (Self::GroupWrite, 0o020),
        (Self::GroupExecute, 0o010),
        (Self::OthersRead, 0o004),
        (Self::OthersWrite, 0o002),
        (Self::OthersExecute, 0o001),
    ];

    /// Decode permission bits from a unix mode.
    pub fn from_mode(mode: u32) -> BTreeSet<Self> {
        Self::ALL
            .iter()
            .filter(|(_, bit)| mode & bit != 0)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Encode permissions as unix mode bits.
    pub fn to_mode(permissions: &BTreeSet<Self>) -> u32 {
        Self::ALL
            .iter()
            .filter(|(p, _)| permissions.contains(p))
            .fold(0, |mode, (_, bit)| mode | bit)
    }
}

/// Metadata of a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAttributes {
    /// Path the attributes belong to
    pub path: RemotePath,
    /// Is a directory
    pub is_directory: bool,
    /// Is a regular file
    pub is_regular_file: bool,
    /// Is a symbolic link
    pub is_symbolic_link: bool,
    /// Is something else (device, socket, ...)
    pub is_other: bool,
    /// Executable by the session user
    pub is_executable: bool,
    /// Readable by the session user
    pub is_readable: bool,
    /// Writable by the session user
    pub is_writable: bool,
    /// Hidden (dot file)
    pub is_hidden: bool,
    /// Creation time, milliseconds since the epoch
    pub creation_time: i64,
    /// Last access time, milliseconds since the epoch
    pub last_access_time: i64,
    /// Last modification time, milliseconds since the epoch
    pub last_modified_time: i64,
    /// Size in bytes
    pub size: u64,
    /// Owner name, when the back end reports one
    pub owner: Option<String>,
    /// Group name, when the back end reports one
    pub group: Option<String>,
    /// Permissions, when the back end reports them
    pub permissions: Option<BTreeSet<PosixFilePermission>>,
}

/// What to do when a copy target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CopyMode {
    /// Fail if the target exists
    #[default]
    Create,
    /// Overwrite the target
    Replace,
    /// Leave the existing target untouched
    Ignore,
}

/// Progress of a copy operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStatus {
    /// Identifier assigned by the file system
    pub copy_id: String,
    /// Back-end specific state name
    pub state: String,
    /// Copy has finished (successfully or not)
    pub done: bool,
    /// Copy is transferring bytes
    pub running: bool,
    /// Total number of bytes to transfer, when known
    pub bytes_to_copy: u64,
    /// Bytes transferred so far
    pub bytes_copied: u64,
    /// Failure, if the copy did not succeed
    pub error: Option<StatusError>,
}

/// A session to a (possibly remote) file system.
///
/// All methods block; callers running on an async runtime must move them to
/// a thread that is allowed to block.
pub trait FileSystem: Session {
    /// Current working directory used to resolve relative paths.
    fn working_directory(&self) -> RemotePath;

    /// Change the working directory. The directory must exist.
    fn set_working_directory(&self, path: &RemotePath) -> AdaptorResult<()>;

    /// Whether `path` exists.
    fn exists(&self, path: &RemotePath) -> AdaptorResult<bool>;

    /// Create a single directory; the parent must exist.
    fn create_directory(&self, path: &RemotePath) -> AdaptorResult<()>;

    /// Create a directory and any missing parents.
    fn create_directories(&self, path: &RemotePath) -> AdaptorResult<()>;

    /// Create an empty file; fails if it already exists.
    fn create_file(&self, path: &RemotePath) -> AdaptorResult<()>;

    /// Create a symbolic link at `link` pointing to `target`.
    fn create_symbolic_link(&self, link: &RemotePath, target: &RemotePath) -> AdaptorResult<()>;

    /// Target of the symbolic link at `link`.
    fn read_symbolic_link(&self, link: &RemotePath) -> AdaptorResult<RemotePath>;

    /// Delete a file or directory. Non-empty directories need `recursive`.
    fn delete(&self, path: &RemotePath, recursive: bool) -> AdaptorResult<()>;

    /// Move `source` to `target`; fails if the target exists.
    fn rename(&self, source: &RemotePath, target: &RemotePath) -> AdaptorResult<()>;

    /// Metadata of `path`.
    fn get_attributes(&self, path: &RemotePath) -> AdaptorResult<PathAttributes>;

    /// Entries below `dir`, optionally descending into subdirectories.
    fn list(&self, dir: &RemotePath, recursive: bool) -> AdaptorResult<Vec<PathAttributes>>;

    /// Replace the permission bits of `path`.
    fn set_posix_file_permissions(
        &self,
        path: &RemotePath,
        permissions: &BTreeSet<PosixFilePermission>,
    ) -> AdaptorResult<()>;

    /// Open `path` for reading.
    fn read_from_file(&self, path: &RemotePath) -> AdaptorResult<Box<dyn ByteSource>>;

    /// Create (or truncate) `path` for writing.
    ///
    /// `size` is a hint some back ends need up front; local files ignore it.
    fn write_to_file(&self, path: &RemotePath, size: Option<u64>)
    -> AdaptorResult<Box<dyn ByteSink>>;

    /// Open an existing `path` for appending.
    fn append_to_file(&self, path: &RemotePath) -> AdaptorResult<Box<dyn ByteSink>>;

    /// Start copying `source` to `target` on `target_fs` in the background.
    ///
    /// Returns an identifier to poll with [`FileSystem::copy_status`].
    fn copy(
        &self,
        source: &RemotePath,
        target_fs: Arc<dyn FileSystem>,
        target: &RemotePath,
        mode: CopyMode,
        recursive: bool,
    ) -> AdaptorResult<String>;

    /// Current progress of a copy.
    fn copy_status(&self, copy_id: &str) -> AdaptorResult<CopyStatus>;

    /// Request cancellation of a copy and return its status.
    fn cancel_copy(&self, copy_id: &str) -> AdaptorResult<CopyStatus>;

    /// Block until the copy is done or `timeout` elapses.
    ///
    /// A zero timeout waits indefinitely.
    fn wait_until_copy_done(&self, copy_id: &str, timeout: Duration) -> AdaptorResult<CopyStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_roundtrip_for_common_modes() {
        for mode in [0o644, 0o755, 0o600, 0o000] {
            let permissions = PosixFilePermission::from_mode(mode);
            assert_eq!(PosixFilePermission::to_mode(&permissions), mode);
        }
        assert!(PosixFilePermission::from_mode(0o400).contains(&PosixFilePermission::OwnerRead));
    }
}
