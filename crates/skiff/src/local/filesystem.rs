//! The `file` adaptor: the gateway host's own file system.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::adaptor::{
    FileSystemAdaptorDescription, PropertyType, property, size_property, validate_properties,
};
use crate::credential::Credential;
use crate::error::{AdaptorError, AdaptorResult};
use crate::filesystem::{CopyMode, CopyStatus, FileSystem, PathAttributes, PosixFilePermission};
use crate::path::RemotePath;
use crate::session::Session;
use crate::stream::{ByteSink, ByteSource};

use super::check_local_credential;
use super::copy::{CopyEngine, CopyPlan};

const BUFFER_SIZE_PROPERTY: &str = "skiff.adaptors.filesystems.file.bufferSize";

/// A session on the local file system.
///
/// The location names the directory that acts as the session root. An empty
/// location (or `/`) exposes the whole file system and starts in the
/// process working directory.
pub struct LocalFileSystem {
    location: String,
    root: PathBuf,
    properties: BTreeMap<String, String>,
    working_directory: RwLock<RemotePath>,
    buffer_size: usize,
    open: AtomicBool,
    copies: CopyEngine,
}

impl std::fmt::Debug for LocalFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileSystem")
            .field("location", &self.location)
            .field("root", &self.root)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl LocalFileSystem {
    /// Adaptor name clients use to select this file system.
    pub const ADAPTOR_NAME: &'static str = "file";

    /// What the adaptor supports.
    pub fn description() -> FileSystemAdaptorDescription {
        FileSystemAdaptorDescription {
            name: Self::ADAPTOR_NAME.to_string(),
            description: "Files on the machine the gateway runs on.".to_string(),
            supported_locations: vec!["(empty)".to_string(), "/some/directory".to_string()],
            supported_properties: vec![property(
                BUFFER_SIZE_PROPERTY,
                PropertyType::Size,
                "64K",
                "Buffer size used by background copies.",
            )],
            can_read_symboliclinks: cfg!(unix),
            can_create_symboliclinks: cfg!(unix),
            supports_third_party_copy: false,
            can_append: true,
            needs_size_beforehand: false,
        }
    }

    /// Locations of the local file system roots.
    pub fn roots() -> Vec<String> {
        vec!["/".to_string()]
    }

    /// Open a session rooted at `location`.
    pub fn open(
        location: &str,
        credential: &Credential,
        properties: &BTreeMap<String, String>,
    ) -> AdaptorResult<Self> {
        check_local_credential(location, credential)?;
        let properties = validate_properties(&Self::description().supported_properties, properties)?;
        let buffer_size = size_property(&properties, BUFFER_SIZE_PROPERTY).unwrap_or(64 * 1024);

        let (root, working_directory) = if location.is_empty() || location == "/" {
            let cwd = std::env::current_dir()?;
            (PathBuf::from("/"), RemotePath::new(&cwd.to_string_lossy()))
        } else {
            let root = PathBuf::from(location);
            if !root.is_dir() {
                return Err(AdaptorError::InvalidLocation(format!(
                    "{location} is not a directory"
                )));
            }
            (root, RemotePath::new("/"))
        };

        Ok(Self {
            location: location.to_string(),
            root,
            properties,
            working_directory: RwLock::new(working_directory),
            buffer_size: usize::try_from(buffer_size).unwrap_or(64 * 1024),
            open: AtomicBool::new(true),
            copies: CopyEngine::default(),
        })
    }

    fn ensure_open(&self) -> AdaptorResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AdaptorError::NotConnected(format!(
                "file system at {:?} is closed",
                self.location
            )))
        }
    }

    /// Resolve a remote path to an absolute, normalized remote path.
    pub(super) fn absolute(&self, path: &RemotePath) -> AdaptorResult<RemotePath> {
        path.resolve_against(&self.working_directory())
            .normalize()
            .ok_or_else(|| AdaptorError::InvalidPath(path.to_string()))
    }

    /// Map a remote path to a path on this machine.
    pub(super) fn to_local(&self, path: &RemotePath) -> AdaptorResult<PathBuf> {
        let absolute = self.absolute(path)?;
        let mut local = self.root.clone();
        for element in absolute.elements() {
            local.push(element);
        }
        Ok(local)
    }

    /// Map a path on this machine back to a remote path.
    fn to_remote(&self, local: &Path) -> RemotePath {
        let relative = local.strip_prefix(&self.root).unwrap_or(local);
        let mut remote = RemotePath::new("/");
        for component in relative.components() {
            remote = remote.join(&component.as_os_str().to_string_lossy());
        }
        remote
    }

    fn attributes(&self, local: &Path) -> AdaptorResult<PathAttributes> {
        let display = local.display().to_string();
        let meta = fs::symlink_metadata(local).map_err(|e| AdaptorError::from_io(e, &display))?;
        let file_type = meta.file_type();
        let path = self.to_remote(local);
        let is_hidden = path.file_name().is_some_and(|n| n.starts_with('.'));

        let modified = millis(meta.modified().ok());
        let accessed = millis(meta.accessed().ok());
        let created = meta.created().ok().map_or(modified, |t| millis(Some(t)));

        let (permissions, owner, group) = unix_details(&meta);
        let mode = permissions
            .as_ref()
            .map(PosixFilePermission::to_mode)
            .unwrap_or(0o644);

        Ok(PathAttributes {
            path,
            is_directory: file_type.is_dir(),
            is_regular_file: file_type.is_file(),
            is_symbolic_link: file_type.is_symlink(),
            is_other: !(file_type.is_dir() || file_type.is_file() || file_type.is_symlink()),
            is_executable: mode & 0o100 != 0,
            is_readable: mode & 0o400 != 0,
            is_writable: mode & 0o200 != 0 && !meta.permissions().readonly(),
            is_hidden,
            creation_time: created,
            last_access_time: accessed,
            last_modified_time: modified,
            size: meta.len(),
            owner,
            group,
            permissions,
        })
    }

    fn list_into(
        &self,
        dir: &Path,
        recursive: bool,
        out: &mut Vec<PathAttributes>,
    ) -> AdaptorResult<()> {
        let display = dir.display().to_string();
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| AdaptorError::from_io(e, &display))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        entries.sort();
        for entry in entries {
            let attributes = self.attributes(&entry)?;
            let descend = recursive && attributes.is_directory;
            out.push(attributes);
            if descend {
                self.list_into(&entry, true, out)?;
            }
        }
        Ok(())
    }

    /// Work out which directories and files a copy has to create.
    fn plan_copy(
        &self,
        source: &Path,
        target: &RemotePath,
        recursive: bool,
    ) -> AdaptorResult<CopyPlan> {
        let display = source.display().to_string();
        let meta = fs::metadata(source).map_err(|e| AdaptorError::from_io(e, &display))?;
        let mut plan = CopyPlan::default();
        if meta.is_file() {
            plan.files.push((source.to_path_buf(), target.clone(), meta.len()));
            return Ok(plan);
        }
        if !meta.is_dir() {
            return Err(AdaptorError::InvalidPath(format!(
                "{display} is neither a file nor a directory"
            )));
        }
        if !recursive {
            return Err(AdaptorError::InvalidPath(format!(
                "{display} is a directory and recursive copy was not requested"
            )));
        }
        plan.directories.push(target.clone());
        self.plan_directory(source, target, &mut plan)?;
        Ok(plan)
    }

    fn plan_directory(&self, dir: &Path, target: &RemotePath, plan: &mut CopyPlan) -> AdaptorResult<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        entries.sort();
        for entry in entries {
            let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let meta = fs::metadata(&entry)?;
            let entry_target = target.join(&name);
            if meta.is_dir() {
                plan.directories.push(entry_target.clone());
                self.plan_directory(&entry, &entry_target, plan)?;
            } else if meta.is_file() {
                plan.files.push((entry, entry_target, meta.len()));
            }
        }
        Ok(())
    }
}

impl Session for LocalFileSystem {
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

    fn close(&self) -> AdaptorResult<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.copies.cancel_all();
            tracing::debug!(location = %self.location, "file system closed");
        }
        Ok(())
    }
}

impl FileSystem for LocalFileSystem {
    fn working_directory(&self) -> RemotePath {
        self.working_directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_working_directory(&self, path: &RemotePath) -> AdaptorResult<()> {
        self.ensure_open()?;
        let absolute = self.absolute(path)?;
        let local = self.to_local(&absolute)?;
        if !local.is_dir() {
            return Err(AdaptorError::NoSuchPath(absolute.to_string()));
        }
        *self
            .working_directory
            .write()
            .unwrap_or_else(PoisonError::into_inner) = absolute;
        Ok(())
    }

    fn exists(&self, path: &RemotePath) -> AdaptorResult<bool> {
        self.ensure_open()?;
        let local = self.to_local(path)?;
        match fs::symlink_metadata(&local) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AdaptorError::from_io(e, &path.to_string())),
        }
    }

    fn create_directory(&self, path: &RemotePath) -> AdaptorResult<()> {
        self.ensure_open()?;
        let local = self.to_local(path)?;
        fs::create_dir(&local).map_err(|e| AdaptorError::from_io(e, &path.to_string()))
    }

    fn create_directories(&self, path: &RemotePath) -> AdaptorResult<()> {
        self.ensure_open()?;
        let local = self.to_local(path)?;
        if fs::symlink_metadata(&local).is_ok() {
            return Err(AdaptorError::PathAlreadyExists(path.to_string()));
        }
        fs::create_dir_all(&local).map_err(|e| AdaptorError::from_io(e, &path.to_string()))
    }

    fn create_file(&self, path: &RemotePath) -> AdaptorResult<()> {
        self.ensure_open()?;
        let local = self.to_local(path)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&local)
            .map(drop)
            .map_err(|e| AdaptorError::from_io(e, &path.to_string()))
    }

    #[cfg(unix)]
    fn create_symbolic_link(&self, link: &RemotePath, target: &RemotePath) -> AdaptorResult<()> {
        self.ensure_open()?;
        let local_link = self.to_local(link)?;
        let local_target = if target.is_absolute() {
            self.to_local(target)?
        } else {
            PathBuf::from(target.to_string())
        };
        std::os::unix::fs::symlink(&local_target, &local_link)
            .map_err(|e| AdaptorError::from_io(e, &link.to_string()))
    }

    #[cfg(not(unix))]
    fn create_symbolic_link(&self, _link: &RemotePath, _target: &RemotePath) -> AdaptorResult<()> {
        Err(AdaptorError::unsupported(Self::ADAPTOR_NAME, "createSymbolicLink"))
    }

    fn read_symbolic_link(&self, link: &RemotePath) -> AdaptorResult<RemotePath> {
        self.ensure_open()?;
        let local = self.to_local(link)?;
        let target = fs::read_link(&local).map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidInput => {
                AdaptorError::InvalidPath(format!("{link} is not a symbolic link"))
            }
            _ => AdaptorError::from_io(e, &link.to_string()),
        })?;
        if target.is_absolute() {
            Ok(self.to_remote(&target))
        } else {
            Ok(RemotePath::new(&target.to_string_lossy()))
        }
    }

    fn delete(&self, path: &RemotePath, recursive: bool) -> AdaptorResult<()> {
        self.ensure_open()?;
        let local = self.to_local(path)?;
        let display = path.to_string();
        let meta = fs::symlink_metadata(&local).map_err(|e| AdaptorError::from_io(e, &display))?;
        let result = if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(&local)
            } else {
                let mut entries =
                    fs::read_dir(&local).map_err(|e| AdaptorError::from_io(e, &display))?;
                if entries.next().is_some() {
                    return Err(AdaptorError::DirectoryNotEmpty(display));
                }
                fs::remove_dir(&local)
            }
        } else {
            fs::remove_file(&local)
        };
        result.map_err(|e| AdaptorError::from_io(e, &display))
    }

    fn rename(&self, source: &RemotePath, target: &RemotePath) -> AdaptorResult<()> {
        self.ensure_open()?;
        let from = self.to_local(source)?;
        let to = self.to_local(target)?;
        if fs::symlink_metadata(&from).is_err() {
            return Err(AdaptorError::NoSuchPath(source.to_string()));
        }
        if from == to {
            return Ok(());
        }
        if fs::symlink_metadata(&to).is_ok() {
            return Err(AdaptorError::PathAlreadyExists(target.to_string()));
        }
        fs::rename(&from, &to).map_err(|e| AdaptorError::from_io(e, &target.to_string()))
    }

    fn get_attributes(&self, path: &RemotePath) -> AdaptorResult<PathAttributes> {
        self.ensure_open()?;
        let local = self.to_local(path)?;
        self.attributes(&local).map_err(|e| match e {
            AdaptorError::NoSuchPath(_) => AdaptorError::NoSuchPath(path.to_string()),
            other => other,
        })
    }

    fn list(&self, dir: &RemotePath, recursive: bool) -> AdaptorResult<Vec<PathAttributes>> {
        self.ensure_open()?;
        let local = self.to_local(dir)?;
        let meta = fs::metadata(&local).map_err(|e| AdaptorError::from_io(e, &dir.to_string()))?;
        if !meta.is_dir() {
            return Err(AdaptorError::InvalidPath(format!("{dir} is not a directory")));
        }
        let mut out = Vec::new();
        self.list_into(&local, recursive, &mut out)?;
        Ok(out)
    }

    #[cfg(unix)]
    fn set_posix_file_permissions(
        &self,
        path: &RemotePath,
        permissions: &BTreeSet<PosixFilePermission>,
    ) -> AdaptorResult<()> {
        use std::os::unix::fs::PermissionsExt;

        self.ensure_open()?;
        let local = self.to_local(path)?;
        let mode = PosixFilePermission::to_mode(permissions);
        fs::set_permissions(&local, fs::Permissions::from_mode(mode))
            .map_err(|e| AdaptorError::from_io(e, &path.to_string()))
    }

    #[cfg(not(unix))]
    fn set_posix_file_permissions(
        &self,
        _path: &RemotePath,
        _permissions: &BTreeSet<PosixFilePermission>,
    ) -> AdaptorResult<()> {
        Err(AdaptorError::unsupported(Self::ADAPTOR_NAME, "setPosixFilePermissions"))
    }

    fn read_from_file(&self, path: &RemotePath) -> AdaptorResult<Box<dyn ByteSource>> {
        self.ensure_open()?;
        let local = self.to_local(path)?;
        if local.is_dir() {
            return Err(AdaptorError::InvalidPath(format!("{path} is a directory")));
        }
        let file = File::open(&local).map_err(|e| AdaptorError::from_io(e, &path.to_string()))?;
        Ok(Box::new(file))
    }

    fn write_to_file(
        &self,
        path: &RemotePath,
        _size: Option<u64>,
    ) -> AdaptorResult<Box<dyn ByteSink>> {
        self.ensure_open()?;
        let local = self.to_local(path)?;
        if local.is_dir() {
            return Err(AdaptorError::InvalidPath(format!("{path} is a directory")));
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&local)
            .map_err(|e| AdaptorError::from_io(e, &path.to_string()))?;
        Ok(Box::new(file))
    }

    fn append_to_file(&self, path: &RemotePath) -> AdaptorResult<Box<dyn ByteSink>> {
        self.ensure_open()?;
        let local = self.to_local(path)?;
        let file = OpenOptions::new()
            .append(true)
            .open(&local)
            .map_err(|e| AdaptorError::from_io(e, &path.to_string()))?;
        Ok(Box::new(file))
    }

    fn copy(
        &self,
        source: &RemotePath,
        target_fs: Arc<dyn FileSystem>,
        target: &RemotePath,
        mode: CopyMode,
        recursive: bool,
    ) -> AdaptorResult<String> {
        self.ensure_open()?;
        let local_source = self.to_local(source)?;
        if !local_source.exists() {
            return Err(AdaptorError::NoSuchPath(source.to_string()));
        }
        if mode == CopyMode::Create && target_fs.exists(target)? {
            return Err(AdaptorError::PathAlreadyExists(target.to_string()));
        }
        let plan = self.plan_copy(&local_source, target, recursive)?;
        self.copies.start(plan, target_fs, mode, self.buffer_size)
    }

    fn copy_status(&self, copy_id: &str) -> AdaptorResult<CopyStatus> {
        self.copies.status(copy_id)
    }

    fn cancel_copy(&self, copy_id: &str) -> AdaptorResult<CopyStatus> {
        self.copies.cancel(copy_id)
    }

    fn wait_until_copy_done(&self, copy_id: &str, timeout: Duration) -> AdaptorResult<CopyStatus> {
        self.copies.wait(copy_id, timeout)
    }
}

fn millis(time: Option<SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

type UnixDetails = (Option<BTreeSet<PosixFilePermission>>, Option<String>, Option<String>);

#[cfg(unix)]
fn unix_details(meta: &fs::Metadata) -> UnixDetails {
    use std::os::unix::fs::MetadataExt;

    (
        Some(PosixFilePermission::from_mode(meta.mode())),
        Some(meta.uid().to_string()),
        Some(meta.gid().to_string()),
    )
}

#[cfg(not(unix))]
fn unix_details(_meta: &fs::Metadata) -> UnixDetails {
    (None, None, None)
}
