//! Conversions between wire messages and library types.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use skiff::adaptor::{
    FileSystemAdaptorDescription, PropertyDescription, PropertyType, SchedulerAdaptorDescription,
};
use skiff::{
    CopyMode, CopyStatus, Credential, JobDescription, JobStatus, PathAttributes,
    PosixFilePermission, QueueStatus, RemotePath, StatusError, StatusErrorType,
};

use crate::error::{GatewayError, GatewayResult};
use crate::proto::{
    self, create_file_system_request, create_scheduler_request, property_description,
    user_credential,
};
use crate::registry::SessionRequest;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Parse a wire path. An empty separator means `/`.
pub fn remote_path(path: &proto::Path) -> GatewayResult<RemotePath> {
    let mut chars = path.separator.chars();
    match (chars.next(), chars.next()) {
        (None, _) => Ok(RemotePath::new(&path.path)),
        (Some(separator), None) => Ok(RemotePath::with_separator(&path.path, separator)),
        (Some(_), Some(_)) => Err(GatewayError::invalid_argument(format!(
            "separator must be a single character, got {:?}",
            path.separator
        ))),
    }
}

/// Parse a required path field.
pub fn required_path(path: Option<&proto::Path>, field: &str) -> GatewayResult<RemotePath> {
    let path = path.ok_or_else(|| GatewayError::invalid_argument(format!("{field} is required")))?;
    remote_path(path)
}

/// Wire form of a path.
pub fn path_message(path: &RemotePath) -> proto::Path {
    proto::Path {
        path: path.to_string(),
        separator: path.separator().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

fn username_required(username: &str) -> GatewayResult<String> {
    if username.is_empty() {
        Err(GatewayError::invalid_argument("credential username is required"))
    } else {
        Ok(username.to_string())
    }
}

fn default_credential(credential: proto::DefaultCredential) -> Credential {
    Credential::Default {
        username: (!credential.username.is_empty()).then_some(credential.username),
    }
}

fn password_credential(credential: proto::PasswordCredential) -> GatewayResult<Credential> {
    Ok(Credential::Password {
        username: username_required(&credential.username)?,
        password: credential.password,
    })
}

fn certificate_credential(credential: proto::CertificateCredential) -> GatewayResult<Credential> {
    if credential.certfile.is_empty() {
        return Err(GatewayError::invalid_argument("certificate file is required"));
    }
    Ok(Credential::Certificate {
        username: username_required(&credential.username)?,
        certfile: credential.certfile,
        passphrase: credential.passphrase,
    })
}

fn user_credential(credential: proto::UserCredential) -> GatewayResult<Credential> {
    match credential.entry {
        Some(user_credential::Entry::DefaultCredential(c)) => Ok(default_credential(c)),
        Some(user_credential::Entry::PasswordCredential(c)) => password_credential(c),
        Some(user_credential::Entry::CertificateCredential(c)) => certificate_credential(c),
        None => Err(GatewayError::invalid_argument("credential map entry is empty")),
    }
}

fn credential_map(map: proto::CredentialMap) -> GatewayResult<Credential> {
    let entries = map
        .entries
        .into_iter()
        .map(|(host, credential)| Ok((host, user_credential(credential)?)))
        .collect::<GatewayResult<BTreeMap<_, _>>>()?;
    let fallback = match map.fallback {
        Some(fallback) => user_credential(fallback)?,
        None => Credential::default(),
    };
    Ok(Credential::Map {
        entries,
        fallback: Box::new(fallback),
    })
}

fn redacted_user_credential(credential: &Credential) -> user_credential::Entry {
    match credential {
        Credential::Password { username, .. } => {
            user_credential::Entry::PasswordCredential(proto::PasswordCredential {
                username: username.clone(),
                password: String::new(),
            })
        }
        Credential::Certificate {
            username, certfile, ..
        } => user_credential::Entry::CertificateCredential(proto::CertificateCredential {
            username: username.clone(),
            certfile: certfile.clone(),
            passphrase: String::new(),
        }),
        Credential::Default { username } => {
            user_credential::Entry::DefaultCredential(proto::DefaultCredential {
                username: username.clone().unwrap_or_default(),
            })
        }
        // Nested maps cannot be expressed on the wire; report who they resolve to.
        Credential::Map { .. } => user_credential::Entry::DefaultCredential(proto::DefaultCredential {
            username: credential.username(),
        }),
    }
}

fn redacted_credential_map(
    entries: &BTreeMap<String, Credential>,
    fallback: &Credential,
) -> proto::CredentialMap {
    proto::CredentialMap {
        entries: entries
            .iter()
            .map(|(host, credential)| {
                let entry = proto::UserCredential {
                    entry: Some(redacted_user_credential(credential)),
                };
                (host.clone(), entry)
            })
            .collect(),
        fallback: Some(proto::UserCredential {
            entry: Some(redacted_user_credential(fallback)),
        }),
    }
}

fn file_system_credential(
    credential: Option<create_file_system_request::Credential>,
) -> GatewayResult<Credential> {
    use create_file_system_request::Credential as C;
    match credential {
        None => Ok(Credential::default()),
        Some(C::DefaultCredential(c)) => Ok(default_credential(c)),
        Some(C::PasswordCredential(c)) => password_credential(c),
        Some(C::CertificateCredential(c)) => certificate_credential(c),
        Some(C::CredentialMap(c)) => credential_map(c),
    }
}

fn scheduler_credential(
    credential: Option<create_scheduler_request::Credential>,
) -> GatewayResult<Credential> {
    use create_scheduler_request::Credential as C;
    match credential {
        None => Ok(Credential::default()),
        Some(C::DefaultCredential(c)) => Ok(default_credential(c)),
        Some(C::PasswordCredential(c)) => password_credential(c),
        Some(C::CertificateCredential(c)) => certificate_credential(c),
        Some(C::CredentialMap(c)) => credential_map(c),
    }
}

fn redacted_file_system_credential(credential: &Credential) -> create_file_system_request::Credential {
    use create_file_system_request::Credential as C;
    match credential {
        Credential::Map { entries, fallback } => {
            C::CredentialMap(redacted_credential_map(entries, fallback))
        }
        other => match redacted_user_credential(other) {
            user_credential::Entry::DefaultCredential(c) => C::DefaultCredential(c),
            user_credential::Entry::PasswordCredential(c) => C::PasswordCredential(c),
            user_credential::Entry::CertificateCredential(c) => C::CertificateCredential(c),
        },
    }
}

fn redacted_scheduler_credential(credential: &Credential) -> create_scheduler_request::Credential {
    use create_scheduler_request::Credential as C;
    match credential {
        Credential::Map { entries, fallback } => {
            C::CredentialMap(redacted_credential_map(entries, fallback))
        }
        other => match redacted_user_credential(other) {
            user_credential::Entry::DefaultCredential(c) => C::DefaultCredential(c),
            user_credential::Entry::PasswordCredential(c) => C::PasswordCredential(c),
            user_credential::Entry::CertificateCredential(c) => C::CertificateCredential(c),
        },
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

fn sorted(properties: HashMap<String, String>) -> BTreeMap<String, String> {
    properties.into_iter().collect()
}

/// Library-side form of a file system creation request.
pub fn file_system_request(request: proto::CreateFileSystemRequest) -> GatewayResult<SessionRequest> {
    if request.adaptor.is_empty() {
        return Err(GatewayError::invalid_argument("adaptor is required"));
    }
    Ok(SessionRequest {
        credential: file_system_credential(request.credential)?,
        adaptor: request.adaptor,
        location: request.location,
        properties: sorted(request.properties),
    })
}

/// Library-side form of a scheduler creation request.
pub fn scheduler_request(request: proto::CreateSchedulerRequest) -> GatewayResult<SessionRequest> {
    if request.adaptor.is_empty() {
        return Err(GatewayError::invalid_argument("adaptor is required"));
    }
    Ok(SessionRequest {
        credential: scheduler_credential(request.credential)?,
        adaptor: request.adaptor,
        location: request.location,
        properties: sorted(request.properties),
    })
}

/// Wire form of a file system handle. Secrets are removed from the request.
pub fn file_system_message(id: &str, request: &SessionRequest) -> proto::FileSystem {
    proto::FileSystem {
        id: id.to_string(),
        request: Some(proto::CreateFileSystemRequest {
            adaptor: request.adaptor.clone(),
            location: request.location.clone(),
            properties: request.properties.clone().into_iter().collect(),
            credential: Some(redacted_file_system_credential(&request.credential)),
        }),
    }
}

/// Wire form of a scheduler handle. Secrets are removed from the request.
pub fn scheduler_message(id: &str, request: &SessionRequest) -> proto::Scheduler {
    proto::Scheduler {
        id: id.to_string(),
        request: Some(proto::CreateSchedulerRequest {
            adaptor: request.adaptor.clone(),
            location: request.location.clone(),
            properties: request.properties.clone().into_iter().collect(),
            credential: Some(redacted_scheduler_credential(&request.credential)),
        }),
    }
}

/// Wire form of session properties.
pub fn properties_message(properties: &BTreeMap<String, String>) -> proto::Properties {
    proto::Properties {
        properties: properties.clone().into_iter().collect(),
    }
}

// ---------------------------------------------------------------------------
// File system values
// ---------------------------------------------------------------------------

/// Wire form of permission bits.
pub fn permissions_message(permissions: &BTreeSet<PosixFilePermission>) -> Vec<i32> {
    permissions
        .iter()
        .map(|p| {
            let wire = match p {
                PosixFilePermission::OwnerRead => proto::PosixFilePermission::OwnerRead,
                PosixFilePermission::OwnerWrite => proto::PosixFilePermission::OwnerWrite,
                PosixFilePermission::OwnerExecute => proto::PosixFilePermission::OwnerExecute,
                PosixFilePermission::GroupRead => proto::PosixFilePermission::GroupRead,
                PosixFilePermission::GroupWrite => proto::PosixFilePermission::GroupWrite,
                PosixFilePermission::GroupExecute => proto::PosixFilePermission::GroupExecute,
                PosixFilePermission::OthersRead => proto::PosixFilePermission::OthersRead,
                PosixFilePermission::OthersWrite => proto::PosixFilePermission::OthersWrite,
                PosixFilePermission::OthersExecute => proto::PosixFilePermission::OthersExecute,
            };
            wire as i32
        })
        .collect()
}

/// Parse wire permission values.
pub fn permissions(values: &[i32]) -> GatewayResult<BTreeSet<PosixFilePermission>> {
    values
        .iter()
        .map(|&value| {
            let permission = match proto::PosixFilePermission::try_from(value) {
                Ok(proto::PosixFilePermission::OwnerRead) => PosixFilePermission::OwnerRead,
                Ok(proto::PosixFilePermission::OwnerWrite) => PosixFilePermission::OwnerWrite,
                Ok(proto::PosixFilePermission::OwnerExecute) => PosixFilePermission::OwnerExecute,
                Ok(proto::PosixFilePermission::GroupRead) => PosixFilePermission::GroupRead,
                Ok(proto::PosixFilePermission::GroupWrite) => PosixFilePermission::GroupWrite,
                Ok(proto::PosixFilePermission::GroupExecute) => PosixFilePermission::GroupExecute,
                Ok(proto::PosixFilePermission::OthersRead) => PosixFilePermission::OthersRead,
                Ok(proto::PosixFilePermission::OthersWrite) => PosixFilePermission::OthersWrite,
                Ok(proto::PosixFilePermission::OthersExecute) => PosixFilePermission::OthersExecute,
                Ok(proto::PosixFilePermission::None) | Err(_) => {
                    return Err(GatewayError::invalid_argument(format!(
                        "invalid permission value {value}"
                    )));
                }
            };
            Ok(permission)
        })
        .collect()
}

/// Wire form of path metadata.
pub fn attributes_message(attributes: &PathAttributes) -> proto::PathAttributes {
    proto::PathAttributes {
        path: Some(path_message(&attributes.path)),
        is_directory: attributes.is_directory,
        is_regular_file: attributes.is_regular_file,
        is_symbolic_link: attributes.is_symbolic_link,
        is_other: attributes.is_other,
        is_executable: attributes.is_executable,
        is_readable: attributes.is_readable,
        is_writable: attributes.is_writable,
        is_hidden: attributes.is_hidden,
        creation_time: attributes.creation_time,
        last_access_time: attributes.last_access_time,
        last_modified_time: attributes.last_modified_time,
        size: attributes.size,
        owner: attributes.owner.clone().unwrap_or_default(),
        group: attributes.group.clone().unwrap_or_default(),
        permissions: attributes
            .permissions
            .as_ref()
            .map(permissions_message)
            .unwrap_or_default(),
    }
}

/// Parse a wire copy mode.
pub fn copy_mode(value: i32) -> GatewayResult<CopyMode> {
    match proto::CopyMode::try_from(value) {
        Ok(proto::CopyMode::Create) => Ok(CopyMode::Create),
        Ok(proto::CopyMode::Replace) => Ok(CopyMode::Replace),
        Ok(proto::CopyMode::Ignore) => Ok(CopyMode::Ignore),
        Err(_) => Err(GatewayError::invalid_argument(format!(
            "invalid copy mode {value}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

fn error_fields(error: Option<&StatusError>) -> (i32, String) {
    let Some(error) = error else {
        return (proto::ErrorType::None as i32, String::new());
    };
    let error_type = match error.error_type {
        StatusErrorType::NotFound => proto::ErrorType::NotFound,
        StatusErrorType::Cancelled => proto::ErrorType::Cancelled,
        StatusErrorType::AlreadyExists => proto::ErrorType::AlreadyExists,
        StatusErrorType::NotConnected => proto::ErrorType::NotConnected,
        StatusErrorType::Backend => proto::ErrorType::Backend,
        StatusErrorType::Io => proto::ErrorType::Io,
        StatusErrorType::Other => proto::ErrorType::Other,
    };
    (error_type as i32, error.message.clone())
}

/// Wire form of a copy status, addressed by the gateway operation id.
pub fn copy_status_message(operation_id: &str, status: &CopyStatus) -> proto::CopyStatus {
    let (error_type, error_message) = error_fields(status.error.as_ref());
    proto::CopyStatus {
        copy_operation: Some(proto::CopyOperation {
            id: operation_id.to_string(),
        }),
        state: status.state.clone(),
        done: status.done,
        running: status.running,
        bytes_to_copy: status.bytes_to_copy,
        bytes_copied: status.bytes_copied,
        error_type,
        error_message,
    }
}

/// Wire form of a job status.
pub fn job_status_message(status: &JobStatus) -> proto::JobStatus {
    let (error_type, error_message) = error_fields(status.error.as_ref());
    proto::JobStatus {
        job: Some(proto::Job {
            id: status.job_id.clone(),
        }),
        state: status.state.clone(),
        running: status.running,
        done: status.done,
        exit_code: status.exit_code,
        error_type,
        error_message,
        scheduler_specific_information: status
            .scheduler_specific_information
            .clone()
            .into_iter()
            .collect(),
    }
}

/// Wire form of a queue status.
pub fn queue_status_message(scheduler: &proto::Scheduler, status: &QueueStatus) -> proto::QueueStatus {
    let (error_type, error_message) = error_fields(status.error.as_ref());
    proto::QueueStatus {
        name: status.queue_name.clone(),
        scheduler: Some(proto::Scheduler {
            id: scheduler.id.clone(),
            request: None,
        }),
        error_type,
        error_message,
        scheduler_specific_information: status
            .scheduler_specific_information
            .clone()
            .into_iter()
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn non_zero(value: u32) -> Option<u32> {
    (value != 0).then_some(value)
}

/// Library-side form of a job description. Empty and zero fields are unset.
pub fn job_description(description: proto::JobDescription) -> JobDescription {
    JobDescription {
        executable: description.executable,
        arguments: description.arguments,
        working_directory: non_empty(description.working_directory),
        environment: sorted(description.environment),
        queue_name: non_empty(description.queue_name),
        max_runtime: non_zero(description.max_runtime),
        node_count: non_zero(description.node_count),
        processes_per_node: non_zero(description.processes_per_node),
        start_single_process: description.start_single_process,
        stdin: non_empty(description.stdin),
        stdout: non_empty(description.stdout),
        stderr: non_empty(description.stderr),
        job_options: sorted(description.job_options),
    }
}

// ---------------------------------------------------------------------------
// Adaptor descriptions
// ---------------------------------------------------------------------------

fn property_message(property: &PropertyDescription) -> proto::PropertyDescription {
    let property_type = match property.property_type {
        PropertyType::String => property_description::Type::String,
        PropertyType::Boolean => property_description::Type::Boolean,
        PropertyType::Integer => property_description::Type::Integer,
        PropertyType::Long => property_description::Type::Long,
        PropertyType::Double => property_description::Type::Double,
        PropertyType::Size => property_description::Type::Size,
        PropertyType::Natural => property_description::Type::Natural,
    };
    proto::PropertyDescription {
        name: property.name.clone(),
        description: property.description.clone(),
        property_type: property_type as i32,
        default_value: property.default_value.clone().unwrap_or_default(),
    }
}

/// Wire form of a file system adaptor description.
pub fn file_system_description_message(
    description: &FileSystemAdaptorDescription,
) -> proto::FileSystemAdaptorDescription {
    proto::FileSystemAdaptorDescription {
        name: description.name.clone(),
        description: description.description.clone(),
        supported_locations: description.supported_locations.clone(),
        supported_properties: description
            .supported_properties
            .iter()
            .map(property_message)
            .collect(),
        can_read_symboliclinks: description.can_read_symboliclinks,
        can_create_symboliclinks: description.can_create_symboliclinks,
        supports_third_party_copy: description.supports_third_party_copy,
        can_append: description.can_append,
        needs_size_beforehand: description.needs_size_beforehand,
    }
}

/// Wire form of a scheduler adaptor description.
pub fn scheduler_description_message(
    description: &SchedulerAdaptorDescription,
) -> proto::SchedulerAdaptorDescription {
    proto::SchedulerAdaptorDescription {
        name: description.name.clone(),
        description: description.description.clone(),
        supported_locations: description.supported_locations.clone(),
        supported_properties: description
            .supported_properties
            .iter()
            .map(property_message)
            .collect(),
        is_embedded: description.is_embedded,
        supports_batch: description.supports_batch,
        supports_interactive: description.supports_interactive,
        uses_file_system: description.uses_file_system,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_custom_separator() {
        let path = remote_path(&proto::Path {
            path: "C:\\data\\in.txt".to_string(),
            separator: "\\".to_string(),
        })
        .unwrap();
        assert_eq!(path.file_name(), Some("in.txt"));
        assert_eq!(path_message(&path).separator, "\\");

        let err = remote_path(&proto::Path {
            path: "/x".to_string(),
            separator: "::".to_string(),
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_missing_path_is_invalid_argument() {
        let err = required_path(None, "path").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_listing_redacts_secrets() {
        let request = file_system_request(proto::CreateFileSystemRequest {
            adaptor: "file".to_string(),
            location: String::new(),
            properties: HashMap::new(),
            credential: Some(create_file_system_request::Credential::PasswordCredential(
                proto::PasswordCredential {
                    username: "alice".to_string(),
                    password: "hunter2".to_string(),
                },
            )),
        })
        .unwrap();
        let message = file_system_message("file://alice@#1", &request);
        let rendered = format!("{message:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_credential_map_with_fallback() {
        let mut entries = HashMap::new();
        entries.insert(
            "cluster".to_string(),
            proto::UserCredential {
                entry: Some(user_credential::Entry::DefaultCredential(
                    proto::DefaultCredential {
                        username: "carol".to_string(),
                    },
                )),
            },
        );
        let request = scheduler_request(proto::CreateSchedulerRequest {
            adaptor: "local".to_string(),
            location: String::new(),
            properties: HashMap::new(),
            credential: Some(create_scheduler_request::Credential::CredentialMap(
                proto::CredentialMap {
                    entries,
                    fallback: None,
                },
            )),
        })
        .unwrap();
        assert_eq!(request.credential.resolve("cluster").username(), "carol");
        assert!(matches!(
            request.credential.resolve("other"),
            Credential::Default { username: None }
        ));
    }

    #[test]
    fn test_password_without_username_rejected() {
        let err = scheduler_request(proto::CreateSchedulerRequest {
            adaptor: "local".to_string(),
            location: String::new(),
            properties: HashMap::new(),
            credential: Some(create_scheduler_request::Credential::PasswordCredential(
                proto::PasswordCredential::default(),
            )),
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_permissions_reject_none_and_unknown() {
        let parsed = permissions(&[
            proto::PosixFilePermission::OwnerRead as i32,
            proto::PosixFilePermission::OthersExecute as i32,
        ])
        .unwrap();
        assert_eq!(PosixFilePermission::to_mode(&parsed), 0o401);
        assert!(permissions(&[0]).is_err());
        assert!(permissions(&[42]).is_err());
    }

    #[test]
    fn test_job_description_unset_fields() {
        let description = job_description(proto::JobDescription {
            executable: "hostname".to_string(),
            ..Default::default()
        });
        assert_eq!(description.executable, "hostname");
        assert_eq!(description.queue_name, None);
        assert_eq!(description.max_runtime, None);
        assert_eq!(description.working_directory, None);
    }

    #[test]
    fn test_status_error_fields() {
        let status = JobStatus {
            job_id: "local-1".to_string(),
            state: "KILLED".to_string(),
            running: false,
            done: true,
            exit_code: None,
            error: Some(StatusError {
                error_type: StatusErrorType::Cancelled,
                message: "job cancelled: local-1".to_string(),
            }),
            scheduler_specific_information: BTreeMap::new(),
        };
        let message = job_status_message(&status);
        assert_eq!(message.error_type(), proto::ErrorType::Cancelled);
        assert_eq!(message.exit_code, None);
        assert_eq!(message.job.unwrap().id, "local-1");
    }
}
