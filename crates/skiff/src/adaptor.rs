//! Adaptor discovery and session creation.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::credential::Credential;
use crate::error::{AdaptorError, AdaptorResult};
use crate::filesystem::FileSystem;
use crate::local::{LocalFileSystem, LocalScheduler};
use crate::scheduler::Scheduler;

/// Value type of an adaptor property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// Free text
    String,
    /// `true` or `false`
    Boolean,
    /// 32-bit signed integer
    Integer,
    /// 64-bit signed integer
    Long,
    /// Floating point number
    Double,
    /// Byte size with optional K, M or G suffix
    Size,
    /// Non-negative integer
    Natural,
}

/// A property an adaptor accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescription {
    /// Fully qualified property name
    pub name: String,
    /// What the property controls
    pub description: String,
    /// Value type
    pub property_type: PropertyType,
    /// Value used when the property is not set
    pub default_value: Option<String>,
}

impl PropertyDescription {
    fn new(name: &str, property_type: PropertyType, default: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            property_type,
            default_value: Some(default.to_string()),
        }
    }
}

/// Description of a file system adaptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemAdaptorDescription {
    /// Adaptor name
    pub name: String,
    /// Human readable summary
    pub description: String,
    /// Location formats the adaptor understands
    pub supported_locations: Vec<String>,
    /// Properties the adaptor accepts
    pub supported_properties: Vec<PropertyDescription>,
    /// Can read symbolic links
    pub can_read_symboliclinks: bool,
    /// Can create symbolic links
    pub can_create_symboliclinks: bool,
    /// Can copy between two remote file systems without routing bytes through the gateway
    pub supports_third_party_copy: bool,
    /// Supports appending to files
    pub can_append: bool,
    /// Needs the file size before writing
    pub needs_size_beforehand: bool,
}

/// Description of a scheduler adaptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerAdaptorDescription {
    /// Adaptor name
    pub name: String,
    /// Human readable summary
    pub description: String,
    /// Location formats the adaptor understands
    pub supported_locations: Vec<String>,
    /// Properties the adaptor accepts
    pub supported_properties: Vec<PropertyDescription>,
    /// Runs jobs inside the gateway process host
    pub is_embedded: bool,
    /// Supports batch jobs
    pub supports_batch: bool,
    /// Supports interactive jobs
    pub supports_interactive: bool,
    /// Exposes a file system to jobs
    pub uses_file_system: bool,
}

/// Names of all file system adaptors.
pub fn file_system_adaptor_names() -> Vec<String> {
    vec![LocalFileSystem::ADAPTOR_NAME.to_string()]
}

/// Descriptions of all file system adaptors.
pub fn file_system_adaptor_descriptions() -> Vec<FileSystemAdaptorDescription> {
    vec![LocalFileSystem::description()]
}

/// Description of one file system adaptor.
pub fn file_system_adaptor_description(name: &str) -> AdaptorResult<FileSystemAdaptorDescription> {
    file_system_adaptor_descriptions()
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| AdaptorError::UnknownAdaptor(name.to_string()))
}

/// Open a file system session.
pub fn create_file_system(
    adaptor: &str,
    location: &str,
    credential: &Credential,
    properties: &BTreeMap<String, String>,
) -> AdaptorResult<Arc<dyn FileSystem>> {
    match adaptor {
        LocalFileSystem::ADAPTOR_NAME => {
            let fs = LocalFileSystem::open(location, credential, properties)?;
            Ok(Arc::new(fs))
        }
        other => Err(AdaptorError::UnknownAdaptor(other.to_string())),
    }
}

/// One file system session per local root.
pub fn local_file_systems() -> AdaptorResult<Vec<Arc<dyn FileSystem>>> {
    LocalFileSystem::roots()
        .into_iter()
        .map(|root| {
            let fs = LocalFileSystem::open(&root, &Credential::default(), &BTreeMap::new())?;
            Ok(Arc::new(fs) as Arc<dyn FileSystem>)
        })
        .collect()
}

/// Names of all scheduler adaptors.
pub fn scheduler_adaptor_names() -> Vec<String> {
    vec![LocalScheduler::ADAPTOR_NAME.to_string()]
}

/// Descriptions of all scheduler adaptors.
pub fn scheduler_adaptor_descriptions() -> Vec<SchedulerAdaptorDescription> {
    vec![LocalScheduler::description()]
}

/// Description of one scheduler adaptor.
pub fn scheduler_adaptor_description(name: &str) -> AdaptorResult<SchedulerAdaptorDescription> {
    scheduler_adaptor_descriptions()
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| AdaptorError::UnknownAdaptor(name.to_string()))
}

/// Open a scheduler session.
pub fn create_scheduler(
    adaptor: &str,
    location: &str,
    credential: &Credential,
    properties: &BTreeMap<String, String>,
) -> AdaptorResult<Arc<dyn Scheduler>> {
    match adaptor {
        LocalScheduler::ADAPTOR_NAME => {
            let scheduler = LocalScheduler::open(location, credential, properties)?;
            Ok(Arc::new(scheduler))
        }
        other => Err(AdaptorError::UnknownAdaptor(other.to_string())),
    }
}

/// Check `properties` against what an adaptor supports.
///
/// Returns the supported properties with defaults filled in.
pub(crate) fn validate_properties(
    supported: &[PropertyDescription],
    properties: &BTreeMap<String, String>,
) -> AdaptorResult<BTreeMap<String, String>> {
    let mut resolved = BTreeMap::new();
    for (name, value) in properties {
        let description = supported
            .iter()
            .find(|d| &d.name == name)
            .ok_or_else(|| AdaptorError::UnknownProperty(name.clone()))?;
        check_value(description, value)?;
        resolved.insert(name.clone(), value.clone());
    }
    for description in supported {
        if let Some(default) = &description.default_value {
            resolved
                .entry(description.name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    Ok(resolved)
}

fn check_value(description: &PropertyDescription, value: &str) -> AdaptorResult<()> {
    let ok = match description.property_type {
        PropertyType::String => true,
        PropertyType::Boolean => value == "true" || value == "false",
        PropertyType::Integer => value.parse::<i32>().is_ok(),
        PropertyType::Long => value.parse::<i64>().is_ok(),
        PropertyType::Double => value.parse::<f64>().is_ok(),
        PropertyType::Size => parse_size(value).is_some(),
        PropertyType::Natural => value.parse::<u64>().is_ok(),
    };
    if ok {
        Ok(())
    } else {
        Err(AdaptorError::InvalidProperty {
            name: description.name.clone(),
            reason: format!("{:?} expected, got {:?}", description.property_type, value),
        })
    }
}

/// Parse a byte size such as `8192`, `64K`, `10M` or `1G`.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1024),
        'm' | 'M' => (&value[..value.len() - 1], 1024 * 1024),
        'g' | 'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Look up a numeric property that [`validate_properties`] already checked.
pub(crate) fn natural_property(properties: &BTreeMap<String, String>, name: &str) -> Option<u64> {
    properties.get(name).and_then(|v| v.parse().ok())
}

/// Look up a size property that [`validate_properties`] already checked.
pub(crate) fn size_property(properties: &BTreeMap<String, String>, name: &str) -> Option<u64> {
    properties.get(name).and_then(|v| parse_size(v))
}

pub(crate) fn property(
    name: &str,
    property_type: PropertyType,
    default: &str,
    description: &str,
) -> PropertyDescription {
    PropertyDescription::new(name, property_type, default, description)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported() -> Vec<PropertyDescription> {
        vec![property(
            "skiff.test.buffer",
            PropertyType::Size,
            "64K",
            "buffer",
        )]
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("8192"), Some(8192));
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size("2m"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_validate_fills_defaults() {
        let resolved = validate_properties(&supported(), &BTreeMap::new()).unwrap_or_default();
        assert_eq!(resolved.get("skiff.test.buffer").map(String::as_str), Some("64K"));
    }

    #[test]
    fn test_validate_rejects_unknown_and_invalid() {
        let mut props = BTreeMap::new();
        props.insert("skiff.test.other".to_string(), "1".to_string());
        assert!(matches!(
            validate_properties(&supported(), &props),
            Err(AdaptorError::UnknownProperty(_))
        ));

        let mut props = BTreeMap::new();
        props.insert("skiff.test.buffer".to_string(), "huge".to_string());
        assert!(matches!(
            validate_properties(&supported(), &props),
            Err(AdaptorError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn test_unknown_adaptor() {
        assert!(matches!(
            create_scheduler("slurm", "", &Credential::default(), &BTreeMap::new()),
            Err(AdaptorError::UnknownAdaptor(ref name)) if name == "slurm"
        ));
        assert!(file_system_adaptor_description("sftp").is_err());
        assert_eq!(file_system_adaptor_names(), vec!["file".to_string()]);
    }
}
