//! Separator-aware paths on remote file systems.

use std::fmt;

/// Separator used when a request does not name one.
pub const DEFAULT_SEPARATOR: char = '/';

/// A path on a (possibly remote) file system.
///
/// Paths are kept as a list of elements plus the separator they were written
/// with, so a client on one platform can address a file system that uses a
/// different separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath {
    separator: char,
    absolute: bool,
    elements: Vec<String>,
}

impl RemotePath {
    /// Parse a path written with the default separator.
    pub fn new(path: &str) -> Self {
        Self::with_separator(path, DEFAULT_SEPARATOR)
    }

    /// Parse a path written with `separator`.
    ///
    /// Empty elements (repeated or trailing separators) are dropped.
    pub fn with_separator(path: &str, separator: char) -> Self {
        let absolute = path.starts_with(separator);
        let elements = path
            .split(separator)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            separator,
            absolute,
            elements,
        }
    }

    /// Separator this path renders with.
    pub fn separator(&self) -> char {
        self.separator
    }

    /// Whether the path starts at the root.
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Path elements without separators.
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Last element, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.elements.last().map(String::as_str)
    }

    /// Path without its last element. `None` for the root or an empty path.
    pub fn parent(&self) -> Option<Self> {
        if self.elements.is_empty() {
            return None;
        }
        Some(Self {
            separator: self.separator,
            absolute: self.absolute,
            elements: self.elements[..self.elements.len() - 1].to_vec(),
        })
    }

    /// Append an element.
    pub fn join(&self, element: &str) -> Self {
        let mut elements = self.elements.clone();
        elements.extend(
            element
                .split(self.separator)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
        );
        Self {
            separator: self.separator,
            absolute: self.absolute,
            elements,
        }
    }

    /// Resolve a relative path against `base`. Absolute paths are returned as is.
    pub fn resolve_against(&self, base: &RemotePath) -> Self {
        if self.absolute {
            return self.clone();
        }
        let mut elements = base.elements.clone();
        elements.extend(self.elements.iter().cloned());
        Self {
            separator: base.separator,
            absolute: base.absolute,
            elements,
        }
    }

    /// Collapse `.` and `..` elements.
    ///
    /// Returns `None` when `..` would climb above the first element.
    pub fn normalize(&self) -> Option<Self> {
        let mut out: Vec<String> = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            match element.as_str() {
                "." => {}
                ".." => {
                    out.pop()?;
                }
                _ => out.push(element.clone()),
            }
        }
        Some(Self {
            separator: self.separator,
            absolute: self.absolute,
            elements: out,
        })
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            write!(f, "{}", self.separator)?;
        }
        let mut first = true;
        for element in &self.elements {
            if !first {
                write!(f, "{}", self.separator)?;
            }
            f.write_str(element)?;
            first = false;
        }
        if !self.absolute && self.elements.is_empty() {
            f.write_str(".")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_separator() {
        let path = RemotePath::new("/home//user/data/");
        assert!(path.is_absolute());
        assert_eq!(path.elements(), ["home", "user", "data"]);
        assert_eq!(path.to_string(), "/home/user/data");
    }

    #[test]
    fn test_parse_custom_separator() {
        let path = RemotePath::with_separator("\\Users\\me\\file.txt", '\\');
        assert!(path.is_absolute());
        assert_eq!(path.file_name(), Some("file.txt"));
        assert_eq!(path.to_string(), "\\Users\\me\\file.txt");
    }

    #[test]
    fn test_relative_resolution() {
        let base = RemotePath::new("/work");
        let path = RemotePath::new("sub/file").resolve_against(&base);
        assert_eq!(path.to_string(), "/work/sub/file");
    }

    #[test]
    fn test_normalize_rejects_escape() {
        assert!(RemotePath::new("/a/../..").normalize().is_none());
        let normalized = RemotePath::new("/a/./b/../c").normalize();
        assert_eq!(normalized.map(|p| p.to_string()), Some("/a/c".to_string()));
    }

    #[test]
    fn test_parent_of_root() {
        assert!(RemotePath::new("/").parent().is_none());
        assert_eq!(
            RemotePath::new("/a/b").parent().map(|p| p.to_string()),
            Some("/a".to_string())
        );
    }
}
