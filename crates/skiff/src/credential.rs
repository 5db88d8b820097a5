//! Credentials used to open sessions.

use std::collections::BTreeMap;

/// Credential presented to a back end.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credential {
    /// Use whatever the back end picks up from the environment, optionally
    /// for a specific user.
    Default {
        /// Username, or `None` for the current user
        username: Option<String>,
    },
    /// Username and password
    Password {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// Username with a certificate (private key) file
    Certificate {
        /// Username
        username: String,
        /// Path to the certificate file
        certfile: String,
        /// Passphrase of the certificate, may be empty
        passphrase: String,
    },
    /// Per-host credentials with a fallback for hosts not in the map
    Map {
        /// Credential by host name
        entries: BTreeMap<String, Credential>,
        /// Credential used when the host is not in `entries`
        fallback: Box<Credential>,
    },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default { username } => f
                .debug_struct("Default")
                .field("username", username)
                .finish(),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Certificate {
                username, certfile, ..
            } => f
                .debug_struct("Certificate")
                .field("username", username)
                .field("certfile", certfile)
                .finish_non_exhaustive(),
            Self::Map { entries, fallback } => f
                .debug_struct("Map")
                .field("entries", entries)
                .field("fallback", fallback)
                .finish(),
        }
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self::Default { username: None }
    }
}

impl Credential {
    /// Pick the credential that applies to `host`.
    ///
    /// Non-map credentials apply to every host.
    pub fn resolve(&self, host: &str) -> &Credential {
        match self {
            Self::Map { entries, fallback } => match entries.get(host) {
                Some(credential) => credential.resolve(host),
                None => fallback.resolve(host),
            },
            other => other,
        }
    }

    /// Username this credential authenticates as.
    ///
    /// Default credentials without a username resolve to the current user.
    /// Map credentials report the fallback's user.
    pub fn username(&self) -> String {
        match self {
            Self::Default { username: Some(u) } => u.clone(),
            Self::Default { username: None } => current_user(),
            Self::Password { username, .. } | Self::Certificate { username, .. } => {
                username.clone()
            }
            Self::Map { fallback, .. } => fallback.username(),
        }
    }
}

/// Name of the user running this process.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "nousername".to_string())
}

/// Host part of a location such as `ssh://host:22/path` or `host:22`.
///
/// Local locations (empty, a bare path) resolve to `localhost`.
pub fn location_host(location: &str) -> &str {
    let rest = match location.find("://") {
        Some(idx) => &location[idx + 3..],
        None => location,
    };
    if rest.is_empty() || rest.starts_with('/') {
        return "localhost";
    }
    let end = rest.find(['/', ':']).unwrap_or(rest.len());
    let host = &rest[..end];
    let host = host.rsplit('@').next().unwrap_or(host);
    if host.is_empty() { "localhost" } else { host }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_resolves_by_host_then_fallback() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "cluster".to_string(),
            Credential::Password {
                username: "alice".to_string(),
                password: "secret".to_string(),
            },
        );
        let credential = Credential::Map {
            entries,
            fallback: Box::new(Credential::Default {
                username: Some("bob".to_string()),
            }),
        };

        assert_eq!(credential.resolve("cluster").username(), "alice");
        assert_eq!(credential.resolve("elsewhere").username(), "bob");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let credential = Credential::Password {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", credential).contains("hunter2"));
    }

    #[test]
    fn test_location_host() {
        assert_eq!(location_host(""), "localhost");
        assert_eq!(location_host("/data"), "localhost");
        assert_eq!(location_host("ssh://user@cluster:22/home"), "cluster");
        assert_eq!(location_host("cluster.example.org:2222"), "cluster.example.org");
    }
}
