//! Registry of live sessions addressed by gateway-generated ids.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::{Entry, VacantEntry};
use skiff::credential::location_host;
use skiff::{AdaptorError, Credential, Session};

use crate::error::{GatewayError, GatewayResult};

/// Parameters a session was created with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionRequest {
    /// Adaptor name
    pub adaptor: String,
    /// Back-end location
    pub location: String,
    /// Credential used to connect
    pub credential: Credential,
    /// Adaptor properties
    pub properties: BTreeMap<String, String>,
}

impl SessionRequest {
    /// User the session runs as at its location.
    pub fn principal(&self) -> String {
        self.credential
            .resolve(location_host(&self.location))
            .username()
    }
}

/// Kind of session a registry holds. Used in ids and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// File system sessions
    FileSystem,
    /// Scheduler sessions
    Scheduler,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::FileSystem => f.write_str("file system"),
            HandleKind::Scheduler => f.write_str("scheduler"),
        }
    }
}

struct Handle<S: ?Sized> {
    session: Arc<S>,
    request: SessionRequest,
}

/// Outcome of [`HandleRegistry::close_all`].
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Number of sessions closed without error
    pub closed: usize,
    /// Sessions whose close failed, by id
    pub failures: Vec<(String, AdaptorError)>,
}

/// Concurrent map from handle id to live session.
///
/// Ids look like `adaptor://user@location#n`. The numeric suffix comes from a
/// counter, so closing a session and creating it again yields a new id. A
/// second session for a request identical to a live one is rejected with
/// `ALREADY_EXISTS`.
pub struct HandleRegistry<S: ?Sized> {
    kind: HandleKind,
    handles: DashMap<String, Handle<S>>,
    /// Request to the id of the live handle created from it
    live: DashMap<SessionRequest, String>,
    counter: AtomicU64,
}

impl<S: ?Sized> fmt::Debug for HandleRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("kind", &self.kind)
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl<S: Session + ?Sized> HandleRegistry<S> {
    /// Create an empty registry.
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            handles: DashMap::new(),
            live: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Register `session`, created from `request`, and return its id.
    ///
    /// Fails with `ALREADY_EXISTS` if a live session was created from an
    /// identical request. The rejected session is closed.
    pub fn put(&self, request: SessionRequest, session: Arc<S>) -> GatewayResult<String> {
        match self.live.entry(request.clone()) {
            Entry::Occupied(existing) => {
                let id = existing.get().clone();
                drop(existing);
                if let Err(err) = session.close() {
                    tracing::warn!(%id, error = %err, "failed to close rejected duplicate session");
                }
                Err(GatewayError::already_exists(format!(
                    "{} {id} is already open for this request",
                    self.kind
                )))
            }
            Entry::Vacant(slot) => Ok(self.insert(slot, request, session)),
        }
    }

    /// Register `session` unless a live session was created from an identical
    /// request. In that case the live id is returned and `session` is left
    /// open, since the caller may share it with another owner.
    pub fn put_or_reuse(&self, request: SessionRequest, session: Arc<S>) -> String {
        match self.live.entry(request.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => self.insert(slot, request, session),
        }
    }

    fn insert(
        &self,
        slot: VacantEntry<'_, SessionRequest, String>,
        request: SessionRequest,
        session: Arc<S>,
    ) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!(
            "{}://{}@{}#{n}",
            request.adaptor,
            request.principal(),
            request.location
        );
        self.handles.insert(
            id.clone(),
            Handle { session, request },
        );
        slot.insert(id.clone());
        tracing::info!(%id, kind = %self.kind, "session registered");
        id
    }

    /// Session registered under `id`.
    pub fn get(&self, id: &str) -> GatewayResult<Arc<S>> {
        self.handles
            .get(id)
            .map(|h| Arc::clone(&h.session))
            .ok_or_else(|| self.not_found(id))
    }

    /// Request the session under `id` was created from.
    pub fn request(&self, id: &str) -> GatewayResult<SessionRequest> {
        self.handles
            .get(id)
            .map(|h| h.request.clone())
            .ok_or_else(|| self.not_found(id))
    }

    /// Id of the live session created from a request identical to `request`.
    pub fn find_live(&self, request: &SessionRequest) -> Option<String> {
        self.live.get(request).map(|id| id.clone())
    }

    /// Unregister `id` without closing the session. Unknown ids are ignored.
    pub fn remove(&self, id: &str) -> Option<(Arc<S>, SessionRequest)> {
        let (_, handle) = self.handles.remove(id)?;
        self.live
            .remove_if(&handle.request, |_, live_id| live_id == id);
        Some((handle.session, handle.request))
    }

    /// Unregister and close the session under `id`.
    pub fn close(&self, id: &str) -> GatewayResult<()> {
        let (session, _) = self.remove(id).ok_or_else(|| self.not_found(id))?;
        tracing::info!(%id, kind = %self.kind, "closing session");
        session.close().map_err(GatewayError::from)
    }

    /// Snapshot of every registered id with its request, sorted by id.
    pub fn list(&self) -> Vec<(String, SessionRequest)> {
        let mut entries: Vec<_> = self
            .handles
            .iter()
            .map(|h| (h.key().clone(), h.request.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Close every session and empty the registry.
    ///
    /// A failing close is recorded and the remaining sessions are still
    /// closed.
    pub fn close_all(&self) -> CloseReport {
        let mut report = CloseReport::default();
        let ids: Vec<String> = self.handles.iter().map(|h| h.key().clone()).collect();
        for id in ids {
            let Some((session, _)) = self.remove(&id) else {
                continue;
            };
            match session.close() {
                Ok(()) => report.closed += 1,
                Err(err) => {
                    tracing::warn!(%id, error = %err, "failed to close session");
                    report.failures.push((id, err));
                }
            }
        }
        report
    }

    fn not_found(&self, id: &str) -> GatewayError {
        GatewayError::not_found(format!("no such {}: {id}", self.kind))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use skiff::AdaptorResult;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Default)]
    struct FakeSession {
        fail_close: bool,
        closed: AtomicBool,
        properties: BTreeMap<String, String>,
    }

    impl Session for FakeSession {
        fn adaptor_name(&self) -> &str {
            "fake"
        }

        fn location(&self) -> &str {
            "nowhere"
        }

        fn properties(&self) -> &BTreeMap<String, String> {
            &self.properties
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) -> AdaptorResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                Err(AdaptorError::backend("fake", "close failed"))
            } else {
                Ok(())
            }
        }
    }

    fn request(location: &str) -> SessionRequest {
        SessionRequest {
            adaptor: "fake".to_string(),
            location: location.to_string(),
            credential: Credential::Default {
                username: Some("alice".to_string()),
            },
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let registry = HandleRegistry::<FakeSession>::new(HandleKind::FileSystem);
        let session = Arc::new(FakeSession::default());
        let id = registry.put(request("host"), Arc::clone(&session)).unwrap();
        assert_eq!(id, "fake://alice@host#1");
        assert!(Arc::ptr_eq(&registry.get(&id).unwrap(), &session));
    }

    #[test]
    fn test_duplicate_live_request_rejected() {
        let registry = HandleRegistry::<FakeSession>::new(HandleKind::Scheduler);
        let id = registry
            .put(request("host"), Arc::new(FakeSession::default()))
            .unwrap();
        let duplicate = Arc::new(FakeSession::default());
        let err = registry
            .put(request("host"), Arc::clone(&duplicate))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
        assert!(err.message.contains(&id));
        assert!(!duplicate.is_open());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_recreate_after_close_gets_new_id() {
        let registry = HandleRegistry::<FakeSession>::new(HandleKind::FileSystem);
        let first = registry
            .put(request("host"), Arc::new(FakeSession::default()))
            .unwrap();
        registry.close(&first).unwrap();
        let second = registry
            .put(request("host"), Arc::new(FakeSession::default()))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.find_live(&request("host")), Some(second));
    }

    #[test]
    fn test_requests_differing_only_in_secret_are_distinct() {
        let registry = HandleRegistry::<FakeSession>::new(HandleKind::Scheduler);
        let with_password = |password: &str| SessionRequest {
            credential: Credential::Password {
                username: "alice".to_string(),
                password: password.to_string(),
            },
            ..request("host")
        };
        let first = registry
            .put(with_password("one"), Arc::new(FakeSession::default()))
            .unwrap();
        let second = registry
            .put(with_password("two"), Arc::new(FakeSession::default()))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.find_live(&with_password("one")), Some(first.clone()));
        assert_eq!(registry.find_live(&with_password("two")), Some(second));
        assert_eq!(registry.find_live(&with_password("three")), None);

        registry.close(&first).unwrap();
        assert_eq!(registry.find_live(&with_password("one")), None);
    }

    #[test]
    fn test_put_or_reuse_keeps_shared_session_open() {
        let registry = HandleRegistry::<FakeSession>::new(HandleKind::FileSystem);
        let id = registry
            .put(request("host"), Arc::new(FakeSession::default()))
            .unwrap();
        let shared = Arc::new(FakeSession::default());
        assert_eq!(registry.put_or_reuse(request("host"), Arc::clone(&shared)), id);
        assert!(shared.is_open());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_id_is_not_found_with_id() {
        let registry = HandleRegistry::<FakeSession>::new(HandleKind::FileSystem);
        let err = registry.get("fake://bob@x#9").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("fake://bob@x#9"));
        assert!(registry.close("fake://bob@x#9").is_err());
        assert!(registry.remove("fake://bob@x#9").is_none());
    }

    #[test]
    fn test_close_all_continues_past_failure() {
        let registry = HandleRegistry::<FakeSession>::new(HandleKind::FileSystem);
        let failing = Arc::new(FakeSession {
            fail_close: true,
            ..Default::default()
        });
        let healthy = Arc::new(FakeSession::default());
        registry.put(request("a"), Arc::clone(&failing)).unwrap();
        registry.put(request("b"), Arc::clone(&healthy)).unwrap();

        let report = registry.close_all();
        assert_eq!(report.closed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(!healthy.is_open());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_is_sorted_snapshot() {
        let registry = HandleRegistry::<FakeSession>::new(HandleKind::FileSystem);
        registry
            .put(request("a"), Arc::new(FakeSession::default()))
            .unwrap();
        registry
            .put(request("b"), Arc::new(FakeSession::default()))
            .unwrap();
        let ids: Vec<String> = registry.list().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["fake://alice@a#1", "fake://alice@b#2"]);
    }
}
