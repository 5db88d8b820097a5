//! Behaviour shared by every live back-end session.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::AdaptorResult;

/// A live connection to a back end.
pub trait Session: fmt::Debug + Send + Sync {
    /// Name of the adaptor that created the session.
    fn adaptor_name(&self) -> &str;

    /// Location the session is connected to.
    fn location(&self) -> &str;

    /// Adaptor properties the session was created with.
    fn properties(&self) -> &BTreeMap<String, String>;

    /// Whether the session still accepts operations.
    fn is_open(&self) -> bool;

    /// Close the session. Further operations fail with `NotConnected`.
    fn close(&self) -> AdaptorResult<()>;
}
