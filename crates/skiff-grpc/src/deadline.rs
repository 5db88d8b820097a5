//! Call deadlines taken from the `grpc-timeout` request header.

use std::time::Duration;

use tokio::time::Instant;
use tonic::metadata::MetadataMap;

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Parse a `grpc-timeout` value such as `100m` or `5S`.
///
/// The value is at most eight ASCII digits followed by one unit: `H`, `M`,
/// `S`, `m` (milliseconds), `u` (microseconds) or `n` (nanoseconds).
pub fn parse_timeout(value: &str) -> Option<Duration> {
    let unit = value.chars().last()?;
    let digits = &value[..value.len() - unit.len_utf8()];
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        'H' => Duration::from_secs(amount * 60 * 60),
        'M' => Duration::from_secs(amount * 60),
        'S' => Duration::from_secs(amount),
        'm' => Duration::from_millis(amount),
        'u' => Duration::from_micros(amount),
        'n' => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// Deadline of the call whose metadata is `metadata`, if the client set one.
///
/// A malformed header is ignored.
pub fn from_metadata(metadata: &MetadataMap) -> Option<Instant> {
    let value = metadata.get(GRPC_TIMEOUT_HEADER)?.to_str().ok()?;
    match parse_timeout(value) {
        Some(timeout) => Some(Instant::now() + timeout),
        None => {
            tracing::debug!(value, "ignoring malformed grpc-timeout header");
            None
        }
    }
}

/// Whether `deadline` has passed.
pub fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_timeout("3M"), Some(Duration::from_secs(180)));
        assert_eq!(parse_timeout("5S"), Some(Duration::from_secs(5)));
        assert_eq!(parse_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_timeout("7u"), Some(Duration::from_micros(7)));
        assert_eq!(parse_timeout("9n"), Some(Duration::from_nanos(9)));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_timeout(""), None);
        assert_eq!(parse_timeout("S"), None);
        assert_eq!(parse_timeout("10"), None);
        assert_eq!(parse_timeout("10x"), None);
        assert_eq!(parse_timeout("-1S"), None);
        assert_eq!(parse_timeout("123456789S"), None);
    }

    #[tokio::test]
    async fn test_from_metadata() {
        let mut metadata = MetadataMap::new();
        assert!(from_metadata(&metadata).is_none());

        metadata.insert(GRPC_TIMEOUT_HEADER, "1S".parse().unwrap());
        let deadline = from_metadata(&metadata).unwrap();
        assert!(deadline > Instant::now());
        assert!(!expired(Some(deadline)));

        metadata.insert(GRPC_TIMEOUT_HEADER, "soon".parse().unwrap());
        assert!(from_metadata(&metadata).is_none());
    }

    #[test]
    fn test_expired_without_deadline() {
        assert!(!expired(None));
    }
}
