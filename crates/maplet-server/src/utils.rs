//! gRPC plumbing helpers.

use std::time::Duration;

use tonic::metadata::MetadataMap;

/// Collect ascii metadata entries as header pairs for the child request.
pub fn metadata_to_headers(metadata: &MetadataMap) -> Vec<(String, String)> {
    metadata
        .iter()
        .filter_map(|entry| match entry {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => value
                .to_str()
                .ok()
                .map(|v| (key.as_str().to_string(), v.to_string())),
            tonic::metadata::KeyAndValueRef::Binary(..) => None,
        })
        .collect()
}

/// Parse a `grpc-timeout` header value (`8H`, `20S`, `1500m`, ...).
///
/// Returns `None` for absent or malformed values.
pub fn parse_grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let raw = metadata.get("grpc-timeout")?.to_str().ok()?;
    if raw.len() < 2 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let value: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(value.checked_mul(3600)?)),
        "M" => Some(Duration::from_secs(value.checked_mul(60)?)),
        "S" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_millis(value)),
        "u" => Some(Duration::from_micros(value)),
        "n" => Some(Duration::from_nanos(value)),
        _ => None,
    }
}

/// Per-request timeout: the client deadline when it is tighter than the
/// configured one.
pub fn effective_timeout(metadata: &MetadataMap, configured: Duration) -> Duration {
    match parse_grpc_timeout(metadata) {
        Some(client) if client < configured => client,
        _ => configured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    fn metadata(timeout: &str) -> MetadataMap {
        let mut map = MetadataMap::new();
        map.insert("grpc-timeout", MetadataValue::try_from(timeout).unwrap());
        map
    }

    #[test]
    fn grpc_timeout_units() {
        assert_eq!(
            parse_grpc_timeout(&metadata("20S")),
            Some(Duration::from_secs(20))
        );
        assert_eq!(
            parse_grpc_timeout(&metadata("1500m")),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            parse_grpc_timeout(&metadata("2H")),
            Some(Duration::from_secs(7200))
        );
        assert_eq!(parse_grpc_timeout(&metadata("nonsense")), None);
        assert_eq!(parse_grpc_timeout(&MetadataMap::new()), None);
    }

    #[test]
    fn client_deadline_tightens_the_timeout() {
        let configured = Duration::from_secs(20);
        assert_eq!(
            effective_timeout(&metadata("5S"), configured),
            Duration::from_secs(5)
        );
        assert_eq!(
            effective_timeout(&metadata("60S"), configured),
            configured
        );
        assert_eq!(effective_timeout(&MetadataMap::new(), configured), configured);
    }
}
