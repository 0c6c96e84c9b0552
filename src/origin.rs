//! Origin validation for the WebSocket handshake
//!
//! The allow-list holds `host:port` entries and matching is byte-for-byte.
//! Mixed-case origins are rejected rather than normalized: case-folding here
//! would open an allow-list bypass for case-sensitive upstream comparisons.

/// Stateless origin validator over a configured allow-list
#[derive(Debug, Clone)]
pub struct OriginGuard {
    allowed_hosts: Vec<String>,
}

impl OriginGuard {
    /// Create a guard from `host:port` allow-list entries
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self { allowed_hosts }
    }

    /// Validate an Origin header value. Fails closed: empty, malformed,
    /// non-http(s), and unlisted origins are all rejected.
    pub fn is_allowed(&self, origin: &str) -> bool {
        origin_host(origin)
            .map(|host| self.allowed_hosts.iter().any(|allowed| allowed == host))
            .unwrap_or(false)
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }
}

/// Extract the `host[:port]` part of an origin, or None if the origin is
/// empty, malformed, or not an exact-case http/https scheme.
fn origin_host(origin: &str) -> Option<&str> {
    let rest = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))?;

    if rest.is_empty() {
        return None;
    }

    // An Origin value is scheme://host[:port] with nothing after the
    // authority; anything else is malformed and rejected.
    if rest.contains(['/', '?', '#', '@', '\\']) || rest.chars().any(char::is_whitespace) {
        return None;
    }

    Some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> OriginGuard {
        OriginGuard::new(vec!["localhost:3000".to_string(), "127.0.0.1:8080".to_string()])
    }

    #[test]
    fn test_allowed_origin() {
        assert!(guard().is_allowed("http://localhost:3000"));
        assert!(guard().is_allowed("https://localhost:3000"));
        assert!(guard().is_allowed("http://127.0.0.1:8080"));
    }

    #[test]
    fn test_unlisted_origin_rejected() {
        assert!(!guard().is_allowed("http://evil.example:3000"));
        assert!(!guard().is_allowed("http://localhost:3001"));
        assert!(!guard().is_allowed("http://localhost"));
    }

    #[test]
    fn test_case_sensitivity() {
        // Mixed case must be rejected, not normalized
        assert!(!guard().is_allowed("HTTP://LOCALHOST:3000"));
        assert!(!guard().is_allowed("http://LocalHost:3000"));
        assert!(!guard().is_allowed("Https://localhost:3000"));
    }

    #[test]
    fn test_missing_or_empty_origin_rejected() {
        assert!(!guard().is_allowed(""));
        assert!(!guard().is_allowed("http://"));
        assert!(!guard().is_allowed("https://"));
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        assert!(!guard().is_allowed("ftp://localhost:3000"));
        assert!(!guard().is_allowed("ws://localhost:3000"));
        assert!(!guard().is_allowed("file://localhost:3000"));
        assert!(!guard().is_allowed("localhost:3000"));
    }

    #[test]
    fn test_malformed_origins_fail_closed() {
        assert!(!guard().is_allowed("http://localhost:3000/path"));
        assert!(!guard().is_allowed("http://localhost:3000?x=1"));
        assert!(!guard().is_allowed("http://user@localhost:3000"));
        assert!(!guard().is_allowed("http://localhost:3000 "));
        assert!(!guard().is_allowed("http://evil.example\\localhost:3000"));
    }

    #[test]
    fn test_empty_allow_list_rejects_everything() {
        let guard = OriginGuard::new(vec![]);
        assert!(!guard.is_allowed("http://localhost:3000"));
    }
}
