//! Dot-boundary domain-suffix matching.
//!
//! Suffix entries only ever match at label boundaries: `.x.com` matches
//! `api.x.com` and `x.com` itself, but never `evilx.com` or `evil-x.com`.
//! Plain `ends_with` checks are exactly the spoofing bug this type exists
//! to prevent, so all host/suffix comparisons in the crate go through here.

/// A single normalized domain suffix (lowercase, leading dot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSuffix(String);

impl DomainSuffix {
    /// Normalize an entry like `"x.com"`, `".x.com"`, or `"API.X.com"`.
    pub fn new(entry: &str) -> Self {
        let lower = entry.trim().to_ascii_lowercase();
        let normalized = if lower.starts_with('.') {
            lower
        } else {
            format!(".{}", lower)
        };
        DomainSuffix(normalized)
    }

    /// The suffix without its leading dot (the bare apex form).
    fn apex(&self) -> &str {
        &self.0[1..]
    }

    /// Dot-boundary match against a host name.
    pub fn matches(&self, host: &str) -> bool {
        let host = normalize_host(host);
        host == self.apex() || host.ends_with(&self.0)
    }
}

/// Strip a port suffix and lowercase a Host header value.
pub fn normalize_host(host: &str) -> String {
    let h = host.trim();
    let h = h.rsplit_once(':').map_or(h, |(name, port)| {
        // Only treat it as a port if the tail is numeric; IPv6 literals
        // are not expected here but must not be mangled.
        if port.chars().all(|c| c.is_ascii_digit()) {
            name
        } else {
            h
        }
    });
    h.to_ascii_lowercase()
}

/// An immutable list of known-domain suffixes.
#[derive(Debug, Clone, Default)]
pub struct SuffixList {
    entries: Vec<DomainSuffix>,
}

impl SuffixList {
    pub fn new(entries: &[String]) -> Self {
        Self {
            entries: entries.iter().map(|e| DomainSuffix::new(e)).collect(),
        }
    }

    /// Whether `host` falls under any suffix in the list.
    pub fn contains(&self, host: &str) -> bool {
        self.entries.iter().any(|s| s.matches(host))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_subdomain_and_apex() {
        let suffix = DomainSuffix::new(".x.com");
        assert!(suffix.matches("api.x.com"));
        assert!(suffix.matches("deep.api.x.com"));
        assert!(suffix.matches("x.com"));
    }

    #[test]
    fn rejects_spoofed_hosts() {
        let suffix = DomainSuffix::new(".x.com");
        assert!(!suffix.matches("evilx.com"));
        assert!(!suffix.matches("evil-x.com"));
        assert!(!suffix.matches("x.com.evil.net"));
    }

    #[test]
    fn entry_without_leading_dot_is_normalized() {
        let suffix = DomainSuffix::new("x.com");
        assert!(suffix.matches("api.x.com"));
        assert!(suffix.matches("x.com"));
        assert!(!suffix.matches("evilx.com"));
    }

    #[test]
    fn matching_is_case_insensitive_and_ignores_port() {
        let suffix = DomainSuffix::new(".X.Com");
        assert!(suffix.matches("API.x.COM"));
        assert!(suffix.matches("api.x.com:443"));
    }

    #[test]
    fn suffix_list_contains() {
        let list = SuffixList::new(&[".anthropic.com".to_string(), ".github.com".to_string()]);
        assert!(list.contains("api.anthropic.com"));
        assert!(list.contains("github.com"));
        assert!(!list.contains("evil.example"));
        assert!(!list.contains("notgithub.com"));
    }

    #[test]
    fn empty_list_contains_nothing() {
        let list = SuffixList::default();
        assert!(list.is_empty());
        assert!(!list.contains("anything.com"));
    }

    #[test]
    fn normalize_host_strips_numeric_port_only() {
        assert_eq!(normalize_host("Example.COM:8443"), "example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(normalize_host("weird:host"), "weird:host");
    }
}
