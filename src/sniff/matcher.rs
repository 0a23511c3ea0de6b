//! Domain matcher for sniffer force/skip lists
//!
//! Supports exact names, `+.example.com` (domain and all subdomains) and
//! `*.example.com` (exactly one extra label), matching the rule syntax of
//! the sniffer configuration surface.

/// A single domain rule
#[derive(Debug, Clone)]
enum DomainRule {
    /// Exact match
    Full(String),
    /// Domain and any subdomain
    Suffix(String),
    /// Exactly one additional label
    Wildcard(String),
}

impl DomainRule {
    fn parse(pattern: &str) -> Self {
        let pattern = pattern.to_lowercase();
        if let Some(rest) = pattern.strip_prefix("+.") {
            DomainRule::Suffix(rest.to_string())
        } else if let Some(rest) = pattern.strip_prefix("*.") {
            DomainRule::Wildcard(rest.to_string())
        } else {
            DomainRule::Full(pattern)
        }
    }

    fn matches(&self, domain: &str) -> bool {
        match self {
            DomainRule::Full(s) => domain == s,
            DomainRule::Suffix(s) => {
                domain == s || domain.ends_with(&format!(".{}", s))
            }
            DomainRule::Wildcard(s) => match domain.strip_suffix(s) {
                Some(head) => {
                    let head = match head.strip_suffix('.') {
                        Some(h) => h,
                        None => return false,
                    };
                    !head.is_empty() && !head.contains('.')
                }
                None => false,
            },
        }
    }
}

/// Compiled rule list for host lookups
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    rules: Vec<DomainRule>,
}

impl DomainMatcher {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            rules: patterns.iter().map(|p| DomainRule::parse(p)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True when any rule matches the host
    pub fn search(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let host = host.to_lowercase();
        self.rules.iter().any(|r| r.matches(&host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> DomainMatcher {
        DomainMatcher::new(&patterns.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_full_match() {
        let m = matcher(&["example.com"]);
        assert!(m.search("example.com"));
        assert!(m.search("EXAMPLE.com"));
        assert!(!m.search("sub.example.com"));
    }

    #[test]
    fn test_suffix_match() {
        let m = matcher(&["+.example.com"]);
        assert!(m.search("example.com"));
        assert!(m.search("a.example.com"));
        assert!(m.search("a.b.example.com"));
        assert!(!m.search("notexample.com"));
    }

    #[test]
    fn test_wildcard_match() {
        let m = matcher(&["*.example.com"]);
        assert!(m.search("a.example.com"));
        assert!(!m.search("example.com"));
        assert!(!m.search("a.b.example.com"));
    }
}
