//! Domain rule set and matching
//!
//! Rules are either literal FQDNs (`api.example.com`) or leading-label
//! wildcards (`*.example.com`). A wildcard matches strict subdomains of
//! its suffix, never the suffix itself. Lookup is exact-key first, then
//! wildcard keys from the longest matching suffix down, so the most
//! specific rule always wins.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

/// A single routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Normalized pattern (lowercased, trimmed)
    pub pattern: String,
    /// Route matching names through the tunnel when true, directly when false
    pub tunnel: bool,
}

/// Outcome of classifying a single name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Whether any rule matched
    pub matched: bool,
    /// Classification; `false` (direct) when no rule matched
    pub tunnel: bool,
    /// Pattern of the winning rule, if any
    pub matched_rule: Option<String>,
}

impl MatchResult {
    fn no_match() -> Self {
        Self {
            matched: false,
            tunnel: false,
            matched_rule: None,
        }
    }
}

/// Normalize a DNS name for rule lookup: trim, lowercase, strip the
/// trailing root dot that wire-format names carry.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Validate a rule pattern.
///
/// Accepts a literal domain or a `*.<suffix>` wildcard. Rejects empty
/// patterns, more than one `*`, a `*` anywhere but the leading label,
/// and labels outside `[a-z0-9-]` (no leading/trailing hyphen).
pub fn validate_pattern(pattern: &str) -> Result<()> {
    let normalized = normalize_name(pattern);

    if normalized.is_empty() {
        return Err(Error::invalid(pattern, "pattern is empty"));
    }

    let star_count = normalized.matches('*').count();
    if star_count > 1 {
        return Err(Error::invalid(pattern, "more than one wildcard"));
    }

    let domain_part = if let Some(rest) = normalized.strip_prefix("*.") {
        rest
    } else if star_count > 0 {
        return Err(Error::invalid(
            pattern,
            "wildcard must be the entire leading label ('*.example.com')",
        ));
    } else {
        normalized.as_str()
    };

    if domain_part.is_empty() {
        return Err(Error::invalid(pattern, "wildcard has no suffix"));
    }

    for label in domain_part.split('.') {
        if label.is_empty() {
            return Err(Error::invalid(pattern, "empty domain label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(Error::invalid(pattern, "domain label too long"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::invalid(
                pattern,
                "domain label cannot start or end with '-'",
            ));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(Error::invalid(
                pattern,
                "domain label contains invalid characters",
            ));
        }
    }

    Ok(())
}

/// Keyed rule set classifying names as tunnel or direct.
///
/// The pattern is the unique key; inserting an existing pattern
/// replaces its classification. Every stored pattern has passed
/// [`validate_pattern`].
#[derive(Debug, Default, Clone)]
pub struct DomainMatcher {
    rules: HashMap<String, Rule>,
}

impl DomainMatcher {
    /// Create an empty matcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a rule.
    ///
    /// Returns an error and leaves the set untouched when the pattern
    /// is invalid.
    pub fn add(&mut self, pattern: &str, tunnel: bool) -> Result<()> {
        validate_pattern(pattern)?;
        let normalized = normalize_name(pattern);
        log::debug!(
            "rule {}: {}",
            if tunnel { "tunnel" } else { "direct" },
            normalized
        );
        self.rules.insert(
            normalized.clone(),
            Rule {
                pattern: normalized,
                tunnel,
            },
        );
        Ok(())
    }

    /// Remove a rule by pattern. Returns whether a rule was removed.
    pub fn remove(&mut self, pattern: &str) -> bool {
        self.rules.remove(&normalize_name(pattern)).is_some()
    }

    /// Replace the whole rule set.
    ///
    /// Invalid entries abort the load with the first error; the
    /// existing set is kept in that case.
    pub fn load(&mut self, rules: &[Rule]) -> Result<()> {
        let mut fresh = HashMap::with_capacity(rules.len());
        for rule in rules {
            validate_pattern(&rule.pattern)?;
            let normalized = normalize_name(&rule.pattern);
            fresh.insert(
                normalized.clone(),
                Rule {
                    pattern: normalized,
                    tunnel: rule.tunnel,
                },
            );
        }
        self.rules = fresh;
        Ok(())
    }

    /// Classify a name.
    ///
    /// Exact rules win over wildcards; between wildcards the longest
    /// matching suffix wins. An unmatched name is direct.
    pub fn classify(&self, name: &str) -> MatchResult {
        let name = normalize_name(name);
        if name.is_empty() {
            return MatchResult::no_match();
        }

        if let Some(rule) = self.rules.get(&name) {
            return MatchResult {
                matched: true,
                tunnel: rule.tunnel,
                matched_rule: Some(rule.pattern.clone()),
            };
        }

        // For a.b.c.tld probe *.b.c.tld, *.c.tld, *.tld in that order.
        let labels: Vec<&str> = name.split('.').collect();
        for start in 1..labels.len() {
            let key = format!("*.{}", labels[start..].join("."));
            if let Some(rule) = self.rules.get(&key) {
                return MatchResult {
                    matched: true,
                    tunnel: rule.tunnel,
                    matched_rule: Some(rule.pattern.clone()),
                };
            }
        }

        MatchResult::no_match()
    }

    /// All stored rules, sorted by pattern for stable output
    pub fn rules(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.rules.values().cloned().collect();
        rules.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        rules
    }

    /// Number of stored rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(rules: &[(&str, bool)]) -> DomainMatcher {
        let mut m = DomainMatcher::new();
        for (pattern, tunnel) in rules {
            m.add(pattern, *tunnel).unwrap();
        }
        m
    }

    #[test]
    fn test_exact_match() {
        let m = matcher(&[("example.com", true)]);
        let result = m.classify("example.com");
        assert!(result.matched);
        assert!(result.tunnel);
        assert_eq!(result.matched_rule.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_no_match_is_direct() {
        let m = matcher(&[("example.com", true)]);
        let result = m.classify("other.net");
        assert!(!result.matched);
        assert!(!result.tunnel);
        assert!(result.matched_rule.is_none());
    }

    #[test]
    fn test_wildcard_matches_subdomains() {
        let m = matcher(&[("*.example.com", true)]);
        assert!(m.classify("api.example.com").tunnel);
        assert!(m.classify("deep.api.example.com").tunnel);
    }

    #[test]
    fn test_wildcard_does_not_match_base() {
        let m = matcher(&[("*.example.com", true)]);
        let result = m.classify("example.com");
        assert!(!result.matched);
        assert!(!result.tunnel);
    }

    #[test]
    fn test_exact_wins_over_wildcard() {
        let m = matcher(&[("*.example.com", true), ("api.example.com", false)]);
        let result = m.classify("api.example.com");
        assert!(result.matched);
        assert!(!result.tunnel);
        assert_eq!(result.matched_rule.as_deref(), Some("api.example.com"));
    }

    #[test]
    fn test_longest_suffix_wildcard_wins() {
        let m = matcher(&[("*.example.com", false), ("*.api.example.com", true)]);
        let result = m.classify("v2.api.example.com");
        assert!(result.tunnel);
        assert_eq!(result.matched_rule.as_deref(), Some("*.api.example.com"));
    }

    #[test]
    fn test_case_insensitive() {
        let m = matcher(&[("Example.COM", true)]);
        assert_eq!(m.classify("EXAMPLE.com"), m.classify("example.com"));
        assert!(m.classify("EXAMPLE.com").tunnel);
    }

    #[test]
    fn test_trailing_dot_stripped() {
        let m = matcher(&[("example.com", true)]);
        assert!(m.classify("example.com.").tunnel);
    }

    #[test]
    fn test_replace_existing_pattern() {
        let mut m = matcher(&[("example.com", true)]);
        m.add("example.com", false).unwrap();
        assert_eq!(m.len(), 1);
        assert!(!m.classify("example.com").tunnel);
    }

    #[test]
    fn test_remove() {
        let mut m = matcher(&[("example.com", true)]);
        assert!(m.remove("EXAMPLE.com"));
        assert!(!m.remove("example.com"));
        assert!(!m.classify("example.com").matched);
    }

    #[test]
    fn test_load_round_trip() {
        let mut m = DomainMatcher::new();
        m.load(&[
            Rule {
                pattern: "*.Example.com".into(),
                tunnel: true,
            },
            Rule {
                pattern: "direct.net".into(),
                tunnel: false,
            },
        ])
        .unwrap();

        let rules = m.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].pattern, "*.example.com");
        assert!(rules[0].tunnel);
        assert_eq!(rules[1].pattern, "direct.net");
    }

    #[test]
    fn test_load_invalid_keeps_existing() {
        let mut m = matcher(&[("example.com", true)]);
        let result = m.load(&[Rule {
            pattern: "bad..pattern".into(),
            tunnel: true,
        }]);
        assert!(result.is_err());
        assert!(m.classify("example.com").tunnel);
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("   ").is_err());
    }

    #[test]
    fn test_validate_rejects_multiple_stars() {
        assert!(validate_pattern("*.*.example.com").is_err());
    }

    #[test]
    fn test_validate_rejects_inner_star() {
        assert!(validate_pattern("api.*.example.com").is_err());
        assert!(validate_pattern("ap*i.example.com").is_err());
        assert!(validate_pattern("*example.com").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_labels() {
        assert!(validate_pattern("exa_mple.com").is_err());
        assert!(validate_pattern("-example.com").is_err());
        assert!(validate_pattern("example-.com").is_err());
        assert!(validate_pattern("example..com").is_err());
    }

    #[test]
    fn test_validate_accepts_common_forms() {
        assert!(validate_pattern("example.com").is_ok());
        assert!(validate_pattern("*.example.com").is_ok());
        assert!(validate_pattern("a-b.example-site.co.uk").is_ok());
        assert!(validate_pattern("xn--bcher-kva.example").is_ok());
        assert!(validate_pattern("localhost").is_ok());
    }

    #[test]
    fn test_invalid_add_leaves_set_untouched() {
        let mut m = matcher(&[("example.com", true)]);
        assert!(m.add("bad..name", true).is_err());
        assert_eq!(m.len(), 1);
    }
}
