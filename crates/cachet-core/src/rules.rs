//! Caching rules.
//!
//! A ruleset is an ordered list of rules evaluated with first-match
//! semantics: the first rule whose base-URI prefix, method and status all
//! match decides, and later rules are never consulted. The mode then maps
//! the match to the caching decision - in include mode only matched
//! requests are cached, in exclude mode everything but matched requests.

use serde::{Deserialize, Serialize};

/// How a matched rule translates into the caching decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    /// Cache only requests matched by a rule.
    #[serde(alias = "whitelist")]
    Include,
    /// Cache everything except requests matched by a rule.
    #[default]
    #[serde(alias = "blacklist")]
    Exclude,
}

impl RuleMode {
    /// Returns the mode as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Include => "include",
            Self::Exclude => "exclude",
        }
    }
}

impl std::fmt::Display for RuleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single caching rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheRule {
    /// The rule matches requests whose absolute URL starts with this
    /// string. This is a plain prefix match over the URL's string form,
    /// not a structured URI comparison.
    pub base_uri: String,
    /// Method names, compared case-insensitively.
    pub methods: Vec<String>,
    /// Status patterns: a three-digit code like `"200"` or a class like
    /// `"4xx"`. Empty means any status.
    pub status_codes: Vec<String>,
}

impl CacheRule {
    /// Creates a rule matching the given base URI and methods, any status.
    pub fn new(base_uri: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            base_uri: base_uri.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            status_codes: Vec::new(),
        }
    }

    /// Adds status patterns to the rule.
    pub fn with_status_codes(mut self, patterns: &[&str]) -> Self {
        self.status_codes = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Checks whether this rule matches the given request and, when
    /// present, response status.
    ///
    /// A rule with status patterns never matches before a response exists,
    /// which restricts status-predicated rules to the post-response
    /// caching decision.
    fn matches(&self, url: &str, method: &str, status: Option<u16>) -> bool {
        if !url.starts_with(&self.base_uri) {
            return false;
        }

        if !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return false;
        }

        if !self.status_codes.is_empty() {
            let Some(status) = status else {
                return false;
            };
            if !self.status_codes.iter().any(|p| status_matches(status, p)) {
                return false;
            }
        }

        true
    }
}

/// An ordered list of rules plus the evaluation mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub mode: RuleMode,
    pub rules: Vec<CacheRule>,
}

impl RuleSet {
    /// Creates a ruleset with the given mode and rules.
    pub fn new(mode: RuleMode, rules: Vec<CacheRule>) -> Self {
        Self { mode, rules }
    }

    /// Decides whether the request/response pair should be cached.
    ///
    /// `status` is `None` for pre-response evaluation. First match wins.
    pub fn should_cache(&self, url: &str, method: &str, status: Option<u16>) -> bool {
        let matched = self.rules.iter().any(|r| r.matches(url, method, status));
        match self.mode {
            RuleMode::Include => matched,
            RuleMode::Exclude => !matched,
        }
    }
}

/// Checks a numeric status code against a pattern: either an exact
/// three-digit code (`"200"`) or a class pattern (`"4xx"`).
pub fn status_matches(status: u16, pattern: &str) -> bool {
    let status_str = status.to_string();
    if pattern == status_str {
        return true;
    }

    if pattern.len() == 3 && pattern.ends_with("xx") {
        let class = pattern.as_bytes()[0];
        return class.is_ascii_digit() && status_str.as_bytes().first() == Some(&class);
    }

    false
}
