//! Data-driven failure classification.
//!
//! Whether a failure is worth retrying is better expressed as configuration
//! than as code: dependency error messages change more often than the engine
//! is redeployed. The classifier is an ordered rule table mapping error text
//! (optionally scoped to a task kind) to an [`ErrorClass`]; the first
//! matching rule wins. Rule tables can be built in code or loaded from a
//! YAML file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a reported task failure.
///
/// This is a closed set: every failure the engine sees falls into exactly
/// one of these classes, and retry behavior is decided from the class alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or dependency blip; retry with backoff.
    Transient,
    /// Upstream throttling; retry, honoring a caller-supplied retry-after
    /// hint over computed backoff.
    RateLimited,
    /// Caller logic or input error; retrying cannot help.
    Permanent,
    /// Nothing matched. Retried like Transient but against a small fixed
    /// budget, and logged so the rule table can be extended.
    Unknown,
}

impl ErrorClass {
    /// Stable lowercase name, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while building or loading a classifier.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Rule {index} has an empty pattern")]
    EmptyPattern { index: usize },
}

/// A single classification rule.
///
/// `pattern` is matched case-insensitively as a substring of the error text.
/// A rule with a `kind` only applies to failures of tasks of that kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRule {
    /// Substring to look for in the error text (case-insensitive).
    pub pattern: String,
    /// Restrict the rule to one task kind; absent means every kind.
    #[serde(default)]
    pub kind: Option<String>,
    /// Class assigned when the rule matches.
    pub class: ErrorClass,
}

impl ClassifierRule {
    /// Creates a rule applying to every task kind.
    pub fn new(pattern: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            pattern: pattern.into(),
            kind: None,
            class,
        }
    }

    /// Restricts the rule to a single task kind.
    pub fn for_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    fn matches(&self, kind: &str, error_lower: &str) -> bool {
        if let Some(ref rule_kind) = self.kind {
            if rule_kind != kind {
                return false;
            }
        }
        error_lower.contains(&self.pattern.to_lowercase())
    }
}

/// On-disk rule table format.
#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    default_class: Option<ErrorClass>,
    rules: Vec<ClassifierRule>,
}

/// Ordered rule table mapping failure descriptors to error classes.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassifierRule>,
    default_class: ErrorClass,
}

impl ErrorClassifier {
    /// Creates a classifier from an explicit rule table.
    ///
    /// # Errors
    ///
    /// Returns `ClassifierError::EmptyPattern` if any rule has an empty
    /// pattern, since such a rule would match everything.
    pub fn new(
        rules: Vec<ClassifierRule>,
        default_class: ErrorClass,
    ) -> Result<Self, ClassifierError> {
        for (index, rule) in rules.iter().enumerate() {
            if rule.pattern.trim().is_empty() {
                return Err(ClassifierError::EmptyPattern { index });
            }
        }
        Ok(Self {
            rules,
            default_class,
        })
    }

    /// Creates a classifier with a conservative built-in rule table.
    ///
    /// The built-in rules cover the error shapes common to network-facing
    /// handlers; deployments are expected to replace them with a loaded
    /// table once real failure text is known.
    pub fn with_default_rules() -> Self {
        let rules = vec![
            ClassifierRule::new("rate limit", ErrorClass::RateLimited),
            ClassifierRule::new("too many requests", ErrorClass::RateLimited),
            ClassifierRule::new("429", ErrorClass::RateLimited),
            ClassifierRule::new("timeout", ErrorClass::Transient),
            ClassifierRule::new("timed out", ErrorClass::Transient),
            ClassifierRule::new("connection", ErrorClass::Transient),
            ClassifierRule::new("unavailable", ErrorClass::Transient),
            ClassifierRule::new("temporarily", ErrorClass::Transient),
            ClassifierRule::new("invalid", ErrorClass::Permanent),
            ClassifierRule::new("malformed", ErrorClass::Permanent),
            ClassifierRule::new("not found", ErrorClass::Permanent),
            ClassifierRule::new("unsupported", ErrorClass::Permanent),
        ];
        Self {
            rules,
            default_class: ErrorClass::Unknown,
        }
    }

    /// Loads a rule table from a YAML string.
    ///
    /// # Format
    ///
    /// ```yaml
    /// default_class: unknown
    /// rules:
    ///   - pattern: "connection refused"
    ///     class: transient
    ///   - pattern: "quota exceeded"
    ///     kind: "export"
    ///     class: rate_limited
    /// ```
    pub fn from_yaml_str(contents: &str) -> Result<Self, ClassifierError> {
        let file: RuleFile = serde_yaml::from_str(contents)?;
        Self::new(
            file.rules,
            file.default_class.unwrap_or(ErrorClass::Unknown),
        )
    }

    /// Loads a rule table from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Classifies a failure. First matching rule wins; falls back to the
    /// configured default class.
    pub fn classify(&self, kind: &str, error: &str) -> ErrorClass {
        let error_lower = error.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(kind, &error_lower))
            .map(|rule| rule.class)
            .unwrap_or(self.default_class)
    }

    /// Number of rules in the table.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn first_matching_rule_wins() {
        let classifier = ErrorClassifier::new(
            vec![
                ClassifierRule::new("connection", ErrorClass::Transient),
                ClassifierRule::new("connection refused", ErrorClass::Permanent),
            ],
            ErrorClass::Unknown,
        )
        .expect("valid rules");

        // Both rules match; the first one in the table decides.
        assert_eq!(
            classifier.classify("send_email", "connection refused by peer"),
            ErrorClass::Transient
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let classifier = ErrorClassifier::with_default_rules();
        assert_eq!(
            classifier.classify("send_email", "Connection Reset By Peer"),
            ErrorClass::Transient
        );
        assert_eq!(
            classifier.classify("send_email", "HTTP 429 Too Many Requests"),
            ErrorClass::RateLimited
        );
    }

    #[test]
    fn kind_scoped_rule_ignores_other_kinds() {
        let classifier = ErrorClassifier::new(
            vec![ClassifierRule::new("quota", ErrorClass::RateLimited).for_kind("export")],
            ErrorClass::Unknown,
        )
        .expect("valid rules");

        assert_eq!(
            classifier.classify("export", "quota exceeded"),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classifier.classify("import", "quota exceeded"),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn unmatched_error_gets_default_class() {
        let classifier = ErrorClassifier::with_default_rules();
        assert_eq!(
            classifier.classify("send_email", "segfault in handler"),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let result = ErrorClassifier::new(
            vec![ClassifierRule::new("  ", ErrorClass::Transient)],
            ErrorClass::Unknown,
        );
        assert!(matches!(
            result,
            Err(ClassifierError::EmptyPattern { index: 0 })
        ));
    }

    #[test]
    fn loads_rules_from_yaml() {
        let yaml = r#"
default_class: permanent
rules:
  - pattern: "deadlock"
    class: transient
  - pattern: "quota exceeded"
    kind: "export"
    class: rate_limited
"#;
        let classifier = ErrorClassifier::from_yaml_str(yaml).expect("valid yaml");
        assert_eq!(classifier.len(), 2);
        assert_eq!(
            classifier.classify("sync", "deadlock detected"),
            ErrorClass::Transient
        );
        assert_eq!(
            classifier.classify("sync", "something else"),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn loads_rules_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "rules:\n  - pattern: \"disk full\"\n    class: transient"
        )
        .expect("write rules");

        let classifier = ErrorClassifier::from_yaml_file(file.path()).expect("load rules");
        assert_eq!(
            classifier.classify("compact", "disk full on /var"),
            ErrorClass::Transient
        );
    }

    #[test]
    fn error_class_serde_names_are_snake_case() {
        let yaml = serde_yaml::to_string(&ErrorClass::RateLimited).expect("serialize");
        assert_eq!(yaml.trim(), "rate_limited");
    }
}
