//! Test declarations: commands to run against a built artifact and the
//! expectations on their output and on files in the result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    pub name: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<TestStep>,
    /// Absolute path in the result → expectation.
    #[serde(default)]
    pub files: BTreeMap<String, FileCheck>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TestStep {
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stdout: Option<OutputCheck>,
    #[serde(default)]
    pub stderr: Option<OutputCheck>,
}

/// Expectations on a block of text. All set fields must hold.
// No deny_unknown_fields here or on FileCheck: serde cannot combine it with flatten.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct OutputCheck {
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub contains: Vec<String>,
    #[serde(default)]
    pub starts_with: Option<String>,
    #[serde(default)]
    pub ends_with: Option<String>,
    #[serde(default)]
    pub empty: bool,
}

impl OutputCheck {
    /// Return one message per violated expectation.
    pub fn check(&self, actual: &str) -> Vec<String> {
        let mut failures = Vec::new();

        if let Some(expected) = &self.equals {
            if actual != expected {
                failures.push(format!("expected {expected:?}, got {actual:?}"));
            }
        }
        for needle in &self.contains {
            if !actual.contains(needle.as_str()) {
                failures.push(format!("expected to contain {needle:?}, got {actual:?}"));
            }
        }
        if let Some(prefix) = &self.starts_with {
            if !actual.starts_with(prefix.as_str()) {
                failures.push(format!("expected to start with {prefix:?}, got {actual:?}"));
            }
        }
        if let Some(suffix) = &self.ends_with {
            if !actual.ends_with(suffix.as_str()) {
                failures.push(format!("expected to end with {suffix:?}, got {actual:?}"));
            }
        }
        if self.empty && !actual.is_empty() {
            failures.push(format!("expected empty output, got {actual:?}"));
        }

        failures
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileCheck {
    #[serde(flatten)]
    pub content: OutputCheck,
    #[serde(default)]
    pub not_exist: bool,
    #[serde(default)]
    pub is_dir: bool,
    /// Expected permission bits, e.g. `0o755`.
    #[serde(default)]
    pub permissions: Option<u32>,
}

impl FileCheck {
    pub fn checks_content(&self) -> bool {
        self.content != OutputCheck::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_check_accepts_anything() {
        assert!(OutputCheck::default().check("whatever").is_empty());
    }

    #[test]
    fn collects_every_failure() {
        let check = OutputCheck {
            equals: Some("a".to_owned()),
            contains: vec!["b".to_owned(), "c".to_owned()],
            starts_with: Some("x".to_owned()),
            ends_with: None,
            empty: true,
        };
        assert_eq!(check.check("c").len(), 4);
    }

    #[test]
    fn contains_and_affixes() {
        let check = OutputCheck {
            contains: vec!["1.0".to_owned()],
            starts_with: Some("foo".to_owned()),
            ends_with: Some("\n".to_owned()),
            ..OutputCheck::default()
        };
        assert!(check.check("foo version 1.0\n").is_empty());
        assert_eq!(check.check("bar version 2.0").len(), 3);
    }

    #[test]
    fn file_check_flattens_content_fields() {
        let check: FileCheck = toml::from_str(
            r#"
contains = ["hello"]
permissions = 0o644
"#,
        )
        .unwrap();
        assert_eq!(check.content.contains, vec!["hello"]);
        assert_eq!(check.permissions, Some(0o644));
        assert!(check.checks_content());
        assert!(!FileCheck::default().checks_content());
    }
}
