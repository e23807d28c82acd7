//! Debian version ordering and dependency relations.
//!
//! Versions follow the `[epoch:]upstream[-revision]` layout and compare with the
//! dpkg algorithm: non-digit runs compare character-wise with `~` sorting before
//! everything (even the end of the string) and letters before other symbols,
//! digit runs compare numerically.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("version must not be empty")]
    Empty,
    #[error("invalid epoch in '{0}'")]
    InvalidEpoch(String),
    #[error("invalid character '{ch}' in version '{version}'")]
    InvalidChar { version: String, ch: char },
    #[error("missing version after relation in '{0}'")]
    MissingVersion(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DebVersion {
    epoch: u32,
    upstream: String,
    revision: String,
}

impl DebVersion {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(VersionError::Empty);
        }

        let (epoch, rest) = match input.split_once(':') {
            Some((e, rest)) => {
                let epoch = e
                    .parse::<u32>()
                    .map_err(|_| VersionError::InvalidEpoch(input.to_owned()))?;
                (epoch, rest)
            }
            None => (0, input),
        };

        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((u, r)) => (u, r),
            None => (rest, ""),
        };
        if upstream.is_empty() {
            return Err(VersionError::Empty);
        }

        for ch in rest.chars() {
            if !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '+' | '~' | '-' | ':')) {
                return Err(VersionError::InvalidChar {
                    version: input.to_owned(),
                    ch,
                });
            }
        }

        Ok(Self {
            epoch,
            upstream: upstream.to_owned(),
            revision: revision.to_owned(),
        })
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }
}

impl FromStr for DebVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DebVersion {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DebVersion> for String {
    fn from(value: DebVersion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DebVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        f.write_str(&self.upstream)?;
        if !self.revision.is_empty() {
            write!(f, "-{}", self.revision)?;
        }
        Ok(())
    }
}

impl Ord for DebVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_fragment(&self.upstream, &other.upstream))
            .then_with(|| compare_fragment(&self.revision, &other.revision))
    }
}

impl PartialOrd for DebVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// "1.0" and "1.00" are the same version to dpkg.
impl PartialEq for DebVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DebVersion {}

fn char_order(c: Option<&u8>) -> i32 {
    match c {
        None => 0,
        Some(b'~') => -1,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => i32::from(*c),
        Some(c) => i32::from(*c) + 256,
    }
}

fn compare_fragment(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let ac = char_order(a.get(i));
            let bc = char_order(b.get(j));
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }

        let mut first_diff = Ordering::Equal;
        while i < a.len() && a[i].is_ascii_digit() && j < b.len() && b[j].is_ascii_digit() {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }

        if i < a.len() && a[i].is_ascii_digit() {
            return Ordering::Greater;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

/// Debian dependency relation operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    /// `<<`
    Earlier,
    /// `<=`
    EarlierOrEqual,
    /// `=`
    Exactly,
    /// `>=`
    LaterOrEqual,
    /// `>>`
    Later,
}

impl Relation {
    pub fn symbol(self) -> &'static str {
        match self {
            Relation::Earlier => "<<",
            Relation::EarlierOrEqual => "<=",
            Relation::Exactly => "=",
            Relation::LaterOrEqual => ">=",
            Relation::Later => ">>",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            Relation::Earlier => ord == Ordering::Less,
            Relation::EarlierOrEqual => ord != Ordering::Greater,
            Relation::Exactly => ord == Ordering::Equal,
            Relation::LaterOrEqual => ord != Ordering::Less,
            Relation::Later => ord == Ordering::Greater,
        }
    }
}

/// A single `<relation> <version>` expression, e.g. `>= 2.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConstraint {
    pub relation: Relation,
    pub version: DebVersion,
}

impl VersionConstraint {
    pub fn new(relation: Relation, version: DebVersion) -> Self {
        Self { relation, version }
    }

    pub fn satisfied_by(&self, candidate: &DebVersion) -> bool {
        self.relation.accepts(candidate.cmp(&self.version))
    }
}

impl FromStr for VersionConstraint {
    type Err = VersionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }

        // Longest operators first so "<=" is not read as "<".
        const OPERATORS: [(&str, Relation); 7] = [
            ("<<", Relation::Earlier),
            ("<=", Relation::EarlierOrEqual),
            (">>", Relation::Later),
            (">=", Relation::LaterOrEqual),
            ("=", Relation::Exactly),
            ("<", Relation::Earlier),
            (">", Relation::Later),
        ];

        let (relation, rest) = OPERATORS
            .iter()
            .find_map(|(op, rel)| trimmed.strip_prefix(op).map(|rest| (*rel, rest)))
            .unwrap_or((Relation::Exactly, trimmed));

        if rest.trim().is_empty() {
            return Err(VersionError::MissingVersion(trimmed.to_owned()));
        }

        Ok(Self {
            relation,
            version: DebVersion::parse(rest)?,
        })
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.relation.symbol(), self.version)
    }
}
