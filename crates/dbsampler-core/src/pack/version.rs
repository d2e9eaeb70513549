//! Database version numbers and supported-version ranges.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Dotted numeric version, e.g. `14.5` or `19.3.0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "VersionRepr", into = "String")]
pub struct Version(Vec<u32>);

impl Version {
    pub fn new(parts: Vec<u32>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[u32] {
        &self.0
    }

    /// Extracts the first dotted number from a server version banner.
    ///
    /// `"PostgreSQL 16.2 (Debian 16.2-1) on x86_64"` gives `16.2`,
    /// `"Oracle Database 19c Release 19.0.0.0.0"` gives `19`.
    pub fn parse(banner: &str) -> Option<Self> {
        let start = banner.find(|c: char| c.is_ascii_digit())?;
        let rest = &banner[start..];
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let parts: Vec<u32> = rest[..end]
            .split('.')
            .take_while(|p| !p.is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts))
    }

    /// Compares with missing components read as zero (`14` == `14.0`).
    fn cmp_padded(&self, other: &[u32]) -> Ordering {
        let len = self.0.len().max(other.len());
        for idx in 0..len {
            let a = self.0.get(idx).copied().unwrap_or(0);
            let b = other.get(idx).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionRepr {
    Text(String),
    Number(f64),
}

impl TryFrom<VersionRepr> for Version {
    type Error = String;

    fn try_from(repr: VersionRepr) -> Result<Self, Self::Error> {
        let text = match repr {
            VersionRepr::Text(s) => s,
            VersionRepr::Number(n) => n.to_string(),
        };
        Version::parse(&text).ok_or_else(|| format!("invalid version '{text}'"))
    }
}

/// Inclusive range of supported server versions. Missing bounds are open.
///
/// The upper bound is compared at the precision it is written with, so
/// `max = 16` admits `16.4`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Version>,
}

impl VersionRange {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn between(min: Option<Version>, max: Option<Version>) -> Self {
        Self { min, max }
    }

    /// True when neither bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, version: &Version) -> bool {
        if let Some(min) = &self.min {
            if version.cmp_padded(min.parts()) == Ordering::Less {
                return false;
            }
        }
        if let Some(max) = &self.max {
            let precision = max.parts().len().min(version.parts().len());
            let truncated = Version(version.parts()[..precision].to_vec());
            if truncated.cmp_padded(max.parts()) == Ordering::Greater {
                return false;
            }
        }
        true
    }

    /// Whether `min` does not exceed `max`.
    pub(crate) fn is_ordered(&self) -> bool {
        match (&self.min, &self.max) {
            (Some(min), Some(max)) => min.cmp_padded(max.parts()) != Ordering::Greater,
            _ => true,
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.min, &self.max) {
            (None, None) => write!(f, "any"),
            (Some(min), None) => write!(f, ">= {min}"),
            (None, Some(max)) => write!(f, "<= {max}"),
            (Some(min), Some(max)) => write!(f, "{min} - {max}"),
        }
    }
}
