// src/version.rs

//! Version constraints
//!
//! Versions are plain semantic versions. A constraint is either `Any` or a
//! `semver::VersionReq`; comma-separated requirements are conjunctive, so a
//! single edge can say `>=1.2, <2`.

use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A predicate over the versions of a package or capability
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VersionConstraint {
    /// Every version matches
    #[default]
    Any,
    /// Versions matching a semver requirement
    Req(VersionReq),
}

impl VersionConstraint {
    /// Constraint matching exactly one version
    pub fn exact(version: &Version) -> Self {
        // `=x.y.z-pre` parses back into an exact comparator
        VersionConstraint::Req(
            VersionReq::parse(&format!("={}", version)).unwrap_or(VersionReq::STAR),
        )
    }

    /// Check whether a version satisfies this constraint
    ///
    /// Pre-release versions only match requirements that name them, which
    /// follows semver's own matching rules.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Req(req) => req.matches(version),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, VersionConstraint::Any)
    }
}

impl FromStr for VersionConstraint {
    type Err = semver::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "" | "*" | "any" => Ok(VersionConstraint::Any),
            _ => Ok(VersionConstraint::Req(VersionReq::parse(trimmed)?)),
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => f.write_str("*"),
            VersionConstraint::Req(req) => write!(f, "{}", req),
        }
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_any_matches_everything() {
        for spelling in ["", "*", "any", "  any "] {
            let c: VersionConstraint = spelling.parse().unwrap();
            assert!(c.is_any());
            assert!(c.matches(&v("0.0.1")));
            assert!(c.matches(&v("99.0.0")));
        }
    }

    #[test]
    fn test_lower_bound() {
        let c: VersionConstraint = ">=2.0".parse().unwrap();
        assert!(c.matches(&v("2.3.0")));
        assert!(c.matches(&v("2.0.0")));
        assert!(!c.matches(&v("1.9.0")));
    }

    #[test]
    fn test_conjunction() {
        let c: VersionConstraint = ">=1.2, <2".parse().unwrap();
        assert!(c.matches(&v("1.5.0")));
        assert!(!c.matches(&v("2.0.0")));
        assert!(!c.matches(&v("1.1.9")));
    }

    #[test]
    fn test_exact() {
        let c = VersionConstraint::exact(&v("1.0.0"));
        assert!(c.matches(&v("1.0.0")));
        assert!(!c.matches(&v("1.0.1")));
        assert_eq!(c.to_string(), "=1.0.0");
    }

    #[test]
    fn test_bare_version_is_caret() {
        let c: VersionConstraint = "1.0.0".parse().unwrap();
        assert!(c.matches(&v("1.4.0")));
        assert!(!c.matches(&v("2.0.0")));
    }

    #[test]
    fn test_invalid_constraint() {
        assert!("<(^v^)>".parse::<VersionConstraint>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let c: VersionConstraint = ">=2.0".parse().unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\">=2.0\"");
        let back: VersionConstraint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
