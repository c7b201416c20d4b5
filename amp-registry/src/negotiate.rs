//! Semantic-version constraints and version negotiation.
//!
//! Constraints use the npm-style grammar common on the mesh:
//! space-separated comparators (`>=1.0.0 <2.0.0`), `||` alternatives,
//! hyphen ranges (`1.0.0 - 1.4.0`), and `*`. A bare full version is an exact
//! match; partial versions (`1.2`, `1.x`) are ranges.

use std::fmt;
use std::str::FromStr;

use amp_primitives::semver::{Version, VersionReq};

use crate::{RegistryError, RegistryResult};

/// Parsed version constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionConstraint {
    source: String,
    alternatives: Vec<VersionReq>,
}

impl VersionConstraint {
    /// Constraint matching every version.
    #[must_use]
    pub fn any() -> Self {
        Self {
            source: "*".to_owned(),
            alternatives: vec![VersionReq::STAR],
        }
    }

    /// Parses a constraint.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidConstraint`] when a comparator does not parse.
    pub fn parse(input: &str) -> RegistryResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::any());
        }

        let alternatives = trimmed
            .split("||")
            .map(|alternative| {
                let normalized = normalize(alternative);
                VersionReq::parse(&normalized).map_err(|err| RegistryError::InvalidConstraint {
                    constraint: input.to_owned(),
                    reason: err.to_string(),
                })
            })
            .collect::<RegistryResult<Vec<_>>>()?;

        Ok(Self {
            source: trimmed.to_owned(),
            alternatives,
        })
    }

    /// Whether `version` satisfies any alternative.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

impl Default for VersionConstraint {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for VersionConstraint {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Rewrites one `||` alternative into the comma-separated form `semver` parses.
fn normalize(alternative: &str) -> String {
    let tokens: Vec<&str> = alternative.split_whitespace().collect();

    if let [low, "-", high] = tokens.as_slice() {
        return format!(">={low}, <={high}");
    }

    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in tokens {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            pending_op = Some(token);
            continue;
        }
        let comparator = match pending_op.take() {
            Some(op) => format!("{op}{token}"),
            None if Version::parse(token).is_ok() => format!("={token}"),
            None => token.to_owned(),
        };
        comparators.push(comparator);
    }
    if comparators.is_empty() {
        return "*".to_owned();
    }
    comparators.join(", ")
}

/// Picks the version to run among `available`.
///
/// `preferred` wins when it is registered and satisfies the constraint;
/// otherwise the highest satisfying version is chosen.
pub fn negotiate<'a, I>(
    available: I,
    constraint: &VersionConstraint,
    preferred: Option<&Version>,
) -> Option<&'a Version>
where
    I: IntoIterator<Item = &'a Version>,
{
    let mut best: Option<&'a Version> = None;
    for version in available {
        if !constraint.matches(version) {
            continue;
        }
        if preferred == Some(version) {
            return Some(version);
        }
        if best.is_none_or(|current| version > current) {
            best = Some(version);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(list: &[&str]) -> Vec<Version> {
        list.iter().map(|v| Version::parse(v).unwrap()).collect()
    }

    #[test]
    fn highest_satisfying_version_wins() {
        let available = versions(&["1.0.0", "1.2.0", "2.0.0"]);
        let constraint = VersionConstraint::parse(">=1.0.0 <2.0.0").unwrap();
        let chosen = negotiate(&available, &constraint, None).unwrap();
        assert_eq!(chosen.to_string(), "1.2.0");
    }

    #[test]
    fn preferred_version_when_satisfying() {
        let available = versions(&["1.0.0", "1.2.0", "2.0.0"]);
        let constraint = VersionConstraint::parse(">=1.0.0 <2.0.0").unwrap();

        let preferred = Version::parse("1.0.0").unwrap();
        let chosen = negotiate(&available, &constraint, Some(&preferred)).unwrap();
        assert_eq!(chosen, &preferred);

        let outside = Version::parse("2.0.0").unwrap();
        let chosen = negotiate(&available, &constraint, Some(&outside)).unwrap();
        assert_eq!(chosen.to_string(), "1.2.0");
    }

    #[test]
    fn grammar_variants() {
        let v = |s: &str| Version::parse(s).unwrap();
        let exact = VersionConstraint::parse("1.2.0").unwrap();
        assert!(exact.matches(&v("1.2.0")));
        assert!(!exact.matches(&v("1.2.1")));

        let spaced = VersionConstraint::parse(">= 1.0.0 < 1.5.0").unwrap();
        assert!(spaced.matches(&v("1.4.9")));
        assert!(!spaced.matches(&v("1.5.0")));

        let hyphen = VersionConstraint::parse("1.0.0 - 1.4.0").unwrap();
        assert!(hyphen.matches(&v("1.4.0")));
        assert!(!hyphen.matches(&v("1.4.1")));

        let either = VersionConstraint::parse("^1.2 || >=3.0.0").unwrap();
        assert!(either.matches(&v("1.9.0")));
        assert!(either.matches(&v("3.1.0")));
        assert!(!either.matches(&v("2.0.0")));

        assert!(VersionConstraint::parse("").unwrap().matches(&v("9.9.9")));
        assert!(VersionConstraint::parse(">=banana").is_err());
    }

    #[test]
    fn nothing_matches() {
        let available = versions(&["2.0.0"]);
        let constraint = VersionConstraint::parse("<2.0.0").unwrap();
        assert!(negotiate(&available, &constraint, None).is_none());
    }
}
