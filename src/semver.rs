//! Semantic versions as used by the package registry and the runner cache.

use std::cmp::Ordering;
use std::fmt;

/// Simplified semantic version: 2-4 numeric components plus optional
/// prerelease and build tags. The numeric components dominate ordering; a
/// missing prerelease ranks above a present one; the build tag is the final
/// ordinal tie-break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticVersion {
    numbers: Vec<u64>,
    prerelease: Option<String>,
    build: Option<String>,
}

impl SemanticVersion {
    pub fn new(major: u64, minor: u64) -> Self {
        Self {
            numbers: vec![major, minor],
            prerelease: None,
            build: None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() {
            return None;
        }

        let mut rest = value;
        let mut build = None;
        if let Some(idx) = rest.rfind('+') {
            build = Some(rest[idx + 1..].to_string());
            rest = &rest[..idx];
        }

        let mut prerelease = None;
        if let Some(idx) = rest.rfind('-') {
            prerelease = Some(rest[idx + 1..].to_string());
            rest = &rest[..idx];
        }

        let numbers = rest
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<u64>>>()?;
        if !(2..=4).contains(&numbers.len()) {
            return None;
        }

        Some(Self {
            numbers,
            prerelease,
            build,
        })
    }

    pub fn major_minor(&self) -> (u64, u64) {
        (self.numbers[0], *self.numbers.get(1).unwrap_or(&0))
    }

    /// Whether `self` satisfies the major.minor pin of `pin`. Patch,
    /// prerelease, and build components are ignored here.
    pub fn pin_matches(&self, pin: &SemanticVersion) -> bool {
        self.major_minor() == pin.major_minor()
    }
}

impl Ord for SemanticVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.numbers.len().max(other.numbers.len());
        for i in 0..len {
            // A shorter version ranks below the longer one at the same prefix.
            let cmp = match (self.numbers.get(i), other.numbers.get(i)) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }

        match (&self.prerelease, &other.prerelease) {
            (None, None) => self.build.cmp(&other.build),
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b).then_with(|| self.build.cmp(&other.build)),
        }
    }
}

impl PartialOrd for SemanticVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .numbers
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{joined}")?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

/// Picks the greatest version matching the major.minor pin out of `candidates`
/// and returns its original string form.
pub fn latest_matching<'a, I>(candidates: I, pin: &SemanticVersion) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut latest: Option<(SemanticVersion, String)> = None;
    for raw in candidates {
        let Some(ver) = SemanticVersion::parse(raw) else {
            continue;
        };
        if !ver.pin_matches(pin) {
            continue;
        }
        match &latest {
            Some((best, _)) if *best > ver => {}
            _ => latest = Some((ver, raw.to_string())),
        }
    }
    latest.map(|(_, raw)| raw)
}
