//! Three-component release version handling.
//!
//! The release workflow only ever moves the patch component forward, so the
//! type exposes exactly that operation. Parsing is strict: three dot-separated
//! decimal components, nothing else.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error, Result};

/// A `major.minor.patch` version as stored in the version file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The next patch release. Retries within one release attempt call this
    /// repeatedly, which is what keeps published versions strictly increasing.
    pub fn next_patch(self) -> Self {
        Self {
            patch: self.patch + 1,
            ..self
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.');
        let mut component = |name: &str| -> Result<u64> {
            let raw = parts
                .next()
                .ok_or_else(|| anyhow!("version '{s}' missing {name} component"))?;
            raw.parse::<u64>()
                .map_err(|_| anyhow!("version '{s}' has non-numeric {name} component"))
        };
        let major = component("major")?;
        let minor = component("minor")?;
        let patch = component("patch")?;
        if parts.next().is_some() {
            return Err(anyhow!("version '{s}' has more than three components"));
        }
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let v: Version = "1.0.127".parse().expect("parse");
        assert_eq!(v, Version::new(1, 0, 127));
        assert_eq!(v.to_string(), "1.0.127");
    }

    #[test]
    fn next_patch_increments_only_patch() {
        let v = Version::new(2, 3, 4).next_patch();
        assert_eq!(v, Version::new(2, 3, 5));
    }

    #[test]
    fn rejects_malformed_versions() {
        assert!("1.2".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("1.2.x".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }

    #[test]
    fn ordering_follows_components() {
        let a: Version = "1.0.9".parse().expect("parse");
        let b: Version = "1.0.10".parse().expect("parse");
        assert!(a < b);
    }
}
