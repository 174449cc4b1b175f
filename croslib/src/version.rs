use std::{
    cmp::Ordering,
    fmt,
    str::FromStr,
};

use thiserror::Error;

const MAX_COMPONENTS: usize = 4;

/// A dotted ChromeOS platform version, such as `15474.84.0`. Versions compare
/// numerically, component by component, with missing trailing components
/// treated as 0.
#[derive(Clone, Debug)]
pub struct OsVersion {
    components: Vec<u32>,
}

impl OsVersion {
    pub fn new(components: &[u32]) -> Self {
        Self {
            components: components.to_vec(),
        }
    }

    /// The major (build branch) number, eg. `15474` in `15474.84.0`.
    pub fn major(&self) -> u32 {
        self.components.first().copied().unwrap_or(0)
    }

    fn component(&self, i: usize) -> u32 {
        self.components.get(i).copied().unwrap_or(0)
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{c}")?;
        }

        Ok(())
    }
}

impl FromStr for OsVersion {
    type Err = ParseOsVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseOsVersionError::Empty);
        }

        let components = s.split('.')
            .map(|p| p.parse::<u32>()
                .map_err(|_| ParseOsVersionError::InvalidComponent(p.to_owned())))
            .collect::<Result<Vec<_>, _>>()?;

        if components.len() > MAX_COMPONENTS {
            return Err(ParseOsVersionError::TooManyComponents);
        }

        Ok(Self { components })
    }
}

impl PartialEq for OsVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OsVersion {}

impl PartialOrd for OsVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OsVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let n = self.components.len().max(other.components.len());

        (0..n).map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

#[derive(Debug, Error)]
pub enum ParseOsVersionError {
    #[error("Version string is empty")]
    Empty,
    #[error("Invalid version component: {0:?}")]
    InvalidComponent(String),
    #[error("Too many components (>4) in version string")]
    TooManyComponents,
}
