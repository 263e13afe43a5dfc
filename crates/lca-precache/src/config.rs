//! Precache configuration

use std::str::FromStr;

use lca_common::Error;

/// Default number of concurrent pulls
pub const DEFAULT_CONCURRENCY: usize = 10;

/// How pull failures are handled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrecacheMode {
    /// Pull everything possible, report failures at the end
    #[default]
    BestEffort,
    /// Stop at the first failure
    Strict,
}

impl FromStr for PrecacheMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best-effort" | "besteffort" => Ok(Self::BestEffort),
            "strict" => Ok(Self::Strict),
            _ => Err(Error::validation(format!(
                "invalid precache mode: {s}, expected one of: best-effort, strict"
            ))),
        }
    }
}

impl std::fmt::Display for PrecacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BestEffort => write!(f, "best-effort"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

/// Settings for a precache run
#[derive(Clone, Debug)]
pub struct PrecacheConfig {
    /// Failure handling
    pub mode: PrecacheMode,
    /// Pulls in flight at once, at least 1
    pub concurrency: usize,
}

impl Default for PrecacheConfig {
    fn default() -> Self {
        Self {
            mode: PrecacheMode::BestEffort,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl PrecacheConfig {
    /// Config with the given mode and default concurrency
    pub fn with_mode(mode: PrecacheMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_and_displays() {
        assert_eq!("strict".parse::<PrecacheMode>().expect("strict"), PrecacheMode::Strict);
        assert_eq!(
            "Best-Effort".parse::<PrecacheMode>().expect("best effort"),
            PrecacheMode::BestEffort
        );
        assert!("sometimes".parse::<PrecacheMode>().is_err());
        assert_eq!(PrecacheMode::BestEffort.to_string(), "best-effort");
    }
}
