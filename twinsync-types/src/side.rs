use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One side of the synchronized pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaSide {
    /// The local filesystem.
    Local,
    /// The remote drive.
    Remote,
}

impl ReplicaSide {
    /// Both sides, local first.
    pub const ALL: [ReplicaSide; 2] = [ReplicaSide::Local, ReplicaSide::Remote];

    /// Returns the opposite side.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ReplicaSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaSide {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(crate::Error::InvalidSide(other.to_string())),
        }
    }
}
