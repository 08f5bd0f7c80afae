use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;

/// Destination stores tracked on the copy-status document.
///
/// Each variant owns exactly one status field (`statusDEX`, `statusEDAV`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Dex,
    Edav,
}

impl Destination {
    pub const ALL: [Destination; 2] = [Destination::Dex, Destination::Edav];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Dex => "dex",
            Destination::Edav => "edav",
        }
    }

    /// Stage name recorded on copy spans, e.g. `edav-copy`
    pub fn copy_stage(&self) -> String {
        format!("{}-copy", self.as_str())
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dex" => Ok(Destination::Dex),
            "edav" => Ok(Destination::Edav),
            _ => Err(anyhow::anyhow!("Invalid destination: {}", s)),
        }
    }
}

/// Per-destination copy outcome.
///
/// Statuses form a join-semilattice ordered by [`CopyStatus::rank`]:
/// `unknown < in_progress < failure < success`. Merging two statuses keeps the
/// greater one, so any delivery order of the same message set converges.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
pub enum CopyStatus {
    #[default]
    Unknown,
    InProgress,
    Failure,
    Success,
}

impl CopyStatus {
    pub fn rank(&self) -> u8 {
        match self {
            CopyStatus::Unknown => 0,
            CopyStatus::InProgress => 1,
            CopyStatus::Failure => 2,
            CopyStatus::Success => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CopyStatus::Failure | CopyStatus::Success)
    }

    /// Least upper bound of two statuses.
    pub fn join(self, other: CopyStatus) -> CopyStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    /// Whether applying `incoming` on top of `self` is allowed (not a regression).
    pub fn accepts(&self, incoming: CopyStatus) -> bool {
        incoming.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Unknown => "unknown",
            CopyStatus::InProgress => "in_progress",
            CopyStatus::Failure => "failure",
            CopyStatus::Success => "success",
        }
    }
}

impl PartialOrd for CopyStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CopyStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl Display for CopyStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for CopyStatus {
    type Err = anyhow::Error;

    /// Case-insensitive; an empty value is the `unknown` status.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "unknown" => Ok(CopyStatus::Unknown),
            "in_progress" | "inprogress" | "in-progress" => Ok(CopyStatus::InProgress),
            "failure" | "failed" => Ok(CopyStatus::Failure),
            "success" | "succeeded" => Ok(CopyStatus::Success),
            _ => Err(anyhow::anyhow!("Invalid copy status: {}", s)),
        }
    }
}

impl TryFrom<String> for CopyStatus {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CopyStatus> for String {
    fn from(status: CopyStatus) -> Self {
        status.as_str().to_string()
    }
}
