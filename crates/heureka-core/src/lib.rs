use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RunId = i64;
pub type ServiceId = i64;
pub type ComponentId = i64;
pub type ComponentVersionId = i64;
pub type ComponentInstanceId = i64;
pub type IssueId = i64;
pub type IssueMatchId = i64;
pub type UserId = i64;

/// Wall-clock unix milliseconds, the unit of every stored timestamp.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueMatchStatus {
    #[default]
    New,
    RiskAccepted,
    FalsePositive,
    Mitigated,
}

impl IssueMatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::RiskAccepted => "risk_accepted",
            Self::FalsePositive => "false_positive",
            Self::Mitigated => "mitigated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid issue match status '{0}', expected one of: new, risk_accepted, false_positive, mitigated")]
pub struct InvalidStatus(pub String);

impl std::str::FromStr for IssueMatchStatus {
    type Err = InvalidStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "new" => Ok(Self::New),
            "risk_accepted" => Ok(Self::RiskAccepted),
            "false_positive" => Ok(Self::FalsePositive),
            "mitigated" => Ok(Self::Mitigated),
            other => Err(InvalidStatus(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOperation {
    Autopatch,
    Autoclose,
}

impl ReconcileOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Autopatch => "autopatch",
            Self::Autoclose => "autoclose",
        }
    }
}

impl std::fmt::Display for ReconcileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two newest completed runs of a tag. Older runs never take part in a
/// reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Generations {
    pub latest: RunId,
    pub second_latest: RunId,
}

impl Generations {
    /// Picks generation 0 and 1 from a newest-first run list.
    pub fn from_newest_first(runs: &[RunId]) -> Option<Self> {
        match runs {
            [latest, second_latest, ..] => Some(Self {
                latest: *latest,
                second_latest: *second_latest,
            }),
            _ => None,
        }
    }
}

/// Reduces `tag -> newest-first runs` to the tags that can produce a
/// disappearance at all.
pub fn comparable_generations(
    runs_by_tag: &BTreeMap<String, Vec<RunId>>,
) -> BTreeMap<String, Generations> {
    runs_by_tag
        .iter()
        .filter_map(|(tag, runs)| {
            Generations::from_newest_first(runs).map(|generations| (tag.clone(), generations))
        })
        .collect()
}

/// Everything observed by the second-latest run that the latest run no longer
/// observes.
pub fn disappeared<T: Ord + Copy>(second_latest: &BTreeSet<T>, latest: &BTreeSet<T>) -> Vec<T> {
    second_latest.difference(latest).copied().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct ServiceVersionPair {
    pub service_id: ServiceId,
    pub component_version_id: ComponentVersionId,
}

/// Service/version identity of a retired instance, carrying the names that are
/// denormalised into the patch row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCandidate {
    pub service_id: ServiceId,
    pub service_name: String,
    pub component_version_id: ComponentVersionId,
    pub component_version_name: String,
}

impl PatchCandidate {
    pub fn pair(&self) -> ServiceVersionPair {
        ServiceVersionPair {
            service_id: self.service_id,
            component_version_id: self.component_version_id,
        }
    }
}

/// One candidate per (service, version) pair, ordered by pair. The first
/// candidate seen for a pair wins.
pub fn unique_patch_candidates(
    candidates: impl IntoIterator<Item = PatchCandidate>,
) -> Vec<PatchCandidate> {
    let mut by_pair: BTreeMap<ServiceVersionPair, PatchCandidate> = BTreeMap::new();
    for candidate in candidates {
        by_pair.entry(candidate.pair()).or_insert(candidate);
    }
    by_pair.into_values().collect()
}
