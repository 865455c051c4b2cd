//! Read modes, replica selection, and client-side timestamp tracking.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::ReplicaInfo;
use crate::error::{Result, ScanError};

/// Consistency policy governing which timestamp a scan observes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Each partition reads its most recent committed data.
    #[default]
    Latest,
    /// Every partition reads as of one timestamp.
    Snapshot,
    /// Reads observe at least every write the issuing client has seen.
    ReadYourWrites,
}

impl ReadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Snapshot => "snapshot",
            Self::ReadYourWrites => "read_your_writes",
        }
    }

    /// Returns whether all partitions of one scan share a pinned timestamp.
    pub fn pins_timestamp(self) -> bool {
        !matches!(self, Self::Latest)
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadMode {
    type Err = ScanError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "latest" | "read_latest" => Ok(Self::Latest),
            "snapshot" | "read_at_snapshot" => Ok(Self::Snapshot),
            "read_your_writes" | "ryw" => Ok(Self::ReadYourWrites),
            other => Err(ScanError::invalid_argument(format!(
                "unknown read mode '{other}'"
            ))),
        }
    }
}

/// Which replica of a partition a scan contacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaSelection {
    #[default]
    LeaderOnly,
    ClosestReplica,
    FirstReplica,
}

impl ReplicaSelection {
    /// Picks a replica, avoiding servers in `blacklist` unless nothing else is left.
    pub fn select<'a>(
        self,
        replicas: &'a [ReplicaInfo],
        blacklist: &BTreeSet<u64>,
    ) -> Option<&'a ReplicaInfo> {
        let usable = |replica: &&ReplicaInfo| !blacklist.contains(&replica.server_id);
        match self {
            Self::LeaderOnly => replicas.iter().find(|replica| replica.is_leader),
            Self::ClosestReplica => replicas
                .iter()
                .filter(usable)
                .find(|replica| replica.is_local)
                .or_else(|| replicas.iter().filter(usable).find(|r| r.is_leader))
                .or_else(|| replicas.iter().find(usable))
                .or_else(|| replicas.first()),
            Self::FirstReplica => replicas.iter().find(usable).or_else(|| replicas.first()),
        }
    }
}

impl FromStr for ReplicaSelection {
    type Err = ScanError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "leader_only" | "leader" => Ok(Self::LeaderOnly),
            "closest_replica" | "closest" => Ok(Self::ClosestReplica),
            "first_replica" | "first" => Ok(Self::FirstReplica),
            other => Err(ScanError::invalid_argument(format!(
                "unknown replica selection '{other}'"
            ))),
        }
    }
}

/// Latest timestamp observed by one client, shared by all of its scans.
///
/// Zero means nothing has been observed yet.
#[derive(Debug, Clone, Default)]
pub struct TimestampOracle {
    latest: Arc<AtomicU64>,
}

impl TimestampOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the observed timestamp; never moves backwards.
    pub fn observe(&self, timestamp: u64) {
        self.latest.fetch_max(timestamp, Ordering::SeqCst);
    }

    pub fn latest(&self) -> Option<u64> {
        match self.latest.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicas() -> Vec<ReplicaInfo> {
        vec![
            ReplicaInfo {
                server_id: 1,
                is_leader: false,
                is_local: false,
            },
            ReplicaInfo {
                server_id: 2,
                is_leader: true,
                is_local: false,
            },
            ReplicaInfo {
                server_id: 3,
                is_leader: false,
                is_local: true,
            },
        ]
    }

    #[test]
    fn selection_policies_pick_expected_replica() {
        let replicas = replicas();
        let none = BTreeSet::new();
        let pick = |policy: ReplicaSelection, blacklist: &BTreeSet<u64>| {
            policy.select(&replicas, blacklist).map(|r| r.server_id)
        };
        assert_eq!(pick(ReplicaSelection::LeaderOnly, &none), Some(2));
        assert_eq!(pick(ReplicaSelection::ClosestReplica, &none), Some(3));
        assert_eq!(pick(ReplicaSelection::FirstReplica, &none), Some(1));

        let failed = BTreeSet::from([1, 3]);
        assert_eq!(pick(ReplicaSelection::ClosestReplica, &failed), Some(2));
        assert_eq!(pick(ReplicaSelection::FirstReplica, &failed), Some(2));

        let all = BTreeSet::from([1, 2, 3]);
        assert_eq!(pick(ReplicaSelection::FirstReplica, &all), Some(1));
    }

    #[test]
    fn oracle_is_monotonic_and_shared() {
        let oracle = TimestampOracle::new();
        assert_eq!(oracle.latest(), None);
        let shared = oracle.clone();
        shared.observe(40);
        oracle.observe(12);
        assert_eq!(oracle.latest(), Some(40));
    }

    #[test]
    fn parses_read_modes() {
        assert_eq!("snapshot".parse::<ReadMode>().ok(), Some(ReadMode::Snapshot));
        assert_eq!(
            "READ_YOUR_WRITES".parse::<ReadMode>().ok(),
            Some(ReadMode::ReadYourWrites)
        );
        assert!("eventual".parse::<ReadMode>().is_err());
    }
}
