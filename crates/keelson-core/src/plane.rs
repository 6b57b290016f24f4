// ABOUTME: Management plane sync records: per-node heartbeat records and the derived plane view.
// ABOUTME: Also defines node states, HA start modes, and the delta used to update node records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PLATFORM_VERSION;

/// What a management node believes about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Initializing,
    Standby,
    Master,
    Failed,
    Terminated,
}

impl NodeState {
    /// Failed and terminated nodes are never chosen as master.
    pub fn is_eligible_for_master(&self) -> bool {
        !matches!(self, NodeState::Failed | NodeState::Terminated)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Initializing => "INITIALIZING",
            NodeState::Standby => "STANDBY",
            NodeState::Master => "MASTER",
            NodeState::Failed => "FAILED",
            NodeState::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// How a node takes part in the election when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HighAvailabilityMode {
    Auto,
    Master,
    Standby,
    HotStandby,
    Disabled,
}

#[derive(Debug, Error)]
#[error("unknown high availability mode: {0}")]
pub struct ParseModeError(String);

impl FromStr for HighAvailabilityMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "auto" => Ok(Self::Auto),
            "master" => Ok(Self::Master),
            "standby" => Ok(Self::Standby),
            "hot-standby" => Ok(Self::HotStandby),
            "disabled" => Ok(Self::Disabled),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

impl fmt::Display for HighAvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Master => "master",
            Self::Standby => "standby",
            Self::HotStandby => "hot-standby",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// One node's heartbeat. Written every poll; a newer timestamp supersedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementNodeRecord {
    pub node_id: String,
    pub state: NodeState,
    pub timestamp_utc: i64,
    pub platform_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// When this node last became master. Only set on MASTER records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_since_utc: Option<i64>,
}

impl ManagementNodeRecord {
    pub fn new(node_id: impl Into<String>, state: NodeState, timestamp_utc: i64) -> Self {
        Self {
            node_id: node_id.into(),
            state,
            timestamp_utc,
            platform_version: PLATFORM_VERSION.to_string(),
            uri: None,
            master_since_utc: None,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_master_since(mut self, millis: i64) -> Self {
        self.master_since_utc = Some(millis);
        self
    }

    /// Orders competing master claims: the most recent promotion wins.
    /// Records without a promotion time fall back to their timestamp.
    pub fn claim_time(&self) -> i64 {
        self.master_since_utc.unwrap_or(self.timestamp_utc)
    }

    /// Milliseconds since this record was written, as seen at `now_millis`.
    pub fn age_millis(&self, now_millis: i64) -> i64 {
        now_millis.saturating_sub(self.timestamp_utc)
    }

    /// A record is expired once its age exceeds the heartbeat timeout.
    pub fn is_expired(&self, now_millis: i64, heartbeat_timeout: Duration) -> bool {
        let timeout = i64::try_from(heartbeat_timeout.as_millis()).unwrap_or(i64::MAX);
        self.age_millis(now_millis) > timeout
    }
}

/// More than one node currently claims to be master. Transient: the next
/// poll resolves it, so this is only ever logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("election ambiguity: {} nodes claim master ({})", .claimants.len(), .claimants.join(", "))]
pub struct ElectionAmbiguity {
    pub claimants: Vec<String>,
}

/// The plane as one observer sees it: every node record plus the recorded
/// master.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneSyncRecord {
    pub nodes: BTreeMap<String, ManagementNodeRecord>,
    pub master_node_id: Option<String>,
}

impl PlaneSyncRecord {
    /// Build the plane view from raw node records. The recorded master is the
    /// node whose record says MASTER; when several do, the latest claim wins
    /// and ties go to the smallest node id.
    pub fn from_records(records: impl IntoIterator<Item = ManagementNodeRecord>) -> Self {
        let nodes: BTreeMap<String, ManagementNodeRecord> = records
            .into_iter()
            .map(|r| (r.node_id.clone(), r))
            .collect();

        let master_node_id = nodes
            .values()
            .filter(|r| r.state == NodeState::Master)
            .max_by(|a, b| {
                a.claim_time()
                    .cmp(&b.claim_time())
                    .then_with(|| b.node_id.cmp(&a.node_id))
            })
            .map(|r| r.node_id.clone());

        Self {
            nodes,
            master_node_id,
        }
    }

    pub fn master(&self) -> Option<&ManagementNodeRecord> {
        self.master_node_id
            .as_deref()
            .and_then(|id| self.nodes.get(id))
    }

    /// Reports when more than one node claims MASTER.
    pub fn ambiguity(&self) -> Option<ElectionAmbiguity> {
        let claimants: Vec<String> = self
            .nodes
            .values()
            .filter(|r| r.state == NodeState::Master)
            .map(|r| r.node_id.clone())
            .collect();
        (claimants.len() > 1).then_some(ElectionAmbiguity { claimants })
    }

    /// Fold a delta into this view and recompute the recorded master.
    pub fn apply_delta(&self, delta: &SyncRecordDelta) -> PlaneSyncRecord {
        let mut nodes = self.nodes.clone();
        for record in &delta.nodes {
            nodes.insert(record.node_id.clone(), record.clone());
        }
        for id in &delta.removed_node_ids {
            nodes.remove(id);
        }
        PlaneSyncRecord::from_records(nodes.into_values())
    }
}

/// Incremental update to the set of node records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecordDelta {
    pub nodes: Vec<ManagementNodeRecord>,
    pub removed_node_ids: Vec<String>,
}

impl SyncRecordDelta {
    pub fn node(mut self, record: ManagementNodeRecord) -> Self {
        self.nodes.push(record);
        self
    }

    pub fn removed_node_id(mut self, id: impl Into<String>) -> Self {
        self.removed_node_ids.push(id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.removed_node_ids.is_empty()
    }
}
