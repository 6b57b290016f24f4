// ABOUTME: The master selection rule applied to one observer's view of the plane.
// ABOUTME: Pure function of the node records, the current time, and the heartbeat timeout.

use std::time::Duration;

use keelson_core::{ElectionAmbiguity, ManagementNodeRecord, NodeState, PlaneSyncRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    pub master: Option<String>,
    pub ambiguity: Option<ElectionAmbiguity>,
}

/// Decide who is master as seen at `now_millis`.
///
/// A live master claim is honoured; with several live claims the latest
/// promotion wins, ties to the smallest id. With no live claim the smallest
/// eligible id among live nodes becomes master. Expired, failed, and
/// terminated nodes are never chosen.
pub fn elect(plane: &PlaneSyncRecord, now_millis: i64, heartbeat_timeout: Duration) -> Election {
    let live: Vec<&ManagementNodeRecord> = plane
        .nodes
        .values()
        .filter(|r| !r.is_expired(now_millis, heartbeat_timeout))
        .filter(|r| r.state.is_eligible_for_master())
        .collect();

    let claimants: Vec<&ManagementNodeRecord> = live
        .iter()
        .copied()
        .filter(|r| r.state == NodeState::Master)
        .collect();

    let ambiguity = (claimants.len() > 1).then(|| ElectionAmbiguity {
        claimants: claimants.iter().map(|r| r.node_id.clone()).collect(),
    });

    let master = claimants
        .iter()
        .max_by(|a, b| {
            a.claim_time()
                .cmp(&b.claim_time())
                .then_with(|| b.node_id.cmp(&a.node_id))
        })
        // BTreeMap order: the first live node has the smallest id
        .or_else(|| live.first())
        .map(|r| r.node_id.clone());

    Election { master, ambiguity }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn plane(records: Vec<ManagementNodeRecord>) -> PlaneSyncRecord {
        PlaneSyncRecord::from_records(records)
    }

    #[test]
    fn live_master_is_kept_even_with_a_larger_id() {
        let p = plane(vec![
            ManagementNodeRecord::new("a", NodeState::Standby, 1_000),
            ManagementNodeRecord::new("z", NodeState::Master, 1_000),
        ]);

        assert_eq!(elect(&p, 2_000, TIMEOUT).master.as_deref(), Some("z"));
    }

    #[test]
    fn expired_master_is_replaced_by_smallest_live_id() {
        let p = plane(vec![
            ManagementNodeRecord::new("a", NodeState::Master, 0),
            ManagementNodeRecord::new("c", NodeState::Standby, 31_000),
            ManagementNodeRecord::new("b", NodeState::Standby, 31_000),
        ]);

        assert_eq!(elect(&p, 31_000, TIMEOUT).master.as_deref(), Some("b"));
    }

    #[test]
    fn failed_and_terminated_nodes_are_never_chosen() {
        let p = plane(vec![
            ManagementNodeRecord::new("a", NodeState::Failed, 1_000),
            ManagementNodeRecord::new("b", NodeState::Terminated, 1_000),
            ManagementNodeRecord::new("c", NodeState::Initializing, 1_000),
        ]);

        assert_eq!(elect(&p, 1_000, TIMEOUT).master.as_deref(), Some("c"));
    }

    #[test]
    fn nobody_live_means_no_master() {
        let p = plane(vec![ManagementNodeRecord::new("a", NodeState::Standby, 0)]);

        assert_eq!(elect(&p, 60_000, TIMEOUT).master, None);
    }

    #[test]
    fn competing_claims_resolve_to_latest_promotion() {
        let p = plane(vec![
            ManagementNodeRecord::new("n1", NodeState::Master, 40_000).with_master_since(0),
            ManagementNodeRecord::new("n2", NodeState::Master, 39_000).with_master_since(31_000),
        ]);

        let election = elect(&p, 40_000, TIMEOUT);
        assert_eq!(election.master.as_deref(), Some("n2"));
        assert_eq!(
            election.ambiguity.map(|a| a.claimants),
            Some(vec!["n1".to_string(), "n2".to_string()])
        );
    }

    #[test]
    fn observers_agree_once_heartbeats_are_fresh() {
        let shared = vec![
            ManagementNodeRecord::new("n1", NodeState::Master, 0).with_master_since(0),
            ManagementNodeRecord::new("n3", NodeState::Master, 5_000).with_master_since(5_000),
        ];

        for now in (5_000..=35_000).step_by(2_500) {
            // Each observer sees the shared records plus its own fresh heartbeat
            let winners: Vec<Option<String>> = ["n2", "n4", "n5"]
                .iter()
                .map(|me| {
                    let mut records = shared.clone();
                    records.push(ManagementNodeRecord::new(*me, NodeState::Standby, now));
                    elect(&plane(records), now, TIMEOUT).master
                })
                .collect();
            assert!(
                winners.windows(2).all(|w| w[0] == w[1]),
                "observers disagree at {}: {:?}",
                now,
                winners
            );
            assert!(winners[0].is_some());
        }
    }
}
