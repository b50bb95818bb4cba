use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::codec::PeerId;

/// Configuration for a single consensus group node.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Name of the consensus group. Also keys the wire subjects.
    pub group: String,

    /// Storage directory for the group's persistent state. The WAL keeps
    /// its own artifacts below this directory as well.
    pub store: PathBuf,

    /// This node's group-scoped identity.
    pub id: PeerId,

    /// Timing and batching knobs.
    pub tuning: RaftTuning,
}

/// Timing and batching knobs, deserializable from server configuration.
///
/// The defaults are the protocol values; tests shrink them to keep
/// multi-node scenarios fast.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RaftTuning {
    pub heartbeat_ms: u64,
    pub min_election_ms: u64,
    pub max_election_ms: u64,
    pub min_campaign_ms: u64,
    pub max_campaign_ms: u64,
    pub catchup_activity_ms: u64,
    pub max_batch_bytes: usize,
    pub max_catchup_outstanding: usize,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            heartbeat_ms: 250,
            min_election_ms: 1500,
            max_election_ms: 4500,
            min_campaign_ms: 50,
            max_campaign_ms: 200,
            catchup_activity_ms: 2000,
            max_batch_bytes: 256 * 1024,
            max_catchup_outstanding: 2 * 1024 * 1024,
        }
    }
}

impl RaftTuning {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// A node that has not heard from enough peers within this window has
    /// lost quorum.
    pub fn lost_quorum_interval(&self) -> Duration {
        self.heartbeat() * 3
    }

    pub fn catchup_activity(&self) -> Duration {
        Duration::from_millis(self.catchup_activity_ms)
    }

    pub(crate) fn rand_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.min_election_ms..=self.max_election_ms);
        Duration::from_millis(ms)
    }

    pub(crate) fn rand_campaign_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.min_campaign_ms..=self.max_campaign_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::RaftTuning;

    #[test]
    fn defaults_follow_protocol_values() {
        let tuning = RaftTuning::default();
        assert_eq!(tuning.heartbeat_ms, 250);
        assert_eq!(tuning.min_election_ms, 1500);
        assert_eq!(tuning.max_election_ms, 4500);
        assert_eq!(
            tuning.lost_quorum_interval(),
            std::time::Duration::from_millis(750)
        );
    }

    #[test]
    fn deserializes_with_partial_overrides() {
        let tuning: RaftTuning = toml::from_str("heartbeat_ms = 50\nmin_election_ms = 150\n")
            .expect("tuning should deserialize");
        assert_eq!(tuning.heartbeat_ms, 50);
        assert_eq!(tuning.min_election_ms, 150);
        assert_eq!(tuning.max_election_ms, 4500);
    }

    #[test]
    fn random_timeouts_stay_in_range() {
        let tuning = RaftTuning::default();
        for _ in 0..32 {
            let e = tuning.rand_election_timeout().as_millis() as u64;
            assert!((tuning.min_election_ms..=tuning.max_election_ms).contains(&e));
            let c = tuning.rand_campaign_timeout().as_millis() as u64;
            assert!((tuning.min_campaign_ms..=tuning.max_campaign_ms).contains(&c));
        }
    }
}
