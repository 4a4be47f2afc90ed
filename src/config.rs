//! Engine configuration.
use crate::identity::Participants;
use std::time::Duration;

/// Settings recognized at init. The participant set is fixed for the
/// lifetime of the engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Rolling window size per participant.
    pub cache_size: usize,
    /// Height gap beyond which a sync request is refused.
    pub sync_limit: i64,
    /// Gossip period.
    pub heartbeat: Duration,
    /// Max transactions per block.
    pub block_size: usize,
    /// Fame elections fall back to the deterministic coin every this many
    /// voting rounds.
    pub coin_round_period: i64,
    /// Deadline for `CommitBlock` / `ValidateTx` round trips.
    pub proxy_timeout: Duration,
    pub participants: Participants,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_size: 500,
            sync_limit: 100,
            heartbeat: Duration::from_secs(1),
            block_size: 100,
            coin_round_period: 10,
            proxy_timeout: Duration::from_secs(1),
            participants: Participants::new(),
        }
    }
}

impl Config {
    pub fn with_participants(participants: Participants) -> Self {
        Self {
            participants,
            ..Self::default()
        }
    }
}
