//! Runtime configuration (spec §6), grounded in the teacher's
//! `Wallet713Config` (`common/config.rs`): a plain `serde`-derived struct
//! loaded from TOML, with `Default` supplying every constant spec §6
//! pins a value to.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub node_url: String,
	pub node_api_secret: Option<String>,

	/// Height spacing between sparse checkpoints (spec §6).
	pub checkpoint_interval: u64,
	/// Dense recent-hash tail length (spec §6).
	pub recent_window: usize,
	/// Height window a deferred global-index late-fill tolerates before
	/// it's treated as a fatal scan-integrity error (spec §4.2/§5).
	pub global_index_late_fill_window: u64,
	/// Consecutive misses before a locked transaction is cancelled (spec
	/// §4.4).
	pub locked_tx_missing_threshold: u32,
	/// Ceiling the adaptive block batch size grows toward (spec §4.1).
	pub max_batch_size: u32,
	/// Seconds since the last successful fetch before the node is declared
	/// dead (spec §4.1). Tracked against wall-clock time rather than a
	/// failure count, so a single outage reports `DeadNode` once instead of
	/// on every failed retry inside it.
	pub max_last_fetched_block_interval_s: u64,

	/// Sync ticker interval, in milliseconds.
	pub sync_interval_ms: u64,
	/// Daemon-info ticker interval, in milliseconds.
	pub daemon_info_interval_ms: u64,
	/// Locked-transaction-check ticker interval, in milliseconds.
	pub locked_check_interval_ms: u64,

	/// Whether to scan coinbase outputs at all (spec §6). Skipping them
	/// saves a derivation per block for wallets that never expect to mine.
	pub scan_coinbase_transactions: bool,
	/// Maximum number of stored blocks the sync ticker commits in a single
	/// tick before yielding back to the executor (spec §4.5/§5).
	pub blocks_per_tick: u32,

	/// Height interval at which spent inputs older than `height -
	/// prune_interval` are dropped from the store (spec §4.3's fork-handling
	/// pruning policy, `P=5000`).
	pub prune_interval: u64,

	/// Whether reaching the synced state should trigger a background
	/// fusion-transaction optimization pass (spec §4.5's auto-optimization
	/// hook). The construction itself is out of this crate's scope (spec
	/// §1); this only gates the `currently_optimizing` handoff.
	pub auto_optimize_enabled: bool,
}

pub const DEFAULT_CONFIG: &str = r#"
node_url = "http://127.0.0.1:11898"
checkpoint_interval = 5000
recent_window = 100
global_index_late_fill_window = 10
locked_tx_missing_threshold = 10
max_batch_size = 100
max_last_fetched_block_interval_s = 120
sync_interval_ms = 5000
daemon_info_interval_ms = 10000
locked_check_interval_ms = 30000
scan_coinbase_transactions = true
blocks_per_tick = 10
prune_interval = 5000
auto_optimize_enabled = false
"#;

impl Default for Config {
	fn default() -> Self {
		toml::from_str(DEFAULT_CONFIG).expect("DEFAULT_CONFIG is valid toml")
	}
}

impl Config {
	pub fn from_file(path: &std::path::Path) -> Result<Config> {
		let contents = std::fs::read_to_string(path).map_err(|e| ErrorKind::MalformedResponse(format!("reading config: {}", e)))?;
		toml::from_str(&contents).map_err(|e| ErrorKind::MalformedResponse(format!("parsing config: {}", e)).into())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn default_config_matches_spec_constants() {
		let config = Config::default();
		assert_eq!(config.checkpoint_interval, 5000);
		assert_eq!(config.recent_window, 100);
		assert_eq!(config.locked_tx_missing_threshold, 10);
		assert_eq!(config.max_batch_size, 100);
		assert_eq!(config.max_last_fetched_block_interval_s, 120);
		assert_eq!(config.prune_interval, 5000);
	}
}
