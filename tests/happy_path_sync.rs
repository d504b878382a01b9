//! End-to-end scenario 1 from spec §8: a node serving a run of blocks,
//! one of which pays a subwallet, should leave the wallet with a single
//! attributed transaction and the expected unlocked balance once the
//! output's unlock time has passed.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use cryptonote_wallet_sync::node_client::{FeeInfo, GlobalIndexEntry, NodeClient, NodeInfo, RandomOutputsForAmount, RawTransactionResponse, SyncResponse};
use cryptonote_wallet_sync::types::KeyOutput;
use cryptonote_wallet_sync::{Block, Config, CryptoOps, DefaultCryptoOps, RawTx, SubWalletsStore, WalletSynchronizer, H256};

/// A scripted `NodeClient` serving a fixed run of blocks in one response.
/// Standalone from the crate's own `#[cfg(test)]`-only mock since
/// integration tests link against the library as an external crate and
/// can't see test-only items.
struct ScriptedNode {
	blocks: Mutex<Option<Vec<Block>>>,
	/// Entries `get_global_indexes` hands back, regardless of the
	/// requested height range, for late-fill tests.
	global_indexes: Mutex<Vec<GlobalIndexEntry>>,
}

impl ScriptedNode {
	fn with_blocks(blocks: Vec<Block>) -> Self {
		ScriptedNode {
			blocks: Mutex::new(Some(blocks)),
			global_indexes: Mutex::new(Vec::new()),
		}
	}
}

#[async_trait]
impl NodeClient for ScriptedNode {
	fn node_url(&self) -> &str {
		"scripted://node"
	}

	async fn get_info(&self) -> cryptonote_wallet_sync::Result<NodeInfo> {
		Ok(NodeInfo {
			height: 99,
			network_height: 99,
			incoming_connections: 0,
			outgoing_connections: 0,
			hashrate: 0,
		})
	}

	async fn get_fee(&self) -> cryptonote_wallet_sync::Result<FeeInfo> {
		Ok(FeeInfo {
			address: String::new(),
			amount: 0,
		})
	}

	async fn sync(&self, _checkpoints: Vec<(u64, H256)>, _start_height: u64, _start_timestamp: u64, _count: u32, _skip_coinbase: bool) -> cryptonote_wallet_sync::Result<SyncResponse> {
		let blocks = self.blocks.lock().take().unwrap_or_default();
		Ok(SyncResponse {
			blocks,
			synced: true,
			top_block: None,
		})
	}

	async fn get_global_indexes(&self, _start_height: u64, _end_height: u64) -> cryptonote_wallet_sync::Result<Vec<GlobalIndexEntry>> {
		Ok(self.global_indexes.lock().clone())
	}

	async fn get_random_outputs(&self, amounts: &[u64], _count: u64) -> cryptonote_wallet_sync::Result<Vec<RandomOutputsForAmount>> {
		Ok(amounts.iter().map(|&amount| RandomOutputsForAmount { amount, outputs: vec![] }).collect())
	}

	async fn get_cancelled_transactions(&self, hashes: &[H256]) -> cryptonote_wallet_sync::Result<Vec<H256>> {
		Ok(hashes.to_vec())
	}

	async fn get_transaction(&self, _hash: &H256) -> cryptonote_wallet_sync::Result<RawTransactionResponse> {
		Err(cryptonote_wallet_sync::ErrorKind::TransportError("not served".into()).into())
	}

	async fn post_transaction(&self, _raw_tx_hex: &str) -> cryptonote_wallet_sync::Result<H256> {
		Ok(H256::ZERO)
	}
}

fn secret(byte: u8) -> cryptonote_wallet_sync::SecretKey {
	use curve25519_dalek::scalar::Scalar;
	cryptonote_wallet_sync::SecretKey(Scalar::from_bytes_mod_order([byte; 32]).to_bytes())
}

#[tokio::test]
async fn receives_one_payment_and_reports_it_unlocked_once_matured() {
	let crypto = Arc::new(DefaultCryptoOps::new());

	let view_secret = secret(1);
	let view_public = crypto.secret_key_to_public_key(&view_secret).unwrap();
	let spend_secret = secret(2);
	let spend_public = crypto.secret_key_to_public_key(&spend_secret).unwrap();

	let mut store = SubWalletsStore::new(view_public, Some(view_secret));
	store.add_subwallet(spend_public, Some(spend_secret), 0, 0);

	let tx_secret = secret(3);
	let tx_public = crypto.secret_key_to_public_key(&tx_secret).unwrap();
	let derivation = crypto.generate_key_derivation(&tx_public, &view_secret).unwrap();
	let output_key = crypto.derive_public_key(&derivation, 0, &spend_public).unwrap();

	// Blocks 1..=99, with a single payment of 1,000,000 to our subwallet
	// at height 50.
	let mut blocks = Vec::new();
	for height in 1u64..=99 {
		let transactions = if height == 50 {
			vec![RawTx {
				hash: H256([50u8; 32]),
				public_key: tx_public,
				unlock_time: 0,
				payment_id: String::new(),
				key_outputs: vec![KeyOutput {
					key: output_key,
					amount: 1_000_000,
					global_index: Some(7),
				}],
				key_inputs: vec![],
			}]
		} else {
			vec![]
		};
		blocks.push(Block {
			height,
			hash: H256([height as u8; 32]),
			timestamp: 0,
			coinbase: None,
			transactions,
		});
	}

	let node: Arc<ScriptedNode> = Arc::new(ScriptedNode::with_blocks(blocks));
	let config = Config {
		blocks_per_tick: 200,
		..Config::default()
	};
	let synchronizer = Arc::new(WalletSynchronizer::new(node, store, crypto, config));

	synchronizer.sync_once().await.unwrap();

	assert_eq!(synchronizer.height(), 99);
	let (unlocked, locked) = synchronizer.get_balance(Some(&spend_public), 0).unwrap();
	assert_eq!(unlocked, 1_000_000);
	assert_eq!(locked, 0);
}

/// Scenario 6 (spec §8): an output committed without a `global_output_index`
/// must eventually have it filled in once the chain has grown far enough
/// past it, across separate sync ticks rather than within the tick that
/// first scanned it.
#[tokio::test]
async fn late_fill_resolves_a_missing_global_index_across_ticks() {
	let crypto = Arc::new(DefaultCryptoOps::new());

	let view_secret = secret(1);
	let view_public = crypto.secret_key_to_public_key(&view_secret).unwrap();
	let spend_secret = secret(2);
	let spend_public = crypto.secret_key_to_public_key(&spend_secret).unwrap();

	let mut store = SubWalletsStore::new(view_public, Some(view_secret));
	store.add_subwallet(spend_public, Some(spend_secret), 0, 0);

	let tx_secret = secret(3);
	let tx_public = crypto.secret_key_to_public_key(&tx_secret).unwrap();
	let derivation = crypto.generate_key_derivation(&tx_public, &view_secret).unwrap();
	let output_key = crypto.derive_public_key(&derivation, 0, &spend_public).unwrap();
	let payment_hash = H256([5u8; 32]);

	let mut blocks = Vec::new();
	for height in 1u64..=15 {
		let transactions = if height == 5 {
			vec![RawTx {
				hash: payment_hash,
				public_key: tx_public,
				unlock_time: 0,
				payment_id: String::new(),
				key_outputs: vec![KeyOutput {
					key: output_key,
					amount: 1_000_000,
					// Too fresh to carry a global index at scan time.
					global_index: None,
				}],
				key_inputs: vec![],
			}]
		} else {
			vec![]
		};
		blocks.push(Block {
			height,
			hash: H256([height as u8; 32]),
			timestamp: 0,
			coinbase: None,
			transactions,
		});
	}

	let node = Arc::new(ScriptedNode::with_blocks(blocks));
	node.global_indexes.lock().push(GlobalIndexEntry {
		hash: payment_hash,
		indexes: vec![77],
	});

	// late_fill_window defaults to 10; committing 5 blocks per tick means
	// the window only clears once the chain has reached height 15.
	let config = Config {
		blocks_per_tick: 5,
		..Config::default()
	};
	let synchronizer = Arc::new(WalletSynchronizer::new(node, store, crypto, config));

	synchronizer.sync_once().await.unwrap();
	assert_eq!(synchronizer.height(), 5);
	synchronizer.sync_once().await.unwrap();
	assert_eq!(synchronizer.height(), 10);
	synchronizer.sync_once().await.unwrap();
	assert_eq!(synchronizer.height(), 15);

	let (unlocked, _) = synchronizer.get_balance(Some(&spend_public), 0).unwrap();
	assert_eq!(unlocked, 1_000_000);
}

/// Scenario 6's failure mode: a node that never produces the global index
/// once the late-fill window has fully passed is a scan-integrity error,
/// not a silently-incomplete output.
#[tokio::test]
async fn late_fill_errors_once_the_window_passes_with_no_index_available() {
	let crypto = Arc::new(DefaultCryptoOps::new());

	let view_secret = secret(1);
	let view_public = crypto.secret_key_to_public_key(&view_secret).unwrap();
	let spend_secret = secret(2);
	let spend_public = crypto.secret_key_to_public_key(&spend_secret).unwrap();

	let mut store = SubWalletsStore::new(view_public, Some(view_secret));
	store.add_subwallet(spend_public, Some(spend_secret), 0, 0);

	let tx_secret = secret(3);
	let tx_public = crypto.secret_key_to_public_key(&tx_secret).unwrap();
	let derivation = crypto.generate_key_derivation(&tx_public, &view_secret).unwrap();
	let output_key = crypto.derive_public_key(&derivation, 0, &spend_public).unwrap();

	let mut blocks = Vec::new();
	for height in 1u64..=15 {
		let transactions = if height == 5 {
			vec![RawTx {
				hash: H256([5u8; 32]),
				public_key: tx_public,
				unlock_time: 0,
				payment_id: String::new(),
				key_outputs: vec![KeyOutput {
					key: output_key,
					amount: 1_000_000,
					global_index: None,
				}],
				key_inputs: vec![],
			}]
		} else {
			vec![]
		};
		blocks.push(Block {
			height,
			hash: H256([height as u8; 32]),
			timestamp: 0,
			coinbase: None,
			transactions,
		});
	}

	// No global_indexes scripted: the node never produces the index.
	let node = Arc::new(ScriptedNode::with_blocks(blocks));
	let config = Config {
		blocks_per_tick: 5,
		..Config::default()
	};
	let synchronizer = Arc::new(WalletSynchronizer::new(node, store, crypto, config));

	synchronizer.sync_once().await.unwrap();
	synchronizer.sync_once().await.unwrap();
	assert!(synchronizer.sync_once().await.is_err());
}
