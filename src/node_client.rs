//! Node client (spec §6): the wallet's only window onto the network,
//! responsible for nothing beyond moving bytes — no scanning, no state.
//!
//! Grounded in the teacher's `wallet/types/node_client.rs` `NodeClient`
//! trait/`HTTPNodeClient` pair, generalized from Grin's PMMR-indexed
//! output API to this spec's block/fee/sync/indexes/transaction surface
//! and made `async` via `async-trait` in place of the teacher's
//! synchronous, `futures 0.1`-wrapped calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};
use crate::types::{Block, Point, H256};

/// `GET /info` response (spec §6): local/network chain height and a
/// snapshot of the node's own peer count and hashrate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
	pub height: u64,
	#[serde(rename = "networkHeight")]
	pub network_height: u64,
	#[serde(rename = "incomingConnections")]
	pub incoming_connections: u64,
	#[serde(rename = "outgoingConnections")]
	pub outgoing_connections: u64,
	pub hashrate: u64,
}

/// `GET /fee` response (spec §6): the node's configured transaction fee
/// recipient and amount. An empty `address` means the node charges no fee.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeeInfo {
	pub address: String,
	pub amount: u64,
}

/// `POST /sync` request body: the checkpoint log a wallet already has,
/// oldest first, plus the height/timestamp to resume from, used by the
/// node to locate the fork point if any (spec §4.6's `get_wallet_sync_data`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
	pub checkpoints: Vec<(u64, H256)>,
	pub height: u64,
	pub timestamp: u64,
	pub count: u32,
	#[serde(rename = "skipCoinbaseTransactions")]
	pub skip_coinbase_transactions: bool,
}

/// `POST /sync` response (spec §6): a contiguous run of blocks extending
/// the wallet's view. An empty `blocks` with `top_block` set means the
/// node has nothing new past its reported tip; fork detection is not a
/// field on this response at all — it's the caller's job to notice a
/// returned block's height doesn't extend what it already has and roll
/// back accordingly (spec §4.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncResponse {
	pub blocks: Vec<Block>,
	pub synced: bool,
	#[serde(rename = "topBlock")]
	pub top_block: Option<TopBlock>,
}

/// The node's own chain tip, reported alongside an empty `blocks` so a
/// caller that's already caught up can still learn the current height
/// without a wasted extra request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TopBlock {
	pub height: u64,
	pub hash: H256,
}

/// `GET /indexes/{start}/{end}` response (spec §6): a bare array, one entry
/// per transaction that appeared in the requested height range, carrying
/// every one of that transaction's output global indexes positionally —
/// `indexes[tx_output_index]` is the global index of that output. Used for
/// the scan engine's late-fill (spec §4.2, §5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalIndexEntry {
	pub hash: H256,
	pub indexes: Vec<u64>,
}

/// `POST /indexes/random` request body (spec §6): the amounts a ring needs
/// decoys for, and how many decoys per amount.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RandomOutputsRequest {
	pub amounts: Vec<u64>,
	pub count: u64,
}

/// One entry of the `POST /indexes/random` response (spec §6): decoy
/// global indexes and one-time keys for a single requested amount, sorted
/// ascending by index by the node to mask the real output's position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RandomOutputsForAmount {
	pub amount: u64,
	pub outputs: Vec<RandomOutputEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RandomOutputEntry {
	pub index: u64,
	pub key: Point,
}

/// `POST /transaction/status` response: of the hashes sent, the ones the
/// node reports neither in its mempool nor in any block — candidates for
/// the locked-transaction cancellation check (spec §4.4, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelledTransactions {
	#[serde(rename = "notFound")]
	pub not_found: Vec<H256>,
}

/// The node's view of a raw transaction pushed by `GET /transaction`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawTransactionResponse {
	pub raw_tx: crate::types::RawTx,
	pub block_height: Option<u64>,
}

/// Everything the rest of the engine needs from a remote node.
///
/// Implementations own connection details (URL, API secret/auth header)
/// and retry policy for a single request; batching, backoff, and
/// liveness tracking across many requests live in the pipeline, not here
/// (spec §4.1).
#[async_trait]
pub trait NodeClient: Send + Sync {
	fn node_url(&self) -> &str;

	async fn get_info(&self) -> Result<NodeInfo>;

	async fn get_fee(&self) -> Result<FeeInfo>;

	/// Requests up to `count` blocks starting at `start_height`/
	/// `start_timestamp`, handing the node the wallet's current checkpoint
	/// log so the caller can notice a reorg by comparing returned block
	/// heights against what it already has (spec §4.1, §4.3, §4.6).
	/// `skip_coinbase` asks the node to omit coinbase transactions from the
	/// response entirely when the caller has no use for them.
	async fn sync(&self, checkpoints: Vec<(u64, H256)>, start_height: u64, start_timestamp: u64, count: u32, skip_coinbase: bool) -> Result<SyncResponse>;

	/// `GET /indexes/{start}/{end}` (spec §6): one [`GlobalIndexEntry`] per
	/// transaction in the height range, not one per output.
	async fn get_global_indexes(&self, start_height: u64, end_height: u64) -> Result<Vec<GlobalIndexEntry>>;

	/// `POST /indexes/random` (spec §6): `count` decoy outputs for each of
	/// `amounts`, batched into a single request rather than one per amount.
	async fn get_random_outputs(&self, amounts: &[u64], count: u64) -> Result<Vec<RandomOutputsForAmount>>;

	/// Batched mempool/block-inclusion check (spec §4.4, §4.6): of
	/// `hashes`, returns the ones found in neither the mempool nor any
	/// block, for the locked-transaction-cancellation tick to act on.
	async fn get_cancelled_transactions(&self, hashes: &[H256]) -> Result<Vec<H256>>;

	async fn get_transaction(&self, hash: &H256) -> Result<RawTransactionResponse>;

	async fn post_transaction(&self, raw_tx_hex: &str) -> Result<H256>;
}

/// `reqwest`-backed implementation, replacing the teacher's
/// `hyper`/`native-tls` stack with the modern async-native client the
/// rest of this crate's `tokio` runtime expects.
pub struct HttpNodeClient {
	node_url: String,
	api_secret: Option<String>,
	client: reqwest::Client,
}

impl HttpNodeClient {
	pub fn new(node_url: impl Into<String>, api_secret: Option<String>) -> Self {
		HttpNodeClient {
			node_url: node_url.into(),
			api_secret,
			client: reqwest::Client::new(),
		}
	}

	fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
		let url = format!("{}{}", self.node_url.trim_end_matches('/'), path);
		let builder = self.client.request(method, url);
		match &self.api_secret {
			Some(secret) => builder.bearer_auth(secret),
			None => builder,
		}
	}

	async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
		log::trace!("node request: GET {}", path);
		let response = self.request(reqwest::Method::GET, path).send().await.map_err(|e| {
			log::warn!("node request failed: GET {}: {}", path, e);
			ErrorKind::TransportError(e.to_string())
		})?;
		response.json::<T>().await.map_err(|e| {
			log::warn!("node response malformed: GET {}: {}", path, e);
			ErrorKind::MalformedResponse(e.to_string()).into()
		})
	}

	async fn post_json<B: Serialize + Sync, T: for<'de> Deserialize<'de>>(&self, path: &str, body: &B) -> Result<T> {
		log::trace!("node request: POST {}", path);
		let response = self.request(reqwest::Method::POST, path).json(body).send().await.map_err(|e| {
			log::warn!("node request failed: POST {}: {}", path, e);
			ErrorKind::TransportError(e.to_string())
		})?;
		response.json::<T>().await.map_err(|e| {
			log::warn!("node response malformed: POST {}: {}", path, e);
			ErrorKind::MalformedResponse(e.to_string()).into()
		})
	}
}

#[async_trait]
impl NodeClient for HttpNodeClient {
	fn node_url(&self) -> &str {
		&self.node_url
	}

	async fn get_info(&self) -> Result<NodeInfo> {
		self.get_json("/info").await
	}

	async fn get_fee(&self) -> Result<FeeInfo> {
		self.get_json("/fee").await
	}

	async fn sync(&self, checkpoints: Vec<(u64, H256)>, start_height: u64, start_timestamp: u64, count: u32, skip_coinbase: bool) -> Result<SyncResponse> {
		let body = SyncRequest {
			checkpoints,
			height: start_height,
			timestamp: start_timestamp,
			count,
			skip_coinbase_transactions: skip_coinbase,
		};
		self.post_json("/sync", &body).await
	}

	async fn get_global_indexes(&self, start_height: u64, end_height: u64) -> Result<Vec<GlobalIndexEntry>> {
		self.get_json(&format!("/indexes/{}/{}", start_height, end_height)).await
	}

	async fn get_random_outputs(&self, amounts: &[u64], count: u64) -> Result<Vec<RandomOutputsForAmount>> {
		let body = RandomOutputsRequest {
			amounts: amounts.to_vec(),
			count,
		};
		self.post_json("/indexes/random", &body).await
	}

	async fn get_cancelled_transactions(&self, hashes: &[H256]) -> Result<Vec<H256>> {
		let response: CancelledTransactions = self.post_json("/transaction/status", &hashes.to_vec()).await?;
		Ok(response.not_found)
	}

	async fn get_transaction(&self, hash: &H256) -> Result<RawTransactionResponse> {
		self.get_json(&format!("/transaction?hash={}", hash)).await
	}

	async fn post_transaction(&self, raw_tx_hex: &str) -> Result<H256> {
		#[derive(Serialize)]
		struct Body<'a> {
			raw_tx_hex: &'a str,
		}
		#[derive(Deserialize)]
		struct Response {
			hash: H256,
		}
		let response: Response = self.post_json("/transaction", &Body { raw_tx_hex }).await?;
		Ok(response.hash)
	}
}

#[cfg(test)]
pub mod mock {
	use super::*;
	use parking_lot::Mutex;
	use std::collections::VecDeque;

	/// In-memory `NodeClient` stand-in for pipeline/coordinator tests: a
	/// scripted queue of `sync` responses plus fixed answers for
	/// everything else, mirroring the teacher's pattern of a hand-rolled
	/// test double rather than a mocking framework.
	pub struct MockNodeClient {
		pub info: NodeInfo,
		pub fee: FeeInfo,
		pub sync_responses: Mutex<VecDeque<SyncResponse>>,
		pub global_indexes: Mutex<Vec<GlobalIndexEntry>>,
	}

	impl MockNodeClient {
		pub fn new() -> Self {
			MockNodeClient {
				info: NodeInfo {
					height: 0,
					network_height: 0,
					incoming_connections: 0,
					outgoing_connections: 0,
					hashrate: 0,
				},
				fee: FeeInfo {
					address: String::new(),
					amount: 0,
				},
				sync_responses: Mutex::new(VecDeque::new()),
				global_indexes: Mutex::new(Vec::new()),
			}
		}

		pub fn push_sync_response(&self, response: SyncResponse) {
			self.sync_responses.lock().push_back(response);
		}

		/// Scripts a `GlobalIndexEntry` any `get_global_indexes` call will
		/// see, regardless of the requested height range — the mock doesn't
		/// emulate the node's range filtering, only the response shape.
		pub fn push_global_index_entry(&self, entry: GlobalIndexEntry) {
			self.global_indexes.lock().push(entry);
		}
	}

	#[async_trait]
	impl NodeClient for MockNodeClient {
		fn node_url(&self) -> &str {
			"mock://node"
		}

		async fn get_info(&self) -> Result<NodeInfo> {
			Ok(self.info.clone())
		}

		async fn get_fee(&self) -> Result<FeeInfo> {
			Ok(self.fee.clone())
		}

		async fn sync(&self, _checkpoints: Vec<(u64, H256)>, _start_height: u64, _start_timestamp: u64, _count: u32, _skip_coinbase: bool) -> Result<SyncResponse> {
			self.sync_responses
				.lock()
				.pop_front()
				.ok_or_else(|| ErrorKind::TransportError("no scripted sync response left".into()).into())
		}

		async fn get_global_indexes(&self, _start_height: u64, _end_height: u64) -> Result<Vec<GlobalIndexEntry>> {
			Ok(self.global_indexes.lock().clone())
		}

		async fn get_random_outputs(&self, amounts: &[u64], _count: u64) -> Result<Vec<RandomOutputsForAmount>> {
			Ok(amounts
				.iter()
				.map(|&amount| RandomOutputsForAmount { amount, outputs: vec![] })
				.collect())
		}

		async fn get_cancelled_transactions(&self, hashes: &[H256]) -> Result<Vec<H256>> {
			// Mirrors the prior default (every queried hash reported
			// unconfirmed) so existing locked-check tests keep seeing misses
			// unless a test scripts otherwise.
			Ok(hashes.to_vec())
		}

		async fn get_transaction(&self, _hash: &H256) -> Result<RawTransactionResponse> {
			Err(ErrorKind::TransportError("mock does not serve raw transactions".into()).into())
		}

		async fn post_transaction(&self, _raw_tx_hex: &str) -> Result<H256> {
			Ok(H256::ZERO)
		}
	}
}
