//! Wallet synchronizer facade (spec §4, §6): the one object applications
//! hold, owning the block pipeline, the subwallet store, and the node
//! client, and driving them with three independent periodic tickers.
//!
//! The teacher drives its background work with `thread::spawn` loops
//! sprinkled through `broker/keybase.rs`, `broker/epicbox.rs`, and
//! `internal/restore.rs`, each with its own ad hoc `Duration` sleep and a
//! `Mutex<bool>` stop flag. This module keeps that "a named loop per
//! concern, independently start/stoppable" shape but reworks each loop
//! into a `tokio::time::interval` task with an `Arc<Notify>` cancellation
//! point, matching this crate's single-process cooperative scheduling
//! model (spec §1).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::attribution::AttributionEngine;
use crate::config::Config;
use crate::crypto::CryptoOps;
use crate::error::Result;
use crate::node_client::NodeClient;
use crate::pipeline::{BlockPipeline, FetchOutcome, PendingMutation};
use crate::store::SubWalletsStore;
use crate::types::{Block, RawTx, Transaction, H256};

/// Everything observers can learn about without polling (spec §4.5).
#[derive(Clone, Debug)]
pub enum Event {
	/// A net-nonzero transaction affecting a subwallet, regardless of
	/// direction; always accompanied by one of `IncomingTx`/`OutgoingTx`/
	/// `FusionTx` for callers that want direction-specific handling.
	Transaction(Transaction),
	IncomingTx(Transaction),
	OutgoingTx(Transaction),
	FusionTx(Transaction),
	/// A transaction this wallet built and submitted, before confirmation.
	CreatedTx(H256),
	CreatedFusionTx(H256),
	/// The daemon-info ticker observed `wallet_height >= network_height`
	/// for the first time since the last desync (spec §4.5).
	Sync,
	/// The daemon-info ticker observed the wallet fall behind the network
	/// again after having been synced (spec §4.5).
	Desync,
	Disconnect,
	Connect,
	/// Fired both per committed block (with the last daemon-info heights
	/// cached) and from the daemon-info ticker itself (with a freshly
	/// polled `local`/`network`), per spec §4.5/§6.
	HeightChange { wallet: u64, local: u64, network: u64 },
	DeadNode,
	RawBlock(Block),
	RawTransaction(RawTx),
}

/// Ticker interval handles, so `stop` can cancel exactly the tickers
/// `start` spawned and nothing else.
struct Tickers {
	sync: JoinHandle<()>,
	daemon_info: JoinHandle<()>,
	locked_check: JoinHandle<()>,
	cancel: Arc<Notify>,
}

pub struct WalletSynchronizer {
	node: Arc<dyn NodeClient>,
	pipeline: Arc<BlockPipeline>,
	store: Arc<SyncMutex<SubWalletsStore>>,
	engine: Arc<AttributionEngine>,
	config: Config,
	events: broadcast::Sender<Event>,

	/// Preserves the teacher's initial-value quirk (spec §9, Open
	/// Question resolved): the facade reports itself connected before the
	/// first daemon-info tick has actually confirmed reachability, only
	/// flipping to `false` on an observed failure.
	connected: Arc<AtomicBool>,

	/// Last heights the daemon-info ticker polled, cached so a per-block
	/// `HeightChange` can report them without an extra round-trip.
	last_local_height: Arc<AtomicU64>,
	last_network_height: Arc<AtomicU64>,
	/// Whether `wallet_height >= network_height` as of the last daemon-info
	/// tick, so `Sync`/`Desync` fire only on the edge transition.
	synced: Arc<AtomicBool>,

	currently_optimizing: Arc<AtomicBool>,
	currently_transacting: Arc<AtomicBool>,

	tickers: SyncMutex<Option<Tickers>>,
}

impl WalletSynchronizer {
	pub fn new(node: Arc<dyn NodeClient>, store: SubWalletsStore, crypto: Arc<dyn CryptoOps>, config: Config) -> Self {
		let (events, _) = broadcast::channel(1024);
		let pipeline = BlockPipeline::new(config.max_batch_size, Duration::from_secs(config.max_last_fetched_block_interval_s));
		let engine = AttributionEngine::new(crypto, config.global_index_late_fill_window);
		WalletSynchronizer {
			node,
			pipeline: Arc::new(pipeline),
			store: Arc::new(SyncMutex::new(store)),
			engine: Arc::new(engine),
			config,
			events,
			connected: Arc::new(AtomicBool::new(true)),
			last_local_height: Arc::new(AtomicU64::new(0)),
			last_network_height: Arc::new(AtomicU64::new(0)),
			synced: Arc::new(AtomicBool::new(false)),
			currently_optimizing: Arc::new(AtomicBool::new(false)),
			currently_transacting: Arc::new(AtomicBool::new(false)),
			tickers: SyncMutex::new(None),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.events.subscribe()
	}

	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Acquire)
	}

	pub fn height(&self) -> u64 {
		self.store.lock().sync_status().height()
	}

	pub fn get_balance(&self, owner: Option<&crate::types::PublicKey>, now: u64) -> Result<(u64, u64)> {
		let store = self.store.lock();
		let height = store.sync_status().height();
		store.get_balance(owner, height, now)
	}

	/// Requests a full rescan from `scan_height`/`scan_timestamp` onward
	/// (spec §4.1): deferred by the pipeline until any in-flight fetch
	/// resolves, then mirrored into the store's checkpoint log here.
	pub fn reset(&self, scan_height: u64, scan_timestamp: u64) {
		self.pipeline.reset(scan_height, scan_timestamp);
		self.apply_pipeline_mutation();
	}

	/// Requests a rewind to `scan_height` (spec §4.1), same deferral
	/// discipline as [`reset`](Self::reset).
	pub fn rewind(&self, scan_height: u64) {
		self.pipeline.rewind(scan_height);
		self.apply_pipeline_mutation();
	}

	pub fn currently_optimizing(&self) -> bool {
		self.currently_optimizing.load(Ordering::Acquire)
	}

	pub fn currently_transacting(&self) -> bool {
		self.currently_transacting.load(Ordering::Acquire)
	}

	/// Claims the "currently transacting" flag, returning `false` if an
	/// optimization or another transaction already holds it (spec §4.5's
	/// mutually-exclusive flags).
	pub fn begin_transacting(&self) -> bool {
		if self.currently_optimizing.load(Ordering::Acquire) {
			return false;
		}
		!self.currently_transacting.swap(true, Ordering::AcqRel)
	}

	pub fn finish_transacting(&self) {
		self.currently_transacting.store(false, Ordering::Release);
	}

	/// Releases the "currently optimizing" flag, called by the external
	/// fusion-transaction builder once it's done (spec §4.5, §1 — the
	/// construction itself is out of this crate's scope).
	pub fn finish_optimizing(&self) {
		self.currently_optimizing.store(false, Ordering::Release);
	}

	/// Hands a caller-prepared raw transaction to the node client and
	/// reports its hash as `CreatedTx`/`CreatedFusionTx` (spec §4.6,
	/// §1 — building and signing the payload is an external collaborator's
	/// job; this facade only submits it and announces the outcome).
	pub async fn submit_transaction(&self, raw_tx_hex: &str, is_fusion: bool) -> Result<H256> {
		let hash = self.node.post_transaction(raw_tx_hex).await?;
		let event = if is_fusion { Event::CreatedFusionTx(hash) } else { Event::CreatedTx(hash) };
		let _ = self.events.send(event);
		Ok(hash)
	}

	/// Drives a single sync round manually: fetch-ahead if backpressure
	/// allows it, then scan and commit up to `blocks_per_tick` stored
	/// blocks. Exposed for embedders that want to drive the wallet from
	/// their own scheduler instead of `start`'s background tickers (and
	/// for deterministic tests of the same code path the sync ticker
	/// runs).
	pub async fn sync_once(&self) -> Result<()> {
		self.sync_tick().await
	}

	/// Starts the three periodic tickers. Idempotent: calling `start` on
	/// an already-running synchronizer is a no-op, matching the teacher's
	/// `broker` modules guarding their own spawn behind a running flag.
	pub fn start(self: &Arc<Self>) {
		let mut tickers = self.tickers.lock();
		if tickers.is_some() {
			return;
		}

		let cancel = Arc::new(Notify::new());

		let sync = tokio::spawn(Self::sync_loop(self.clone(), cancel.clone(), self.config.sync_interval_ms));
		let daemon_info = tokio::spawn(Self::daemon_info_loop(self.clone(), cancel.clone(), self.config.daemon_info_interval_ms));
		let locked_check = tokio::spawn(Self::locked_check_loop(self.clone(), cancel.clone(), self.config.locked_check_interval_ms));

		*tickers = Some(Tickers {
			sync,
			daemon_info,
			locked_check,
			cancel,
		});
	}

	/// Stops all three tickers. Idempotent: stopping a synchronizer that
	/// was never started, or stopping it twice, is a no-op.
	pub async fn stop(&self) {
		let tickers = self.tickers.lock().take();
		if let Some(tickers) = tickers {
			tickers.cancel.notify_waiters();
			let _ = tickers.sync.await;
			let _ = tickers.daemon_info.await;
			let _ = tickers.locked_check.await;
		}
	}

	async fn sync_loop(this: Arc<Self>, cancel: Arc<Notify>, interval_ms: u64) {
		let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
		loop {
			tokio::select! {
				_ = cancel.notified() => return,
				_ = interval.tick() => {
					if let Err(err) = this.sync_tick().await {
						log::warn!("sync tick failed: {}", err);
					}
				}
			}
		}
	}

	async fn daemon_info_loop(this: Arc<Self>, cancel: Arc<Notify>, interval_ms: u64) {
		let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
		loop {
			tokio::select! {
				_ = cancel.notified() => return,
				_ = interval.tick() => {
					this.daemon_info_tick().await;
				}
			}
		}
	}

	async fn locked_check_loop(this: Arc<Self>, cancel: Arc<Notify>, interval_ms: u64) {
		let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
		loop {
			tokio::select! {
				_ = cancel.notified() => return,
				_ = interval.tick() => {
					if let Err(err) = this.locked_check_tick().await {
						log::warn!("locked transaction check failed: {}", err);
					}
				}
			}
		}
	}

	/// Mirrors a reset/rewind the pipeline just applied (immediately, or
	/// after a deferral past an in-flight fetch) into the store's
	/// `SynchronizationStatus`, draining it exactly once (spec §4.1, §9).
	fn apply_pipeline_mutation(&self) {
		if let Some(mutation) = self.pipeline.take_applied_mutation() {
			let mut store = self.store.lock();
			match mutation {
				PendingMutation::Reset { scan_height, .. } => {
					store.sync_status_mut().reset_to(scan_height.saturating_sub(1));
				}
				PendingMutation::Rewind { scan_height } => {
					store.sync_status_mut().rewind_to(scan_height);
				}
			}
		}
	}

	/// One round of the sync ticker: fetch ahead if the pipeline's
	/// backpressure allows it, then scan and commit up to
	/// `config.blocks_per_tick` stored blocks, yielding cooperatively after
	/// each one so event handlers and other tasks on the same executor get
	/// to run before the next block is committed (spec §4.5, §5).
	async fn sync_tick(&self) -> Result<()> {
		if self.currently_optimizing.load(Ordering::Acquire) || self.currently_transacting.load(Ordering::Acquire) {
			// A wallet-initiated optimization or spend owns the store this
			// round; the sync ticker yields rather than racing it.
			return Ok(());
		}

		if self.pipeline.should_fetch_more() {
			let (checkpoints, start_height) = {
				let store = self.store.lock();
				// Own buffered-but-unscanned blocks first (newest first), then
				// the store's persisted checkpoint log, matching spec §4.1 step
				// 2's `stored_block_hashes_desc + recent_hashes +
				// sparse_checkpoints` composition.
				let mut checkpoints = self.pipeline.stored_block_hashes_desc();
				checkpoints.extend(store.sync_status().checkpoints());
				(checkpoints, store.sync_status().height() + 1)
			};
			let skip_coinbase = !self.config.scan_coinbase_transactions;
			match self.pipeline.fetch_once(self.node.as_ref(), checkpoints, start_height, 0, skip_coinbase).await {
				Ok(outcome) => {
					self.apply_pipeline_mutation();
					match outcome {
						FetchOutcome::DeadNode => {
							let _ = self.events.send(Event::DeadNode);
						}
						FetchOutcome::Synced { top_height, top_hash } => {
							let mut store = self.store.lock();
							store.sync_status_mut().add_block(top_height, top_hash, self.config.checkpoint_interval, self.config.recent_window);
							drop(store);
							self.emit_height_change(top_height);
						}
						FetchOutcome::Blocks { .. } | FetchOutcome::AlreadyFetching => {}
					}
				}
				Err(err) => {
					self.apply_pipeline_mutation();
					log::warn!("block fetch failed: {}", err);
				}
			}
		}

		for _ in 0..self.config.blocks_per_tick.max(1) {
			let block = match self.pipeline.peek_next_block() {
				Some(block) => block,
				None => break,
			};
			self.commit_block(&block).await?;
			self.pipeline.drop_block(block.height, block.hash);
			let _ = self.events.send(Event::RawBlock(block.clone()));
			self.emit_height_change(block.height);
			tokio::task::yield_now().await;
		}

		self.run_late_fill().await?;

		Ok(())
	}

	/// Retries the global-index late-fill (spec §4.2, §5) against every
	/// input the store still has no index for, across every block scanned
	/// so far rather than just the block this tick committed. Run once per
	/// sync tick, after the block-commit loop, so `current_height` always
	/// comes from a later tick than whichever one produced the missing
	/// index — the condition `fill_missing_global_indexes` needs to ever
	/// become eligible.
	async fn run_late_fill(&self) -> Result<()> {
		let (current_height, missing) = {
			let store = self.store.lock();
			if store.is_view_only() {
				return Ok(());
			}
			(store.sync_status().height(), store.missing_global_indexes())
		};
		if missing.is_empty() {
			return Ok(());
		}

		let filled = self.engine.fill_missing_global_indexes(self.node.as_ref(), current_height, missing).await?;
		if !filled.is_empty() {
			let mut store = self.store.lock();
			for (key_image, global_index) in filled {
				store.set_global_output_index(&key_image, global_index)?;
			}
		}
		Ok(())
	}

	fn emit_height_change(&self, wallet_height: u64) {
		let _ = self.events.send(Event::HeightChange {
			wallet: wallet_height,
			local: self.last_local_height.load(Ordering::Relaxed),
			network: self.last_network_height.load(Ordering::Relaxed),
		});
	}

	/// Scans `block`, rolling the store back first if `block` forks an
	/// already-processed height, then commits its attributed
	/// inputs/transactions and the advanced checkpoint atomically, pruning
	/// spent inputs past `prune_interval` as part of the same commit (spec
	/// §4.2, §4.3, §9). The global-index late-fill for any input this block
	/// contributes without one runs separately, once a later tick's height
	/// actually clears the late-fill window — see
	/// [`run_late_fill`](Self::run_late_fill).
	async fn commit_block(&self, block: &Block) -> Result<()> {
		let forked = {
			let store = self.store.lock();
			let height = store.sync_status().height();
			height > 0 && block.height <= height
		};
		if forked {
			let fork_height = block.height.saturating_sub(1);
			log::warn!("fork detected at height {}: rolling back to {}", block.height, fork_height);
			self.store.lock().remove_forked_transactions(fork_height)?;
		}

		let data = {
			let store = self.store.lock();
			self.engine.process_block(block, &store, self.config.scan_coinbase_transactions)?
		};

		{
			let mut store = self.store.lock();
			for (owner, input) in data.inputs_to_add {
				store.store_transaction_input(&owner, input, block.height, block.timestamp)?;
			}
			for (owner, key_image) in &data.key_images_to_mark_spent {
				store.mark_input_as_spent(owner, key_image, block.height)?;
			}
			for tx in &data.transactions_to_add {
				store.add_transaction(tx.clone())?;
			}
			store.sync_status_mut().add_block(block.height, block.hash, self.config.checkpoint_interval, self.config.recent_window);
			store.record_block_timestamp(block.height, block.timestamp, self.config.checkpoint_interval);

			let prune_interval = self.config.prune_interval.max(1);
			if block.height % prune_interval == 0 {
				store.prune_spent_inputs(block.height.saturating_sub(prune_interval));
			}
		}

		for tx in data.transactions_to_add {
			let total: i64 = tx.transfers.values().sum();
			let event = if tx.is_fusion() {
				Event::FusionTx(tx.clone())
			} else if total >= 0 {
				Event::IncomingTx(tx.clone())
			} else {
				Event::OutgoingTx(tx.clone())
			};
			let _ = self.events.send(Event::Transaction(tx));
			let _ = self.events.send(event);
		}

		Ok(())
	}

	/// Daemon-info ticker round (spec §4.5): polls `/info`, emits
	/// `Connect`/`Disconnect` on edge transitions, reports the freshest
	/// `HeightChange`, and fires `Sync`/`Desync` when `wallet_height >=
	/// network_height` crosses. On reaching synced, triggers the
	/// auto-optimization handoff if enabled and no transaction/optimization
	/// is already in flight.
	async fn daemon_info_tick(&self) {
		match self.node.get_info().await {
			Ok(info) => {
				if !self.connected.swap(true, Ordering::AcqRel) {
					let _ = self.events.send(Event::Connect);
				}
				self.last_local_height.store(info.height, Ordering::Relaxed);
				self.last_network_height.store(info.network_height, Ordering::Relaxed);

				let wallet_height = self.height();
				let _ = self.events.send(Event::HeightChange {
					wallet: wallet_height,
					local: info.height,
					network: info.network_height,
				});

				let now_synced = wallet_height >= info.network_height;
				let was_synced = self.synced.swap(now_synced, Ordering::AcqRel);
				if now_synced && !was_synced {
					let _ = self.events.send(Event::Sync);
					if self.config.auto_optimize_enabled
						&& !self.currently_transacting.load(Ordering::Acquire)
						&& !self.currently_optimizing.swap(true, Ordering::AcqRel)
					{
						log::info!("synced: handing off to background fusion-transaction optimization");
					}
				} else if !now_synced && was_synced {
					let _ = self.events.send(Event::Desync);
				}
			}
			Err(_) => {
				if self.connected.swap(false, Ordering::AcqRel) {
					let _ = self.events.send(Event::Disconnect);
				}
			}
		}
	}

	/// Locked-transaction cancellation tick (spec §4.4): batches every
	/// still-pending outbound transaction hash into one `/transaction/status`
	/// query, resets the miss counter for any the node still knows about,
	/// and advances it for the rest, cancelling past
	/// `locked_tx_missing_threshold` consecutive misses.
	async fn locked_check_tick(&self) -> Result<()> {
		let hashes = self.store.lock().get_locked_transaction_hashes();
		if hashes.is_empty() {
			return Ok(());
		}
		let not_found: HashSet<H256> = self.node.get_cancelled_transactions(&hashes).await?.into_iter().collect();
		let mut store = self.store.lock();
		for hash in hashes {
			if not_found.contains(&hash) {
				store.tick_locked_transaction_miss(&hash)?;
			} else {
				store.reset_locked_transaction_miss(&hash);
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::crypto::DefaultCryptoOps;
	use crate::node_client::mock::MockNodeClient;
	use crate::node_client::SyncResponse;
	use crate::types::Point;

	fn synchronizer() -> Arc<WalletSynchronizer> {
		synchronizer_with_node(Arc::new(MockNodeClient::new())).0
	}

	fn synchronizer_with_node(node: Arc<MockNodeClient>) -> (Arc<WalletSynchronizer>, Arc<MockNodeClient>) {
		let crypto = Arc::new(DefaultCryptoOps::new());
		let store = SubWalletsStore::new(Point([1u8; 32]), Some(crate::types::SecretKey([2u8; 32])));
		let synchronizer = Arc::new(WalletSynchronizer::new(node.clone(), store, crypto, Config::default()));
		(synchronizer, node)
	}

	fn sample_block(height: u64) -> Block {
		Block {
			height,
			hash: H256([height as u8; 32]),
			timestamp: 0,
			coinbase: None,
			transactions: vec![],
		}
	}

	#[test]
	fn starts_connected_before_any_daemon_info_tick() {
		let sync = synchronizer();
		assert!(sync.is_connected());
	}

	#[tokio::test]
	async fn start_is_idempotent() {
		let sync = synchronizer();
		sync.start();
		sync.start();
		sync.stop().await;
	}

	#[tokio::test]
	async fn sync_tick_commits_every_fetched_block_up_to_the_per_tick_cap() {
		let (sync, node) = synchronizer_with_node(Arc::new(MockNodeClient::new()));
		node.push_sync_response(SyncResponse {
			blocks: vec![sample_block(1), sample_block(2)],
			synced: true,
			top_block: None,
		});

		sync.sync_tick().await.unwrap();

		assert_eq!(sync.height(), 2);
		assert_eq!(sync.pipeline.stored_block_count(), 0);
	}

	#[tokio::test]
	async fn fork_rolls_back_before_attributing_the_replacing_block() {
		let (sync, node) = synchronizer_with_node(Arc::new(MockNodeClient::new()));
		node.push_sync_response(SyncResponse {
			blocks: vec![sample_block(1), sample_block(2)],
			synced: true,
			top_block: None,
		});
		sync.sync_tick().await.unwrap();
		assert_eq!(sync.height(), 2);

		// A competing block at height 2 with a different hash: the store
		// must roll back to height 1 before attributing it.
		let mut forked = sample_block(2);
		forked.hash = H256([99u8; 32]);
		node.push_sync_response(SyncResponse {
			blocks: vec![forked],
			synced: true,
			top_block: None,
		});
		sync.sync_tick().await.unwrap();

		assert_eq!(sync.height(), 2);
		let store = sync.store.lock();
		assert_eq!(store.sync_status().hash_at(2), Some(H256([99u8; 32])));
	}

	#[tokio::test]
	async fn stop_without_start_is_a_no_op() {
		let sync = synchronizer();
		sync.stop().await;
	}

	#[tokio::test]
	async fn submit_transaction_announces_the_submitted_hash() {
		let sync = synchronizer();
		let mut events = sync.subscribe();

		let hash = sync.submit_transaction("deadbeef", false).await.unwrap();
		assert_eq!(hash, H256::ZERO); // MockNodeClient's fixed post_transaction answer

		let event = events.try_recv().unwrap();
		assert!(matches!(event, Event::CreatedTx(h) if h == hash));
	}

	#[tokio::test]
	async fn reset_clears_the_pipeline_and_rewinds_sync_status() {
		let (sync, node) = synchronizer_with_node(Arc::new(MockNodeClient::new()));
		node.push_sync_response(SyncResponse {
			blocks: vec![sample_block(1), sample_block(2), sample_block(3)],
			synced: true,
			top_block: None,
		});
		sync.sync_tick().await.unwrap();
		assert_eq!(sync.height(), 3);

		sync.reset(1, 0);
		assert_eq!(sync.height(), 0);
	}
}
