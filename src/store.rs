//! Subwallet state and balance machine (spec §4.4).
//!
//! `SubWalletsStore` is the single source of truth for every owned input,
//! attributed transaction, and key-image ownership record. It is a
//! concrete struct rather than a trait: unlike the node client, there is
//! only ever one storage shape in this engine (in-memory, persisted by the
//! caller as a whole via `serde`), so a trait seam here would buy nothing
//! (spec §9, Open Question 1 — a "Walletbackend" trait the teacher has for
//! swappable storage engines isn't load-bearing for this spec's scope).

use std::collections::{HashMap, HashSet};

use crate::error::{ErrorKind, Result};
use crate::sync_status::SynchronizationStatus;
use crate::types::{is_input_unlocked, KeyImage, PublicKey, SecretKey, Transaction, TransactionInput, H256};

/// Number of consecutive sync rounds a locked transaction's inputs can go
/// unconfirmed in the node's response before the store cancels it and
/// returns its inputs to unspent (spec §4.4).
pub const LOCKED_TX_MISSING_THRESHOLD: u32 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubWalletsStore {
	subwallets: HashMap<PublicKey, crate::types::SubWallet>,
	public_view_key: PublicKey,
	private_view_key: Option<SecretKey>,

	/// All attributed transactions, keyed by hash. A transaction can touch
	/// more than one subwallet, so it's not nested under any one of them.
	transactions: HashMap<H256, Transaction>,

	/// Reverse index from key image to the subwallet that owns the input,
	/// maintained alongside `subwallets` so ownership lookups during
	/// scanning don't need a linear scan (spec §4.2).
	key_image_owners: HashMap<KeyImage, PublicKey>,

	/// Consecutive-miss counters for transactions with still-locked
	/// inputs, used to drive the threshold cancellation in
	/// `tick_locked_transaction_miss`.
	locked_miss_counts: HashMap<H256, u32>,

	/// Consecutive misses before a locked transaction is cancelled (spec
	/// §4.4, `Config::locked_tx_missing_threshold`). Threaded in at
	/// construction rather than read off a module constant, so editing the
	/// config actually changes this behavior.
	#[serde(default = "default_locked_tx_missing_threshold")]
	locked_tx_missing_threshold: u32,

	/// Sparse `(height, timestamp)` samples, one roughly every
	/// `checkpoint_interval` processed blocks, used by
	/// `convert_sync_timestamp_to_height` to answer "what height was the
	/// chain at around this wall-clock time" without keeping every block's
	/// timestamp forever.
	#[serde(default)]
	timestamp_checkpoints: Vec<(u64, u64)>,

	sync_status: SynchronizationStatus,
}

fn default_locked_tx_missing_threshold() -> u32 {
	LOCKED_TX_MISSING_THRESHOLD
}

use serde::{Deserialize, Serialize};

impl SubWalletsStore {
	pub fn new(public_view_key: PublicKey, private_view_key: Option<SecretKey>) -> Self {
		Self::with_locked_tx_missing_threshold(public_view_key, private_view_key, LOCKED_TX_MISSING_THRESHOLD)
	}

	/// Same as [`new`](Self::new) but with `Config::locked_tx_missing_threshold`
	/// threaded through explicitly (spec §6).
	pub fn with_locked_tx_missing_threshold(public_view_key: PublicKey, private_view_key: Option<SecretKey>, locked_tx_missing_threshold: u32) -> Self {
		SubWalletsStore {
			subwallets: HashMap::new(),
			public_view_key,
			private_view_key,
			transactions: HashMap::new(),
			key_image_owners: HashMap::new(),
			locked_miss_counts: HashMap::new(),
			locked_tx_missing_threshold,
			timestamp_checkpoints: Vec::new(),
			sync_status: SynchronizationStatus::new(),
		}
	}

	pub fn public_view_key(&self) -> &PublicKey {
		&self.public_view_key
	}

	pub fn private_view_key(&self) -> Option<&SecretKey> {
		self.private_view_key.as_ref()
	}

	pub fn sync_status(&self) -> &SynchronizationStatus {
		&self.sync_status
	}

	pub fn sync_status_mut(&mut self) -> &mut SynchronizationStatus {
		&mut self.sync_status
	}

	// -- subwallet lifecycle --------------------------------------------

	pub fn add_subwallet(&mut self, public_spend_key: PublicKey, private_spend_key: Option<SecretKey>, scan_height: u64, scan_timestamp: u64) {
		self.subwallets.insert(
			public_spend_key,
			crate::types::SubWallet::new(public_spend_key, private_spend_key, scan_height, scan_timestamp),
		);
	}

	/// Identical to `add_subwallet`, distinguished at the call site to
	/// mirror spec §4.4's separate import vs. create operations; imported
	/// subwallets are expected to carry a caller-chosen `scan_height` in
	/// the past rather than the chain's current height.
	pub fn import_subwallet(&mut self, public_spend_key: PublicKey, private_spend_key: Option<SecretKey>, scan_height: u64, scan_timestamp: u64) {
		self.add_subwallet(public_spend_key, private_spend_key, scan_height, scan_timestamp);
	}

	pub fn delete_subwallet(&mut self, public_spend_key: &PublicKey) -> Result<()> {
		let removed = self
			.subwallets
			.remove(public_spend_key)
			.ok_or_else(|| ErrorKind::SubwalletNotFound(public_spend_key.to_string()))?;
		for input in removed.unspent.iter().chain(removed.spent.iter()).chain(removed.locked.iter()) {
			self.key_image_owners.remove(&input.key_image);
		}
		Ok(())
	}

	pub fn get_public_spend_keys(&self) -> Vec<PublicKey> {
		self.subwallets.keys().copied().collect()
	}

	pub fn get_subwallet(&self, public_spend_key: &PublicKey) -> Result<&crate::types::SubWallet> {
		self.subwallets
			.get(public_spend_key)
			.ok_or_else(|| ErrorKind::SubwalletNotFound(public_spend_key.to_string()).into())
	}

	// -- key image / input bookkeeping ------------------------------------

	pub fn get_key_image_owner(&self, key_image: &KeyImage) -> Option<PublicKey> {
		self.key_image_owners.get(key_image).copied()
	}

	pub fn get_tx_input_key_image(&self, owner: &PublicKey, parent_tx_hash: &H256, tx_output_index: usize) -> Option<KeyImage> {
		let subwallet = self.subwallets.get(owner)?;
		subwallet
			.unspent
			.iter()
			.chain(subwallet.spent.iter())
			.chain(subwallet.locked.iter())
			.find(|input| input.parent_tx_hash == *parent_tx_hash && input.tx_output_index == tx_output_index)
			.map(|input| input.key_image)
	}

	/// Records a newly-scanned owned input, filing it into the locked or
	/// unspent bucket depending on whether its unlock time has already
	/// passed at `current_height`/`now` (spec §4.2, §4.4).
	pub fn store_transaction_input(&mut self, owner: &PublicKey, input: TransactionInput, current_height: u64, now: u64) -> Result<()> {
		let unlocked = is_input_unlocked(input.unlock_time, current_height, now);
		self.key_image_owners.insert(input.key_image, *owner);
		let subwallet = self
			.subwallets
			.get_mut(owner)
			.ok_or_else(|| ErrorKind::SubwalletNotFound(owner.to_string()))?;
		if unlocked {
			subwallet.unspent.push(input);
		} else {
			subwallet.locked.push(input);
		}
		Ok(())
	}

	/// Marks an owned input spent, moving it from unspent/locked into the
	/// spent bucket. A no-op on the key-image-ownership invariant (spec
	/// §3): the input stays owned by the same subwallet, only its bucket
	/// changes.
	pub fn mark_input_as_spent(&mut self, owner: &PublicKey, key_image: &KeyImage, spend_height: u64) -> Result<()> {
		let subwallet = self
			.subwallets
			.get_mut(owner)
			.ok_or_else(|| ErrorKind::SubwalletNotFound(owner.to_string()))?;

		let position = subwallet
			.unspent
			.iter()
			.position(|i| i.key_image == *key_image)
			.map(|idx| (idx, false))
			.or_else(|| subwallet.locked.iter().position(|i| i.key_image == *key_image).map(|idx| (idx, true)));

		match position {
			Some((idx, was_locked)) => {
				let mut input = if was_locked {
					subwallet.locked.remove(idx)
				} else {
					subwallet.unspent.remove(idx)
				};
				input.spend_height = spend_height;
				subwallet.spent.push(input);
				Ok(())
			}
			None => Err(ErrorKind::ScanIntegrityError(format!("key image {} not found among owned inputs", key_image)).into()),
		}
	}

	pub fn unlock_matured_inputs(&mut self, current_height: u64, now: u64) {
		for subwallet in self.subwallets.values_mut() {
			let mut still_locked = Vec::new();
			for input in subwallet.locked.drain(..) {
				if is_input_unlocked(input.unlock_time, current_height, now) {
					subwallet.unspent.push(input);
				} else {
					still_locked.push(input);
				}
			}
			subwallet.locked = still_locked;
		}
	}

	// -- transactions ------------------------------------------------------

	pub fn add_transaction(&mut self, transaction: Transaction) -> Result<()> {
		if !transaction.is_confirmed() {
			self.locked_miss_counts.entry(transaction.hash).or_insert(0);
		}
		self.transactions.insert(transaction.hash, transaction);
		Ok(())
	}

	pub fn get_transaction(&self, hash: &H256) -> Option<&Transaction> {
		self.transactions.get(hash)
	}

	pub fn get_unconfirmed_transactions(&self) -> Vec<&Transaction> {
		self.transactions.values().filter(|tx| !tx.is_confirmed()).collect()
	}

	pub fn get_locked_transaction_hashes(&self) -> Vec<H256> {
		self.locked_miss_counts.keys().copied().collect()
	}

	/// Advances the missing-count for a locked transaction whose inputs
	/// were not found confirmed in this sync round, cancelling it once it
	/// crosses `locked_tx_missing_threshold` (spec §4.4).
	///
	/// Returns `true` if the transaction was cancelled as a result.
	pub fn tick_locked_transaction_miss(&mut self, hash: &H256) -> Result<bool> {
		let count = self.locked_miss_counts.entry(*hash).or_insert(0);
		*count += 1;
		let count = *count;
		log::debug!("locked transaction {} missed {}/{} checks", hash, count, self.locked_tx_missing_threshold);
		if count >= self.locked_tx_missing_threshold {
			log::info!("cancelling locked transaction {} after {} consecutive misses", hash, count);
			self.remove_cancelled_transaction(hash)?;
			return Ok(true);
		}
		Ok(false)
	}

	pub fn reset_locked_transaction_miss(&mut self, hash: &H256) {
		self.locked_miss_counts.insert(*hash, 0);
	}

	/// Cancels a locked transaction: returns its locked inputs to unspent
	/// (the outgoing spend never confirmed) and drops the transaction and
	/// its miss counter.
	pub fn remove_cancelled_transaction(&mut self, hash: &H256) -> Result<()> {
		log::info!("reverting locked inputs of cancelled transaction {} to unspent", hash);
		self.transactions.remove(hash);
		self.locked_miss_counts.remove(hash);
		for subwallet in self.subwallets.values_mut() {
			let mut still_locked = Vec::new();
			for input in subwallet.locked.drain(..) {
				if input.parent_tx_hash == *hash {
					subwallet.unspent.push(input);
				} else {
					still_locked.push(input);
				}
			}
			subwallet.locked = still_locked;
		}
		Ok(())
	}

	/// Rolls every piece of chain-derived state back to `fork_height` on a
	/// reorg (spec §4.3): drops transactions/inputs above the fork point
	/// and un-marks inputs spent above it back to unspent, all-or-nothing
	/// per the atomic-commit invariant (spec §9, Open Question resolved).
	pub fn remove_forked_transactions(&mut self, fork_height: u64) -> Result<()> {
		self.transactions.retain(|_, tx| tx.block_height == 0 || tx.block_height <= fork_height);

		for subwallet in self.subwallets.values_mut() {
			let (keep, drop): (Vec<_>, Vec<_>) = std::mem::take(&mut subwallet.unspent)
				.into_iter()
				.partition(|input| input.block_height <= fork_height);
			subwallet.unspent = keep;
			for input in &drop {
				self.key_image_owners.remove(&input.key_image);
			}

			let (keep, drop): (Vec<_>, Vec<_>) = std::mem::take(&mut subwallet.locked)
				.into_iter()
				.partition(|input| input.block_height <= fork_height);
			subwallet.locked = keep;
			for input in &drop {
				self.key_image_owners.remove(&input.key_image);
			}

			let mut kept_spent = Vec::new();
			for mut input in std::mem::take(&mut subwallet.spent) {
				if input.block_height > fork_height {
					self.key_image_owners.remove(&input.key_image);
					continue;
				}
				if input.spend_height > fork_height {
					input.spend_height = 0;
					subwallet.unspent.push(input);
				} else {
					kept_spent.push(input);
				}
			}
			subwallet.spent = kept_spent;
		}

		self.sync_status.rewind_to(fork_height);
		self.timestamp_checkpoints.retain(|(h, _)| *h <= fork_height);
		Ok(())
	}

	/// Drops spent inputs confirmed at or below `before_height` that are
	/// no longer needed to serve balance queries at the wallet's scan
	/// horizon, bounding the store's long-run size.
	pub fn prune_spent_inputs(&mut self, before_height: u64) {
		for subwallet in self.subwallets.values_mut() {
			let (keep, drop): (Vec<_>, Vec<_>) = std::mem::take(&mut subwallet.spent)
				.into_iter()
				.partition(|input| input.spend_height == 0 || input.spend_height > before_height);
			subwallet.spent = keep;
			for input in &drop {
				self.key_image_owners.remove(&input.key_image);
			}
		}
	}

	// -- balances -----------------------------------------------------------

	/// `(unlocked, locked)` balance across all subwallets, or a single one
	/// if `owner` is given.
	pub fn get_balance(&self, owner: Option<&PublicKey>, current_height: u64, now: u64) -> Result<(u64, u64)> {
		let subwallets: Vec<&crate::types::SubWallet> = match owner {
			Some(key) => vec![self.get_subwallet(key)?],
			None => self.subwallets.values().collect(),
		};

		let mut unlocked = 0u64;
		let mut locked = 0u64;
		for subwallet in subwallets {
			for input in &subwallet.unspent {
				unlocked = unlocked.saturating_add(input.amount);
			}
			for input in &subwallet.locked {
				if is_input_unlocked(input.unlock_time, current_height, now) {
					unlocked = unlocked.saturating_add(input.amount);
				} else {
					locked = locked.saturating_add(input.amount);
				}
			}
		}
		Ok((unlocked, locked))
	}

	/// Records a `(height, timestamp)` sample roughly every
	/// `checkpoint_interval` processed blocks (spec §6), so
	/// `convert_sync_timestamp_to_height` has real wall-clock data to
	/// search instead of comparing a timestamp against a height directly.
	pub fn record_block_timestamp(&mut self, height: u64, timestamp: u64, checkpoint_interval: u64) {
		let due = height % checkpoint_interval.max(1) == 0;
		if due || self.timestamp_checkpoints.is_empty() {
			self.timestamp_checkpoints.push((height, timestamp));
		}
	}

	/// Translates a wall-clock `timestamp` to the height the chain was
	/// likely at around that time, clamped to `current_height` (spec
	/// §4.4's `convert_sync_timestamp_to_height(ts, h)`). Used when
	/// importing a subwallet by creation date rather than height: an
	/// approximate height to start scanning from, never a timestamp
	/// compared directly against a height. Returns 0 if no block has been
	/// processed yet.
	pub fn convert_sync_timestamp_to_height(&self, timestamp: u64, current_height: u64) -> u64 {
		self.timestamp_checkpoints
			.iter()
			.filter(|(_, ts)| *ts <= timestamp)
			.map(|(height, _)| *height)
			.max()
			.unwrap_or(0)
			.min(current_height)
	}

	/// True iff no subwallet in the store holds a private spend key, in
	/// which case nothing it scans can ever be spent locally and the
	/// global-index late-fill is pointless overhead (spec §4.2).
	pub fn is_view_only(&self) -> bool {
		self.subwallets.values().all(|s| s.is_view_only())
	}

	/// All key images known to belong to this store, used by the
	/// attribution engine to recognise a subwallet's own spends in fresh
	/// blocks (spec §4.2).
	pub fn known_key_images(&self) -> HashSet<KeyImage> {
		self.key_image_owners.keys().copied().collect()
	}

	/// Every owned input still missing its `global_output_index`, across
	/// every subwallet and bucket, for the coordinator to hand to
	/// `AttributionEngine::fill_missing_global_indexes` on a later sync tick
	/// (spec §4.2, §5). Persisted implicitly as part of the input itself
	/// rather than tracked separately, so nothing is lost across restarts.
	pub fn missing_global_indexes(&self) -> Vec<MissingGlobalIndex> {
		let mut out = Vec::new();
		for subwallet in self.subwallets.values() {
			for input in subwallet.unspent.iter().chain(subwallet.locked.iter()).chain(subwallet.spent.iter()) {
				if input.global_output_index.is_none() {
					out.push(MissingGlobalIndex {
						key_image: input.key_image,
						parent_tx_hash: input.parent_tx_hash,
						tx_output_index: input.tx_output_index,
						block_height: input.block_height,
					});
				}
			}
		}
		out
	}

	/// Writes a resolved global output index back into the owned input it
	/// belongs to, found by key image across every bucket (spec §4.2, §5).
	pub fn set_global_output_index(&mut self, key_image: &KeyImage, global_index: u64) -> Result<()> {
		let owner = self
			.key_image_owners
			.get(key_image)
			.copied()
			.ok_or_else(|| ErrorKind::ScanIntegrityError(format!("key image {} not found while filling global index", key_image)))?;
		let subwallet = self
			.subwallets
			.get_mut(&owner)
			.ok_or_else(|| ErrorKind::SubwalletNotFound(owner.to_string()))?;
		for input in subwallet.unspent.iter_mut().chain(subwallet.locked.iter_mut()).chain(subwallet.spent.iter_mut()) {
			if input.key_image == *key_image {
				input.global_output_index = Some(global_index);
				return Ok(());
			}
		}
		Err(ErrorKind::ScanIntegrityError(format!("key image {} not found among owned inputs while filling global index", key_image)).into())
	}
}

/// A still-unresolved global output index, carried by the store across sync
/// ticks until the late-fill window has passed and the node can meaningfully
/// be asked for it (spec §4.2, §5).
#[derive(Clone, Debug)]
pub struct MissingGlobalIndex {
	pub key_image: KeyImage,
	pub parent_tx_hash: H256,
	pub tx_output_index: usize,
	pub block_height: u64,
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::types::{Point, SecretKey as SK};

	fn pk(byte: u8) -> PublicKey {
		Point([byte; 32])
	}

	fn sample_input(key_image: KeyImage, amount: u64, block_height: u64, unlock_time: u64) -> TransactionInput {
		TransactionInput {
			key_image,
			amount,
			block_height,
			tx_public_key: Point([9u8; 32]),
			tx_output_index: 0,
			global_output_index: Some(42),
			output_key: Point([8u8; 32]),
			spend_height: 0,
			unlock_time,
			parent_tx_hash: H256([7u8; 32]),
			private_ephemeral: SK([1u8; 32]),
		}
	}

	#[test]
	fn store_and_spend_round_trip() {
		let mut store = SubWalletsStore::new(pk(1), Some(SK([2u8; 32])));
		store.add_subwallet(pk(3), Some(SK([4u8; 32])), 0, 0);
		let key_image = pk(5);
		let input = sample_input(key_image, 1000, 10, 0);
		store.store_transaction_input(&pk(3), input, 10, 0).unwrap();

		assert_eq!(store.get_key_image_owner(&key_image), Some(pk(3)));
		assert_eq!(store.get_balance(None, 10, 0).unwrap(), (1000, 0));

		store.mark_input_as_spent(&pk(3), &key_image, 20).unwrap();
		assert_eq!(store.get_balance(None, 20, 0).unwrap(), (0, 0));
	}

	#[test]
	fn locked_input_counts_as_locked_balance_until_unlocked() {
		let mut store = SubWalletsStore::new(pk(1), None);
		store.add_subwallet(pk(3), None, 0, 0);
		let input = sample_input(pk(5), 500, 10, 100);
		store.store_transaction_input(&pk(3), input, 10, 0).unwrap();

		assert_eq!(store.get_balance(None, 10, 0).unwrap(), (0, 500));
		store.unlock_matured_inputs(100, 0);
		assert_eq!(store.get_balance(None, 100, 0).unwrap(), (500, 0));
	}

	#[test]
	fn convert_sync_timestamp_to_height_finds_the_nearest_sample_at_or_before() {
		let mut store = SubWalletsStore::new(pk(1), None);
		store.record_block_timestamp(5_000, 1_000_000, 5_000);
		store.record_block_timestamp(10_000, 2_000_000, 5_000);

		assert_eq!(store.convert_sync_timestamp_to_height(1_500_000, 20_000), 5_000);
		assert_eq!(store.convert_sync_timestamp_to_height(2_500_000, 20_000), 10_000);
		// Nothing recorded before this timestamp: falls back to height 0.
		assert_eq!(store.convert_sync_timestamp_to_height(500_000, 20_000), 0);
	}

	#[test]
	fn locked_tx_cancels_after_threshold_misses() {
		let mut store = SubWalletsStore::new(pk(1), None);
		let hash = H256([42u8; 32]);
		store.add_transaction(Transaction {
			transfers: HashMap::new(),
			hash,
			fee: 0,
			block_height: 0,
			timestamp: 0,
			payment_id: String::new(),
			unlock_time: 0,
			is_coinbase: false,
		}).unwrap();

		for _ in 0..(LOCKED_TX_MISSING_THRESHOLD - 1) {
			assert!(!store.tick_locked_transaction_miss(&hash).unwrap());
		}
		assert!(store.tick_locked_transaction_miss(&hash).unwrap());
		assert!(store.get_transaction(&hash).is_none());
	}

	#[test]
	fn fork_rollback_restores_spent_inputs_and_drops_future_ones() {
		let mut store = SubWalletsStore::new(pk(1), None);
		store.add_subwallet(pk(3), None, 0, 0);

		let surviving = sample_input(pk(10), 100, 5, 0);
		let forked = sample_input(pk(11), 200, 15, 0);
		store.store_transaction_input(&pk(3), surviving, 5, 0).unwrap();
		store.store_transaction_input(&pk(3), forked, 15, 0).unwrap();
		store.mark_input_as_spent(&pk(3), &pk(10), 12).unwrap();

		store.remove_forked_transactions(10).unwrap();

		assert!(store.get_key_image_owner(&pk(11)).is_none());
		let subwallet = store.get_subwallet(&pk(3)).unwrap();
		assert!(subwallet.unspent.iter().any(|i| i.key_image == pk(10)));
		assert!(subwallet.spent.is_empty());
	}
}
