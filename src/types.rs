//! Core data model (spec §3): blocks, raw transactions, owned inputs,
//! attributed transactions, and subwallets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::ser::fixed32_serde;

/// 32-byte hash (block hash, transaction hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct H256(#[serde(with = "fixed32_serde")] pub [u8; 32]);

impl H256 {
	pub const ZERO: H256 = H256([0u8; 32]);

	pub fn from_slice(bytes: &[u8]) -> Option<Self> {
		if bytes.len() != 32 {
			return None;
		}
		let mut out = [0u8; 32];
		out.copy_from_slice(bytes);
		Some(H256(out))
	}
}

impl fmt::Debug for H256 {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "H256({})", hex::encode(self.0))
	}
}

impl fmt::Display for H256 {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

/// A compressed Edwards curve point used as a public key: transaction
/// public key, one-time output key, one-time spend key, or key image.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point(#[serde(with = "fixed32_serde")] pub [u8; 32]);

impl Point {
	pub const ZERO: Point = Point([0u8; 32]);

	/// True for the all-zero sentinel used to mark a view-only wallet's
	/// missing private spend key, or a view-only scan's null key image.
	pub fn is_null(&self) -> bool {
		self.0 == [0u8; 32]
	}
}

impl fmt::Debug for Point {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Point({})", hex::encode(self.0))
	}
}

impl fmt::Display for Point {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

/// A key image, identical in representation to `Point` but distinguished by
/// type so call sites can't accidentally compare a spend key to a key image.
pub type KeyImage = Point;
/// A public spend or view key.
pub type PublicKey = Point;

/// A 32-byte scalar (private key / private ephemeral). Zeroized on drop so
/// secret material doesn't linger in memory past its useful lifetime.
#[derive(Clone, Copy, PartialEq, Eq, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
	pub const ZERO: SecretKey = SecretKey([0u8; 32]);

	pub fn is_null(&self) -> bool {
		self.0 == [0u8; 32]
	}
}

impl fmt::Debug for SecretKey {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "SecretKey(..)")
	}
}

/// A single one-time output inside a [`RawTx`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyOutput {
	pub key: Point,
	pub amount: u64,
	/// Network-wide ordinal of this output among all outputs of the same
	/// amount. Absent until filled in by the node (spec §4.2 late-fill).
	pub global_index: Option<u64>,
}

/// A single spent input inside a [`RawTx`], referenced by its nullifying
/// key image.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyInput {
	pub amount: u64,
	pub key_image: KeyImage,
}

/// A transaction as it appears on the wire / inside a [`Block`], before
/// attribution to any subwallet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawTx {
	pub hash: H256,
	pub public_key: Point,
	pub unlock_time: u64,
	pub payment_id: String,
	pub key_outputs: Vec<KeyOutput>,
	pub key_inputs: Vec<KeyInput>,
}

/// A block as streamed from the node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
	pub height: u64,
	pub hash: H256,
	pub timestamp: u64,
	pub coinbase: Option<RawTx>,
	pub transactions: Vec<RawTx>,
}

/// An owned, one-time output detected by the attribution engine and stored
/// against a subwallet.
///
/// Immutable once created, except for `spend_height` (set when its key
/// image is later observed as spent) and `global_output_index` (late-filled
/// by a follow-up node query).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionInput {
	pub key_image: KeyImage,
	pub amount: u64,
	pub block_height: u64,
	pub tx_public_key: Point,
	pub tx_output_index: usize,
	pub global_output_index: Option<u64>,
	pub output_key: Point,
	/// `0` iff unspent.
	pub spend_height: u64,
	pub unlock_time: u64,
	pub parent_tx_hash: H256,
	/// Null sentinel for view-only wallets, which can't derive the
	/// one-time private key and so can't ever mark this input spent
	/// themselves.
	pub private_ephemeral: SecretKey,
}

impl TransactionInput {
	pub fn is_unspent(&self) -> bool {
		self.spend_height == 0
	}
}

/// An attributed transaction: the net effect of a block's transaction on
/// zero or more of the wallet's subwallets.
///
/// `sum(transfers.values())` is the net change for this transaction across
/// all owned subwallets: positive for an incoming transfer, negative for an
/// outgoing one, and zero for a fusion (self-to-self) transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
	pub transfers: HashMap<PublicKey, i64>,
	pub hash: H256,
	pub fee: u64,
	pub block_height: u64,
	pub timestamp: u64,
	pub payment_id: String,
	pub unlock_time: u64,
	pub is_coinbase: bool,
}

impl Transaction {
	pub fn is_fusion(&self) -> bool {
		!self.transfers.is_empty() && self.transfers.values().sum::<i64>() == 0
	}

	pub fn is_confirmed(&self) -> bool {
		self.block_height > 0
	}
}

/// One of the wallet's subwallets: a (public, optional private) spend-key
/// pair sharing the wallet-wide view key.
///
/// Invariant: a given key image appears in exactly one of
/// `unspent`/`spent`/`locked`, across all subwallets in the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubWallet {
	pub public_spend_key: PublicKey,
	pub private_spend_key: Option<SecretKey>,
	pub unspent: Vec<TransactionInput>,
	pub spent: Vec<TransactionInput>,
	pub locked: Vec<TransactionInput>,
	pub scan_height: u64,
	pub scan_timestamp: u64,
}

impl SubWallet {
	pub fn new(
		public_spend_key: PublicKey,
		private_spend_key: Option<SecretKey>,
		scan_height: u64,
		scan_timestamp: u64,
	) -> Self {
		SubWallet {
			public_spend_key,
			private_spend_key,
			unspent: Vec::new(),
			spent: Vec::new(),
			locked: Vec::new(),
			scan_height,
			scan_timestamp,
		}
	}

	/// A subwallet signs by deriving key images from its private spend key;
	/// without one it can only observe receipts (spec §1, §4.2).
	pub fn is_view_only(&self) -> bool {
		self.private_spend_key.is_none()
	}
}

/// The result of scanning a single block (spec §3): fresh records the
/// attribution engine hands to the store, never held onto by the engine
/// itself.
#[derive(Clone, Debug, Default)]
pub struct TransactionData {
	pub transactions_to_add: Vec<Transaction>,
	pub inputs_to_add: Vec<(PublicKey, TransactionInput)>,
	pub key_images_to_mark_spent: Vec<(PublicKey, KeyImage)>,
}

/// `unlock_time >= 2^32` is interpreted as a wall-clock timestamp (seconds)
/// rather than a block height (spec §4.4).
pub const MAX_BLOCK_NUMBER: u64 = 1 << 32;

/// Lock rule from spec §4.4: `unlock_time == 0` is always unlocked; above
/// [`MAX_BLOCK_NUMBER`] it's a wall-clock deadline, otherwise a block
/// height with `current_height + 1 >= unlock_time` unlocking it.
pub fn is_input_unlocked(unlock_time: u64, current_height: u64, now: u64) -> bool {
	if unlock_time == 0 {
		return true;
	}
	if unlock_time >= MAX_BLOCK_NUMBER {
		now >= unlock_time
	} else {
		current_height + 1 >= unlock_time
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn unlock_time_zero_is_always_unlocked() {
		assert!(is_input_unlocked(0, 0, 0));
	}

	#[test]
	fn unlock_time_as_block_height() {
		assert!(!is_input_unlocked(100, 97, 0));
		assert!(is_input_unlocked(100, 99, 0));
		assert!(is_input_unlocked(100, 100, 0));
	}

	#[test]
	fn unlock_time_as_wall_clock() {
		let ts = MAX_BLOCK_NUMBER + 1_000;
		assert!(!is_input_unlocked(ts, 500, ts - 1));
		assert!(is_input_unlocked(ts, 500, ts));
	}

	#[test]
	fn fusion_transaction_nets_to_zero() {
		let mut transfers = HashMap::new();
		transfers.insert(PublicKey([1u8; 32]), 500);
		transfers.insert(PublicKey([2u8; 32]), -500);
		let tx = Transaction {
			transfers,
			hash: H256::ZERO,
			fee: 0,
			block_height: 10,
			timestamp: 0,
			payment_id: String::new(),
			unlock_time: 0,
			is_coinbase: false,
		};
		assert!(tx.is_fusion());
	}
}
