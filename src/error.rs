//! Error taxonomy for the wallet synchronization engine.
//!
//! Follows the teacher's split: a `Fail`-deriving `ErrorKind` enum plus a
//! crate-wide `Result<T>` alias over `failure::Error`, so call sites can
//! attach context (`.context(ErrorKind::...)`) the way `wallet/error.rs`
//! does upstream of this crate.

use failure::Fail;
use std::result::Result as StdResult;

pub use failure::Error;

pub type Result<T> = StdResult<T, Error>;

/// The stable, user-visible error taxonomy (spec §7).
///
/// Transport/transient-daemon failures are recovered locally by the
/// pipeline and node client (retry, batch backoff, dead-node emission) and
/// normally never surface as an `ErrorKind` to a caller; they appear here
/// only when a caller directly invokes a node operation.
#[derive(Clone, Debug, Fail)]
pub enum ErrorKind {
	/// The remote node could not be reached or the request failed in transit.
	#[fail(display = "transport error: {}", _0)]
	TransportError(String),

	/// The remote node returned a response that didn't match the expected
	/// wire shape.
	#[fail(display = "malformed response from node: {}", _0)]
	MalformedResponse(String),

	/// An address failed length, alphabet, or prefix validation.
	#[fail(display = "invalid address: {}", _0)]
	AddressInvalid(String),

	/// A mnemonic failed length, word-list, or checksum validation.
	#[fail(display = "invalid mnemonic: {}", _0)]
	MnemonicInvalid(String),

	/// A key did not deserialize into a valid curve point/scalar.
	#[fail(display = "invalid key format: {}", _0)]
	KeyFormatInvalid(String),

	/// The wallet does not have enough unlocked balance for the requested
	/// spend.
	#[fail(
		display = "not enough balance: needed {}, available {}",
		needed, available
	)]
	NotEnoughBalance { needed: u64, available: u64 },

	/// An amount was zero, negative, non-integer, or overflowed.
	#[fail(display = "invalid amount: {}", _0)]
	AmountInvalid(String),

	/// The requested mixin count fell outside the height-dependent allowed
	/// range.
	#[fail(display = "mixin {} out of range [{}, {}]", requested, min, max)]
	MixinOutOfRange { requested: u64, min: u64, max: u64 },

	/// A payment ID failed format validation.
	#[fail(display = "invalid payment id: {}", _0)]
	PaymentIdInvalid(String),

	/// The offered fee fell below the network minimum.
	#[fail(display = "fee too small: offered {}, minimum {}", offered, minimum)]
	FeeTooSmall { offered: u64, minimum: u64 },

	/// The daemon reported a sync-protocol condition the wallet couldn't
	/// reconcile (lagging network height, mismatched checkpoints, etc).
	#[fail(display = "daemon sync error: {}", _0)]
	DaemonSyncError(String),

	/// A scanned block referenced outputs whose global index could not be
	/// found in the node's response (signals a malicious or buggy node).
	#[fail(display = "scan integrity error: {}", _0)]
	ScanIntegrityError(String),

	/// An operation referenced a subwallet that isn't known to the store.
	#[fail(display = "unknown subwallet: {}", _0)]
	SubwalletNotFound(String),

	/// A prepared transaction referenced by id/hash could not be found.
	#[fail(display = "prepared transaction not found: {}", _0)]
	PreparedTransactionNotFound(String),

	/// An error surfaced by a hardware-wallet-backed `CryptoOps`
	/// implementation.
	#[fail(display = "ledger error: {}", _0)]
	LedgerError(String),
}
