//! Light-client synchronization engine for a CryptoNote-family wallet.
//!
//! Owns block acquisition, output scanning/attribution, subwallet
//! balance tracking, and the periodic tickers that drive all three, so
//! an application need only hold a [`coordinator::WalletSynchronizer`]
//! and subscribe to its event stream.

pub mod attribution;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod node_client;
pub mod pipeline;
pub mod ser;
pub mod store;
pub mod sync_status;
pub mod types;

pub use config::Config;
pub use coordinator::{Event, WalletSynchronizer};
pub use crypto::{CryptoOps, DefaultCryptoOps};
pub use error::{ErrorKind, Result};
pub use node_client::{HttpNodeClient, NodeClient};
pub use store::SubWalletsStore;
pub use types::{Block, KeyImage, PublicKey, RawTx, SecretKey, SubWallet, Transaction, TransactionInput, H256};
