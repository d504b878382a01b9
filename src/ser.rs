//! Sane serialization & deserialization of fixed-size cryptographic byte
//! arrays into hex, for use with `#[serde(with = "...")]`.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serializer};

/// Serializes a `[u8; 32]` to and from a hex string.
pub mod fixed32_serde {
	use super::*;

	pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&hex::encode(bytes))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		let bytes = hex::decode(&s).map_err(|err| DeError::custom(err.to_string()))?;
		if bytes.len() != 32 {
			return Err(DeError::custom(format!(
				"expected 32 bytes, got {}",
				bytes.len()
			)));
		}
		let mut out = [0u8; 32];
		out.copy_from_slice(&bytes);
		Ok(out)
	}
}
