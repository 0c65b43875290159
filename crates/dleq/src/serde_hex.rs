//! Hex-string serde for fixed-size byte arrays.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&hex::encode(bytes))
}

pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    let raw = hex::decode(&value).map_err(D::Error::custom)?;
    let mut out = [0u8; N];
    if raw.len() != N {
        return Err(D::Error::custom(format!(
            "expected {N} bytes, got {}",
            raw.len()
        )));
    }
    out.copy_from_slice(&raw);
    Ok(out)
}
