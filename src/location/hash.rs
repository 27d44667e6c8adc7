//! Content hashes and machine locations

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Size of a content hash in bytes (SHA-256)
pub const HASH_LEN: usize = 32;

/// Fixed-size digest identifying a piece of content
///
/// Ordering and equality are by byte value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash a byte slice with SHA-256
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Full lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form used in log lines (first 12 hex chars)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl FromStr for ContentHash {
    type Err = MeshError;

    fn from_str(s: &str) -> MeshResult<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| MeshError::InvalidHash {
            value: s.to_string(),
            reason: e.to_string(),
        })?;
        let array: [u8; HASH_LEN] = bytes.try_into().map_err(|v: Vec<u8>| MeshError::InvalidHash {
            value: s.to_string(),
            reason: format!("expected {} bytes, got {}", HASH_LEN, v.len()),
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Address of a participating cache node
///
/// The address doubles as the root of the machine's shared data directory,
/// so content paths on a peer are derived from it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineLocation(String);

impl MachineLocation {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Root directory of this machine's shared data
    pub fn root(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Path at which this machine stores the given content
    pub fn content_path(&self, hash: &ContentHash) -> PathBuf {
        content_path_under(self.root(), hash)
    }
}

impl fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MachineLocation {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<PathBuf> for MachineLocation {
    fn from(path: PathBuf) -> Self {
        Self::new(path.to_string_lossy().into_owned())
    }
}

/// Content layout: `<root>/cas/<first 3 hex>/<hex>.blob`
pub fn content_path_under(root: &Path, hash: &ContentHash) -> PathBuf {
    let hex = hash.to_hex();
    root.join("cas").join(&hex[..3]).join(format!("{}.blob", hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_deterministic() {
        assert_eq!(ContentHash::of(b"hello"), ContentHash::of(b"hello"));
        assert_ne!(ContentHash::of(b"hello"), ContentHash::of(b"world"));
    }

    #[test]
    fn hash_parses_hex() {
        let hash = ContentHash::of(b"payload");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
        assert_eq!(hash.short().len(), 12);
    }

    #[test]
    fn hash_rejects_wrong_length() {
        let err = "abcd".parse::<ContentHash>().unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
        assert!("zz".parse::<ContentHash>().is_err());
    }

    #[test]
    fn hash_serializes_as_hex_string() {
        let hash = ContentHash::of(b"x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
    }

    #[test]
    fn hash_orders_by_bytes() {
        let low = ContentHash::from_bytes([0u8; HASH_LEN]);
        let high = ContentHash::from_bytes([0xffu8; HASH_LEN]);
        assert!(low < high);
    }

    #[test]
    fn content_path_layout() {
        let machine = MachineLocation::new("/srv/m1");
        let hash = ContentHash::of(b"data");
        let hex = hash.to_hex();
        let path = machine.content_path(&hash);
        assert_eq!(
            path,
            PathBuf::from("/srv/m1/cas").join(&hex[..3]).join(format!("{}.blob", hex))
        );
    }
}
