use bytes::Bytes;
use data_encoding::{BASE64, HEXLOWER};

use crate::Error;

/// The blake3 digest of a payload kept in the content store.
#[derive(PartialEq, Eq, Hash, Clone)]
pub struct B3Digest(Bytes);

pub const B3_LEN: usize = 32;

impl B3Digest {
    /// Hashes the given payload.
    pub fn of(data: &[u8]) -> Self {
        blake3::hash(data).into()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Lowercase hex representation, used for on-disk blob names.
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl From<B3Digest> for bytes::Bytes {
    fn from(val: B3Digest) -> Self {
        val.0
    }
}

impl From<blake3::Hash> for B3Digest {
    fn from(value: blake3::Hash) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl TryFrom<bytes::Bytes> for B3Digest {
    type Error = Error;

    // constructs a [B3Digest] from a [bytes::Bytes].
    // Returns an error if the digest has the wrong length.
    fn try_from(value: bytes::Bytes) -> Result<Self, Self::Error> {
        if value.len() != B3_LEN {
            Err(Error::Corruption(format!(
                "invalid digest length: {}",
                value.len()
            )))
        } else {
            Ok(Self(value))
        }
    }
}

impl From<&[u8; B3_LEN]> for B3Digest {
    fn from(value: &[u8; B3_LEN]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl std::fmt::Display for B3Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", BASE64.encode(&self.0))
    }
}

impl std::fmt::Debug for B3Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", BASE64.encode(&self.0))
    }
}
