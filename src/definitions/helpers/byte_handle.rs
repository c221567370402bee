use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque byte-valued identifier (context handle, slot handle, application
/// identifier).
///
/// Rendered as upper-case hex on the wire and in logs. Ordering is plain
/// lexicographic byte order so handles can key ordered index maps.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteHandle(Vec<u8>);

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("expected a hex-binary string, received: '{0}'")]
    NotHexBinary(String),
}

impl ByteHandle {
    /// A fresh handle filled with `len` random bytes.
    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        ByteHandle(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s.trim())
            .map(ByteHandle)
            .map_err(|_| Error::NotHexBinary(s.to_string()))
    }
}

impl fmt::Debug for ByteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteHandle({})", self.to_hex())
    }
}

impl fmt::Display for ByteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<Vec<u8>> for ByteHandle {
    fn from(bytes: Vec<u8>) -> ByteHandle {
        ByteHandle(bytes)
    }
}

impl From<&[u8]> for ByteHandle {
    fn from(bytes: &[u8]) -> ByteHandle {
        ByteHandle(bytes.to_vec())
    }
}

impl From<ByteHandle> for Vec<u8> {
    fn from(ByteHandle(bytes): ByteHandle) -> Vec<u8> {
        bytes
    }
}

impl AsRef<[u8]> for ByteHandle {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<ByteHandle> for String {
    fn from(handle: ByteHandle) -> String {
        handle.to_hex()
    }
}

impl TryFrom<String> for ByteHandle {
    type Error = Error;

    fn try_from(s: String) -> Result<ByteHandle> {
        ByteHandle::from_hex(&s)
    }
}
