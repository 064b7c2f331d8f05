//! Session serialization.

use crate::error::{Error, Result};
use crate::session::SessionSnapshot;
use bytes::Bytes;

/// Turns sessions into store payloads and back.
///
/// Decoding failures mean the stored data is unusable; they are never treated as
/// a node failure since the node answered.
pub trait SessionCodec: Send + Sync + std::fmt::Debug {
    /// Serialize a session snapshot.
    fn encode(&self, snapshot: &SessionSnapshot) -> Result<Bytes>;

    /// Deserialize a session snapshot.
    fn decode(&self, data: &[u8]) -> Result<SessionSnapshot>;
}

/// Bincode encoding of [`SessionSnapshot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl SessionCodec for BincodeCodec {
    fn encode(&self, snapshot: &SessionSnapshot) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(snapshot)?))
    }

    fn decode(&self, data: &[u8]) -> Result<SessionSnapshot> {
        bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
    }
}
