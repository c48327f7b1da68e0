//! Content-addressed block primitives.
//!
//! A [`Block`] is an immutable `(cid, bytes)` pair where the CID is a
//! cryptographic function of the bytes. The helpers here recompute digests
//! under an existing CID's prefix (version, codec, hash algorithm), which is
//! what makes fill-time integrity checks possible: a candidate byte string
//! belongs to a CID iff hashing it under the same prefix reproduces the CID.

use bytes::Bytes;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use thiserror::Error;

/// Multicodec code for raw block payloads.
pub const RAW: u64 = 0x55;
/// Multicodec code for DAG-CBOR encoded blocks (chain headers and friends).
pub const DAG_CBOR: u64 = 0x71;

#[derive(Error, Debug)]
pub enum BlockError {
    /// The CID names a multihash algorithm this build has no code table entry for.
    #[error("unsupported multihash code {0:#x}")]
    UnsupportedHash(u64),

    #[error("cid construction: {0}")]
    Cid(#[from] cid::Error),
}

/// Recomputes the CID of `data` under the prefix of `cid`: same version,
/// same codec, same hash algorithm. Equality with `cid` proves `data` is the
/// block `cid` addresses.
pub fn recompute_cid(cid: &Cid, data: &[u8]) -> Result<Cid, BlockError> {
    let code = Code::try_from(cid.hash().code())
        .map_err(|_| BlockError::UnsupportedHash(cid.hash().code()))?;
    Ok(Cid::new(cid.version(), cid.codec(), code.digest(data))?)
}

/// True iff `data` hashes to `cid` under `cid`'s own prefix.
pub fn verify(cid: &Cid, data: &[u8]) -> Result<bool, BlockError> {
    Ok(recompute_cid(cid, data)? == *cid)
}

/// The raw multihash digest payload of a CID. This is the key the persistent
/// store indexes by: already uniform-width and collision-resistant, and
/// cheaper than the printable form.
#[must_use]
pub fn digest_key(cid: &Cid) -> Vec<u8> {
    cid.hash().digest().to_vec()
}

/// An immutable content-addressed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    /// Pairs `data` with `cid` without re-verifying the digest. Used where a
    /// tier trusts its source: the node is authoritative, the HTTP block
    /// host serves a store that was verified on write, and the local store
    /// verifies on fill.
    #[must_use]
    pub fn with_cid(data: Bytes, cid: Cid) -> Self {
        Self { cid, data }
    }

    #[must_use]
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
