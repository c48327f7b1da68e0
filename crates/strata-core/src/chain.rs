//! Chain data structures served by the proxy.
//!
//! Block headers travel over the wire as DAG-CBOR tuples (the usual encoding
//! for chain objects); the RPC surface renders them as JSON objects with the
//! conventional `{"/": "bafy..."}` form for CID links. Tipsets are assembled
//! locally from cached headers rather than fetched whole.

use cid::Cid;
use serde_tuple::{Deserialize_tuple, Serialize_tuple};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("decode block header: {0}")]
    Decode(String),

    #[error("encode block header: {0}")]
    Encode(String),

    #[error("tipset must contain at least one block")]
    EmptyTipSet,

    #[error("tipset blocks disagree on height: {0} vs {1}")]
    MismatchedHeights(i64, i64),

    #[error("tipset blocks disagree on parents")]
    MismatchedParents,

    #[error("invalid cid: {0}")]
    InvalidCid(String),
}

/// A chain block header. Encoded as a DAG-CBOR tuple on the wire; CID fields
/// carry tag 42 links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct BlockHeader {
    pub miner: String,
    pub parents: Vec<Cid>,
    pub height: i64,
    pub parent_state_root: Cid,
    pub messages: Cid,
    pub parent_message_receipts: Cid,
    pub timestamp: u64,
}

impl BlockHeader {
    /// Decodes a header from its DAG-CBOR block bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ChainError> {
        serde_ipld_dagcbor::from_slice(data).map_err(|e| ChainError::Decode(e.to_string()))
    }

    /// Encodes the header to DAG-CBOR block bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ChainError> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| ChainError::Encode(e.to_string()))
    }
}

/// An ordered set of block CIDs naming a tipset. The empty key names the
/// current head.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TipSetKey(Vec<Cid>);

impl TipSetKey {
    #[must_use]
    pub fn new(cids: Vec<Cid>) -> Self {
        Self(cids)
    }

    #[must_use]
    pub fn cids(&self) -> &[Cid] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A set of blocks at the same chain height sharing the same parents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipSet {
    cids: Vec<Cid>,
    blocks: Vec<BlockHeader>,
    height: i64,
}

impl TipSet {
    /// Assembles a tipset from `(cid, header)` pairs, validating that every
    /// block sits at the same height with the same parents. Blocks are
    /// ordered by CID so assembly is deterministic regardless of lookup
    /// order.
    pub fn new(mut pairs: Vec<(Cid, BlockHeader)>) -> Result<Self, ChainError> {
        let first = pairs.first().ok_or(ChainError::EmptyTipSet)?;
        let height = first.1.height;
        let parents = first.1.parents.clone();
        for (_, header) in &pairs {
            if header.height != height {
                return Err(ChainError::MismatchedHeights(height, header.height));
            }
            if header.parents != parents {
                return Err(ChainError::MismatchedParents);
            }
        }
        pairs.sort_by(|a, b| a.0.to_bytes().cmp(&b.0.to_bytes()));
        let (cids, blocks): (Vec<Cid>, Vec<BlockHeader>) = pairs.into_iter().unzip();
        Ok(Self { cids, blocks, height })
    }

    #[must_use]
    pub fn key(&self) -> TipSetKey {
        TipSetKey::new(self.cids.clone())
    }

    #[must_use]
    pub fn cids(&self) -> &[Cid] {
        &self.cids
    }

    #[must_use]
    pub fn blocks(&self) -> &[BlockHeader] {
        &self.blocks
    }

    #[must_use]
    pub fn height(&self) -> i64 {
        self.height
    }
}

/// JSON renderings used on the RPC surface: CID links as `{"/": "bafy..."}`,
/// headers and tipsets as objects with conventional field names.
pub mod lotus_json {
    use super::{BlockHeader, ChainError, TipSet, TipSetKey};
    use cid::Cid;
    use serde_json::{json, Value};

    #[must_use]
    pub fn cid(c: &Cid) -> Value {
        json!({ "/": c.to_string() })
    }

    /// Accepts both the `{"/": "bafy..."}` link form and a bare string.
    pub fn cid_from(v: &Value) -> Result<Cid, ChainError> {
        let s = match v {
            Value::Object(map) => map.get("/").and_then(Value::as_str),
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
        .ok_or_else(|| ChainError::InvalidCid(v.to_string()))?;
        s.parse().map_err(|e: cid::Error| ChainError::InvalidCid(e.to_string()))
    }

    #[must_use]
    pub fn tipset_key(key: &TipSetKey) -> Value {
        Value::Array(key.cids().iter().map(cid).collect())
    }

    pub fn tipset_key_from(v: &Value) -> Result<TipSetKey, ChainError> {
        match v {
            Value::Null => Ok(TipSetKey::default()),
            Value::Array(items) => {
                let cids = items.iter().map(cid_from).collect::<Result<Vec<_>, _>>()?;
                Ok(TipSetKey::new(cids))
            }
            other => Err(ChainError::InvalidCid(other.to_string())),
        }
    }

    #[must_use]
    pub fn block_header(h: &BlockHeader) -> Value {
        json!({
            "Miner": h.miner,
            "Parents": h.parents.iter().map(cid).collect::<Vec<_>>(),
            "Height": h.height,
            "ParentStateRoot": cid(&h.parent_state_root),
            "Messages": cid(&h.messages),
            "ParentMessageReceipts": cid(&h.parent_message_receipts),
            "Timestamp": h.timestamp,
        })
    }

    #[must_use]
    pub fn tipset(ts: &TipSet) -> Value {
        json!({
            "Cids": ts.cids().iter().map(cid).collect::<Vec<_>>(),
            "Blocks": ts.blocks().iter().map(block_header).collect::<Vec<_>>(),
            "Height": ts.height(),
        })
    }
}
