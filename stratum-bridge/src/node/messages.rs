//! Node RPC message types.
//!
//! These mirror the JSON shapes the node speaks. The block template is
//! treated as an opaque value by the rest of the bridge: jobs store it,
//! share validation consumes it, and the only field the core interprets is
//! the header's compact bits and timestamp.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Node info, as returned by `getInfo`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub server_version: String,
    pub is_synced: bool,
}

/// One level of parent hashes in the block DAG.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLevelParents {
    pub parent_hashes: Vec<String>,
}

/// A block header as the node reports it. Hash-valued fields are hex strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlockHeader {
    pub version: u32,
    #[serde(default)]
    pub parents: Vec<RpcLevelParents>,
    pub hash_merkle_root: String,
    pub accepted_id_merkle_root: String,
    pub utxo_commitment: String,
    /// Milliseconds since epoch
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u64,
    pub daa_score: u64,
    pub blue_score: u64,
}

/// A candidate block from `getBlockTemplate`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub header: RpcBlockHeader,
}

/// Block DAG summary from `getBlockDagInfo`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDagInfo {
    pub tip_hashes: Vec<String>,
    pub block_count: u64,
    pub difficulty: f64,
}

/// One entry of a `getBalancesByAddresses` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressBalance {
    pub address: String,
    pub balance: u64,
}

/// Serialize a template's header into the byte string carried by job
/// packets.
///
/// The exact layout only has to be stable between here and share
/// validation; clients treat it as opaque bytes. Hash fields arrive as hex
/// from the node, so a malformed template surfaces here as a
/// serialization error rather than a corrupt packet.
pub fn serialized_header(block: &RpcBlock) -> Result<Vec<u8>> {
    let header = &block.header;
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(&(header.version as u16).to_le_bytes());
    out.push(header.parents.len() as u8);
    for level in &header.parents {
        out.push(level.parent_hashes.len() as u8);
        for hash in &level.parent_hashes {
            out.extend_from_slice(&decode_hash(hash)?);
        }
    }
    out.extend_from_slice(&decode_hash(&header.hash_merkle_root)?);
    out.extend_from_slice(&decode_hash(&header.accepted_id_merkle_root)?);
    out.extend_from_slice(&decode_hash(&header.utxo_commitment)?);
    out.extend_from_slice(&header.timestamp.to_le_bytes());
    out.extend_from_slice(&header.bits.to_le_bytes());
    out.extend_from_slice(&header.daa_score.to_le_bytes());
    out.extend_from_slice(&header.blue_score.to_le_bytes());
    Ok(out)
}

fn decode_hash(hex_hash: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_hash)
        .map_err(|e| Error::Serialization(format!("bad hash hex: {e}")))?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        Error::Serialization(format!("hash is {} bytes, expected 32", v.len()))
    })
}

#[cfg(test)]
pub(crate) fn test_block(bits: u32, timestamp: u64) -> RpcBlock {
    RpcBlock {
        header: RpcBlockHeader {
            version: 1,
            parents: vec![RpcLevelParents {
                parent_hashes: vec!["11".repeat(32)],
            }],
            hash_merkle_root: "22".repeat(32),
            accepted_id_merkle_root: "33".repeat(32),
            utxo_commitment: "44".repeat(32),
            timestamp,
            bits,
            nonce: 0,
            daa_score: 500,
            blue_score: 400,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_serialization_is_deterministic() {
        let block = test_block(0x1d00ffff, 123_456);
        let a = serialized_header(&block).unwrap();
        let b = serialized_header(&block).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn malformed_hash_hex_is_a_serialization_error() {
        let mut block = test_block(0x1d00ffff, 0);
        block.header.hash_merkle_root = "zz".repeat(32);
        let err = serialized_header(&block).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn truncated_hash_is_a_serialization_error() {
        let mut block = test_block(0x1d00ffff, 0);
        block.header.utxo_commitment = "ab".repeat(16);
        let err = serialized_header(&block).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
