//! Block construction and the append-only chain.
//!
//! The chain is a collaborator of the dispatcher, not its subject: blocks
//! batch finished jobs under a Merkle root, append to the local chain, and
//! travel between dispatchers via gossip. There is no consensus; the head is
//! whatever valid block has the greatest height.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::crypto::sha256;
use crate::error::{DispatchError, Result};
use crate::scheduler::job::Job;

/// One sealed batch of jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub parent: Vec<u8>,
    pub merkle_root: Vec<u8>,
    pub difficulty: u8,
    /// Hex pubkey of the dispatcher that sealed the block.
    pub miner: String,
    pub timestamp: i64,
    pub jobs: Vec<Job>,
    pub hash: Vec<u8>,
}

impl Block {
    pub fn new(jobs: Vec<Job>, parent: Vec<u8>, height: u64, difficulty: u8, miner: String) -> Self {
        let merkle_root = merkle_root(&jobs.iter().map(|j| j.serialize()).collect::<Vec<_>>());
        let timestamp = chrono::Utc::now().timestamp();
        let mut block = Self {
            height,
            parent,
            merkle_root,
            difficulty,
            miner,
            timestamp,
            jobs,
            hash: Vec::new(),
        };
        block.hash = block.header_hash();
        block
    }

    fn header_hash(&self) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(&self.parent);
        header.extend_from_slice(&self.merkle_root);
        header.extend_from_slice(self.height.to_string().as_bytes());
        header.extend_from_slice(self.difficulty.to_string().as_bytes());
        header.extend_from_slice(self.miner.as_bytes());
        header.extend_from_slice(self.timestamp.to_string().as_bytes());
        sha256(&header)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("block serializes")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| DispatchError::MalformedFrame(e.to_string()))
    }
}

/// Merkle root over serialized jobs, pairing hashes level by level and
/// duplicating the odd one out.
pub fn merkle_root(leaves: &[Vec<u8>]) -> Vec<u8> {
    if leaves.is_empty() {
        return vec![0u8; 32];
    }
    let mut level: Vec<Vec<u8>> = leaves.iter().map(|l| sha256(l)).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut combined = pair[0].clone();
            combined.extend_from_slice(right);
            next.push(sha256(&combined));
        }
        level = next;
    }
    level.remove(0)
}

/// Append-only chain of blocks, indexed by hash. Thread-safe on its own;
/// callers never hold the dispatcher lock across chain calls.
#[derive(Debug)]
pub struct Chain {
    inner: Mutex<ChainInner>,
}

#[derive(Debug)]
struct ChainInner {
    blocks: Vec<Block>,
    by_hash: HashMap<Vec<u8>, usize>,
    head: usize,
}

impl Chain {
    /// Create a chain with a genesis block mined by the given hex pubkey.
    pub fn create(miner_hex: String) -> Self {
        let genesis = Block::new(Vec::new(), Vec::new(), 0, 1, miner_hex);
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash.clone(), 0);
        Self {
            inner: Mutex::new(ChainInner {
                blocks: vec![genesis],
                by_hash,
                head: 0,
            }),
        }
    }

    /// Append a block. Duplicates are rejected; the head moves to the block
    /// with the greatest height seen so far (last writer wins on ties).
    pub fn add_block(&self, block: Block) -> Result<()> {
        if block.hash.is_empty() {
            return Err(DispatchError::ChainAppend("block has no hash".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.by_hash.contains_key(&block.hash) {
            return Err(DispatchError::ChainAppend(format!(
                "duplicate block {}",
                block.hash_hex()
            )));
        }
        let idx = inner.blocks.len();
        inner.by_hash.insert(block.hash.clone(), idx);
        let head_height = inner.blocks[inner.head].height;
        inner.blocks.push(block);
        if inner.blocks[idx].height >= head_height {
            inner.head = idx;
        }
        Ok(())
    }

    pub fn latest(&self) -> Block {
        let inner = self.inner.lock().unwrap();
        inner.blocks[inner.head].clone()
    }

    pub fn height(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.blocks[inner.head].height
    }

    pub fn next_height(&self) -> u64 {
        self.height() + 1
    }

    pub fn block_by_hash(&self, hash: &[u8]) -> Option<Block> {
        let inner = self.inner.lock().unwrap();
        inner.by_hash.get(hash).map(|&i| inner.blocks[i].clone())
    }

    pub fn contains(&self, hash: &[u8]) -> bool {
        self.inner.lock().unwrap().by_hash.contains_key(hash)
    }

    pub fn block_hashes_hex(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.blocks.iter().map(|b| b.hash_hex()).collect()
    }

    /// Recompute every block hash and check the index. Run once at startup.
    pub fn verify(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.blocks.iter().enumerate().all(|(i, b)| {
            b.header_hash() == b.hash && inner.by_hash.get(&b.hash) == Some(&i)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merkle_root_is_stable_and_order_sensitive() {
        let a = merkle_root(&[b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        let b = merkle_root(&[b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        let c = merkle_root(&[b"two".to_vec(), b"one".to_vec(), b"three".to_vec()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(merkle_root(&[]), vec![0u8; 32]);
    }

    #[test]
    fn chain_appends_and_tracks_head() {
        let chain = Chain::create("ab".into());
        let genesis = chain.latest();
        let b1 = Block::new(Vec::new(), genesis.hash.clone(), 1, 1, "ab".into());
        chain.add_block(b1.clone()).unwrap();
        assert_eq!(chain.height(), 1);
        assert!(chain.contains(&b1.hash));
        assert!(chain.verify());

        // Duplicate append is rejected.
        assert!(chain.add_block(b1).is_err());
    }
}
