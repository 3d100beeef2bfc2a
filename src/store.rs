//! Persisted node state.
//!
//! One JSON file in the data dir holds the keypair seed, the benchmark
//! results, and the directory token. Losing it means the node comes back as
//! a new identity, so writes go through a temp file and rename.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bench::BenchmarkEngine;
use crate::crypto::Keypair;
use crate::error::{DispatchError, Result};

const STORE_FILE: &str = "node.json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredNode {
    priv_hex: String,
    pub_hex: String,
    benchmark: BenchmarkEngine,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug)]
pub struct NodeStore {
    path: PathBuf,
}

/// State loaded (warm start) or freshly created (cold start).
#[derive(Debug)]
pub struct NodeState {
    pub keypair: Keypair,
    pub benchmark: BenchmarkEngine,
    pub token: Option<String>,
    /// True when this start generated a new identity.
    pub new: bool,
}

impl NodeStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        if !data_dir.exists() {
            fs::create_dir_all(data_dir)?;
        }
        Ok(Self {
            path: data_dir.join(STORE_FILE),
        })
    }

    /// Warm start when the store file exists, cold start otherwise. A cold
    /// start generates a keypair, runs the benchmark, and persists both
    /// before returning.
    pub fn load_or_init(&self) -> Result<NodeState> {
        if self.path.exists() {
            let raw = fs::read(&self.path)?;
            let stored: StoredNode = serde_json::from_slice(&raw)
                .map_err(|e| DispatchError::Storage(format!("corrupt node store: {e}")))?;
            let seed = hex::decode(&stored.priv_hex)
                .map_err(|e| DispatchError::Storage(format!("corrupt secret key: {e}")))?;
            let keypair = Keypair::from_secret_bytes(&seed)?;
            if keypair.public_hex() != stored.pub_hex {
                return Err(DispatchError::Storage(
                    "stored pubkey does not match secret key".into(),
                ));
            }
            tracing::info!(node_pub = %stored.pub_hex, "Loaded existing keypair and benchmark");
            return Ok(NodeState {
                keypair,
                benchmark: stored.benchmark,
                token: stored.token,
                new: false,
            });
        }

        let keypair = Keypair::generate();
        let benchmark = BenchmarkEngine::measure();
        tracing::info!(node_pub = %keypair.public_hex(), "Generated new node identity");
        let state = NodeState {
            keypair,
            benchmark,
            token: None,
            new: true,
        };
        self.persist(&state)?;
        Ok(state)
    }

    pub fn persist(&self, state: &NodeState) -> Result<()> {
        let stored = StoredNode {
            priv_hex: hex::encode(state.keypair.secret_bytes()),
            pub_hex: state.keypair.public_hex(),
            benchmark: state.benchmark.clone(),
            token: state.token.clone(),
        };
        let raw = serde_json::to_vec_pretty(&stored)
            .map_err(|e| DispatchError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Persist the directory token handed back on registration.
    pub fn save_token(&self, state: &NodeState) -> Result<()> {
        self.persist(state)
    }
}
