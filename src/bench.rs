//! Hashing benchmark used to derive proof-of-work difficulty.
//!
//! The engine runs once on cold start, is persisted in the node store, and
//! feeds into the difficulty stamped on each sealed block.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::chain::Chain;
use crate::crypto::sha256;

const BENCH_ROUNDS: u64 = 50_000;
const MAX_DIFFICULTY: u8 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkEngine {
    /// Measured SHA-256 throughput, hashes per second.
    pub hashes_per_sec: f64,
    pub measured_at: i64,
}

impl BenchmarkEngine {
    /// Time a fixed number of hash rounds on this machine.
    pub fn measure() -> Self {
        let start = Instant::now();
        let mut data = vec![0u8; 64];
        for _ in 0..BENCH_ROUNDS {
            data = sha256(&data);
        }
        let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
        Self {
            hashes_per_sec: BENCH_ROUNDS as f64 / elapsed,
            measured_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Difficulty for the next block: scales with measured throughput and
    /// drifts up slowly as the chain grows.
    pub fn difficulty(&self, chain: &Chain) -> u8 {
        let power = self.hashes_per_sec.max(1.0).log10().floor() as u64;
        let growth = chain.height() / 100;
        (1 + power + growth).min(MAX_DIFFICULTY as u64) as u8
    }
}
