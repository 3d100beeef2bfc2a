//! Commit pipeline: batch finished jobs and seal them into blocks.
//!
//! Results land in an ordered buffer capped at `max_tree_jobs`. A full
//! buffer is handed to the write-queue and a fresh one started, so result
//! intake never blocks on chain writes. The flush loop drains the queue,
//! seals each batch into a block, and gossips it to every neighbour.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::chain::Block;
use crate::error::Result;
use crate::node::{Dispatcher, State};
use crate::protocol::message::{Message, MessageKind};
use crate::scheduler::job::Job;

impl Dispatcher {
    /// Add a completed job to the pending buffer. Called with the
    /// dispatcher lock held.
    pub fn commit_add(&self, state: &mut State, job: Job) {
        if let Some(existing) = state.pending.iter_mut().find(|j| j.id == job.id) {
            // A retried job is already buffered; keep its history in one entry.
            existing.add_exec(job.latest_exec().clone());
            return;
        }
        if state.pending.len() < self.config.max_tree_jobs {
            state.pending.push(job);
            return;
        }
        let batch = std::mem::take(&mut state.pending);
        tracing::info!(jobs = batch.len(), "Commit buffer full, queueing batch");
        if self.write_tx.send(batch).is_err() {
            tracing::error!("Write queue closed, dropping batch");
        }
        state.pending.push(job);
    }

    /// Drain the write-queue. A chain append failure here means the local
    /// chain can no longer be trusted, which is fatal.
    pub async fn commit_flush_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut write_rx = self.take_write_rx();
        loop {
            tokio::select! {
                batch = write_rx.recv() => {
                    let Some(jobs) = batch else { return };
                    if let Err(e) = self.flush_batch(jobs).await {
                        tracing::error!(error = %e, "Chain append failed");
                        std::process::exit(1);
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Seal one batch: Merkle tree over the jobs, block on top of the
    /// current head, append, broadcast. Per-neighbour send failures are
    /// logged by the session layer and do not fail the flush.
    pub async fn flush_batch(&self, jobs: Vec<Job>) -> Result<Block> {
        let head = self.chain.latest();
        let difficulty = self.benchmark.difficulty(&self.chain);
        let block = Block::new(
            jobs,
            head.hash,
            self.chain.next_height(),
            difficulty,
            self.public_hex(),
        );
        self.chain.add_block(block.clone())?;
        tracing::info!(
            height = block.height,
            jobs = block.jobs.len(),
            hash = %block.hash_hex(),
            "Sealed block"
        );

        let frame = Message::signed(MessageKind::Block, block.serialize(), &self.keypair).encode();
        let state = self.state.lock().await;
        state.broadcast_neighbours(&frame);
        Ok(block)
    }
}
