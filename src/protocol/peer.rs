//! Peer-facing gossip protocol.
//!
//! Peer sessions are symmetric: the same handlers serve connections we
//! accepted and connections we dialed. Every state-changing message must
//! carry a valid signature from the neighbour's recorded pubkey.
//!
//! Loop avoidance on BLOCK: a block is re-broadcast only to neighbours that
//! (a) are not the sender and (b) do not list the sender among their own
//! neighbours, on the assumption that anyone directly connected to the
//! sender already has it.

use crate::chain::Block;
use crate::error::{DispatchError, Result};
use crate::node::{Dispatcher, NeighbourInfo, State};
use crate::protocol::message::{Message, MessageKind, PeerHello};
use crate::session::{SessionHandle, SessionId};

impl Dispatcher {
    /// Handle one frame from the peer websocket. An error return tears the
    /// connection down.
    pub async fn handle_peer_frame(
        &self,
        session: SessionId,
        handle: &SessionHandle,
        frame: &[u8],
    ) -> Result<()> {
        let msg = match Message::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%session, error = %e, "Malformed peer frame");
                handle.send(Message::unsigned(MessageKind::Invalid, Vec::new()).encode());
                return Ok(());
            }
        };
        match msg.kind {
            MessageKind::Hello => self.peer_hello(session, handle, msg).await,
            MessageKind::Block => {
                self.peer_block(session, msg).await;
                Ok(())
            }
            MessageKind::BlockReq => {
                self.peer_block_req(session, msg).await;
                Ok(())
            }
            MessageKind::BlockRes => {
                self.peer_block_res(session, msg).await;
                Ok(())
            }
            MessageKind::NeighbourConnect => {
                self.peer_neighbour_change(session, msg, true).await;
                Ok(())
            }
            MessageKind::NeighbourDisconnect => {
                self.peer_neighbour_change(session, msg, false).await;
                Ok(())
            }
            other => {
                tracing::debug!(%session, kind = %other, "Unexpected peer message");
                handle.send(Message::unsigned(MessageKind::Invalid, Vec::new()).encode());
                Ok(())
            }
        }
    }

    /// First contact on an accepted connection, or the answering HELLO on a
    /// dialed one. For dialed connections the advertised pubkey is already
    /// recorded; a disagreeing HELLO tears the connection down.
    async fn peer_hello(
        &self,
        session: SessionId,
        handle: &SessionHandle,
        msg: Message,
    ) -> Result<()> {
        let hello = match PeerHello::deserialize(&msg.payload) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(%session, error = %e, "Malformed peer hello");
                handle.send(Message::unsigned(MessageKind::Invalid, Vec::new()).encode());
                return Ok(());
            }
        };

        let mut state = self.state.lock().await;
        let known_pub = state.neighbours.get(&session).map(|i| i.pubkey.clone());
        if let Some(known_pub) = known_pub {
            if known_pub != hello.pubkey {
                tracing::warn!(%session, "Dialed peer answered with unexpected pubkey");
                state.neighbours.remove(&session);
                return Err(DispatchError::PeerDial("pubkey mismatch".into()));
            }
            if let Some(info) = state.neighbours.get_mut(&session) {
                info.neighbours = hello.neighbours;
            }
            return Ok(());
        }

        let peer_pub_hex = hex::encode(&hello.pubkey);
        let reply = PeerHello::new(self.keypair.public_bytes(), state.neighbour_pubs_hex());
        state.neighbours.insert(
            session,
            NeighbourInfo {
                pubkey: hello.pubkey.clone(),
                neighbours: hello.neighbours,
                handle: handle.clone(),
            },
        );
        handle.send(Message::unsigned(MessageKind::Hello, reply.serialize()).encode());

        // Let the rest of the mesh update its known-neighbour lists.
        let connect =
            Message::signed(MessageKind::NeighbourConnect, hello.pubkey, &self.keypair).encode();
        for (other, info) in &state.neighbours {
            if *other != session {
                info.handle.send(connect.clone());
            }
        }
        tracing::info!(%session, peer_pub = %peer_pub_hex, "Neighbour connected");
        Ok(())
    }

    async fn peer_block(&self, session: SessionId, msg: Message) {
        let state = self.state.lock().await;
        let Some(sender) = state.neighbours.get(&session) else {
            return;
        };
        if !msg.verify(&sender.pubkey) {
            tracing::warn!(%session, "Block signature check failed");
            return;
        }
        let block = match Block::deserialize(&msg.payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(%session, error = %e, "Undecodable block");
                return;
            }
        };
        let height = block.height;
        if let Err(e) = self.chain.add_block(block) {
            // Already held; whoever sent it to us the first time forwarded it.
            tracing::debug!(%session, error = %e, "Gossiped block not installed");
            return;
        }
        tracing::info!(%session, height, "Installed gossiped block");

        let recipients = rebroadcast_set(&state, &sender.pubkey);
        if !recipients.is_empty() {
            let forward =
                Message::signed(MessageKind::Block, msg.payload, &self.keypair).encode();
            state.multicast_neighbours(&forward, &recipients);
        }
    }

    async fn peer_block_req(&self, session: SessionId, msg: Message) {
        let state = self.state.lock().await;
        let Some(sender) = state.neighbours.get(&session) else {
            return;
        };
        if !msg.verify(&sender.pubkey) {
            tracing::warn!(%session, "Block request signature check failed");
            return;
        }
        // Unknown hashes are dropped silently; the requester falls back to
        // other peers.
        let Some(block) = self.chain.block_by_hash(&msg.payload) else {
            tracing::debug!(%session, "Block request for unknown hash");
            return;
        };
        let res = Message::signed(MessageKind::BlockRes, block.serialize(), &self.keypair);
        sender.handle.send(res.encode());
    }

    async fn peer_block_res(&self, session: SessionId, msg: Message) {
        let state = self.state.lock().await;
        let Some(sender) = state.neighbours.get(&session) else {
            return;
        };
        if !msg.verify(&sender.pubkey) {
            tracing::warn!(%session, "Block response signature check failed");
            return;
        }
        let block = match Block::deserialize(&msg.payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(%session, error = %e, "Undecodable block response");
                return;
            }
        };
        let height = block.height;
        match self.chain.add_block(block) {
            Ok(()) => tracing::info!(%session, height, "Installed synced block"),
            Err(e) => tracing::debug!(%session, error = %e, "Synced block not installed"),
        }
    }

    async fn peer_neighbour_change(&self, session: SessionId, msg: Message, add: bool) {
        let mut state = self.state.lock().await;
        let Some(sender) = state.neighbours.get_mut(&session) else {
            return;
        };
        if !msg.verify(&sender.pubkey) {
            tracing::warn!(%session, "Neighbour update signature check failed");
            return;
        }
        let peer_hex = hex::encode(&msg.payload);
        if add {
            if !sender.neighbours.contains(&peer_hex) {
                sender.neighbours.push(peer_hex);
            }
        } else {
            sender.neighbours.retain(|n| n != &peer_hex);
        }
    }

    /// Socket closed: drop the neighbour and tell the remaining mesh.
    pub async fn handle_peer_disconnect(&self, session: SessionId) {
        let mut state = self.state.lock().await;
        let Some(info) = state.neighbours.remove(&session) else {
            return;
        };
        tracing::info!(%session, peer_pub = %hex::encode(&info.pubkey), "Neighbour disconnected");
        let gone =
            Message::signed(MessageKind::NeighbourDisconnect, info.pubkey, &self.keypair).encode();
        state.broadcast_neighbours(&gone);
    }
}

/// Neighbours that should receive a block forwarded from `sender_pub`:
/// everyone except the sender and those who already count the sender among
/// their own neighbours.
pub fn rebroadcast_set(state: &State, sender_pub: &[u8]) -> Vec<String> {
    let sender_hex = hex::encode(sender_pub);
    state
        .neighbours
        .values()
        .filter(|info| info.pubkey != sender_pub && !info.neighbours.contains(&sender_hex))
        .map(|info| hex::encode(&info.pubkey))
        .collect()
}
