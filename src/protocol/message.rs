use serde::{Deserialize, Serialize};

use crate::crypto::{self, Keypair};
use crate::error::{DispatchError, Result};

/// Wire message kinds exchanged with workers and peer dispatchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Hello,
    Result,
    Shut,
    ShutAck,
    Block,
    BlockReq,
    BlockRes,
    NeighbourConnect,
    NeighbourDisconnect,
    Invalid,
    ConnFull,
    Job,
}

impl MessageKind {
    /// Stable tag mixed into the signature preimage.
    pub fn tag(&self) -> &'static str {
        match self {
            MessageKind::Hello => "hello",
            MessageKind::Result => "result",
            MessageKind::Shut => "shut",
            MessageKind::ShutAck => "shutack",
            MessageKind::Block => "block",
            MessageKind::BlockReq => "blockreq",
            MessageKind::BlockRes => "blockres",
            MessageKind::NeighbourConnect => "neighbourconnect",
            MessageKind::NeighbourDisconnect => "neighbourdisconnect",
            MessageKind::Invalid => "invalid",
            MessageKind::ConnFull => "connfull",
            MessageKind::Job => "job",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// One websocket frame: a kind, an opaque payload, and an Ed25519 signature
/// over `tag ‖ payload`. Control messages that precede key exchange (HELLO,
/// CONNFULL, INVALID) go out unsigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl Message {
    pub fn unsigned(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            signature: Vec::new(),
        }
    }

    pub fn signed(kind: MessageKind, payload: Vec<u8>, keypair: &Keypair) -> Self {
        let signature = keypair.sign(&signing_bytes(kind, &payload));
        Self {
            kind,
            payload,
            signature,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("message serializes")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| DispatchError::MalformedFrame(e.to_string()))
    }

    /// Check the signature against the claimed sender's pubkey.
    pub fn verify(&self, sender_pub: &[u8]) -> bool {
        crypto::verify(
            sender_pub,
            &signing_bytes(self.kind, &self.payload),
            &self.signature,
        )
    }
}

fn signing_bytes(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let tag = kind.tag().as_bytes();
    let mut buf = Vec::with_capacity(tag.len() + payload.len());
    buf.extend_from_slice(tag);
    buf.extend_from_slice(payload);
    buf
}

/// HELLO payload on the peer websocket: our pubkey and the hex pubkeys of
/// every neighbour we are currently connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHello {
    #[serde(rename = "pub")]
    pub pubkey: Vec<u8>,
    pub neighbours: Vec<String>,
}

impl PeerHello {
    pub fn new(pubkey: Vec<u8>, neighbours: Vec<String>) -> Self {
        Self { pubkey, neighbours }
    }

    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("hello serializes")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| DispatchError::MalformedFrame(e.to_string()))
    }
}
