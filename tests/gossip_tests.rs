
use taskmesh::chain::Block;
use taskmesh::crypto::Keypair;
use taskmesh::protocol::message::{Message, MessageKind, PeerHello};
use taskmesh::session::{SessionHandle, SessionId};

use test_harness::{connect_peer, drain_frames, next_frame, test_dispatcher};

#[tokio::test]
async fn peer_hello_is_answered_with_our_topology() {
    let t = test_dispatcher(4, 8);
    let first_kp = Keypair::generate();
    let mut first = connect_peer(&t.dispatcher, first_kp, vec![]).await;

    let reply = next_frame(&mut first.rx);
    assert_eq!(reply.kind, MessageKind::Hello);
    let hello = PeerHello::deserialize(&reply.payload).unwrap();
    assert_eq!(hex::encode(&hello.pubkey), t.dispatcher.public_hex());
    assert!(hello.neighbours.is_empty());

    // A second peer's HELLO reply lists the first as a known neighbour,
    // and the first peer learns about the second via NEIGHBOURCONNECT.
    let second_kp = Keypair::generate();
    let mut second = connect_peer(&t.dispatcher, second_kp, vec![]).await;
    let reply = next_frame(&mut second.rx);
    let hello = PeerHello::deserialize(&reply.payload).unwrap();
    assert_eq!(hello.neighbours.len(), 1);
    assert_eq!(hello.neighbours[0], hex::encode(first.keypair.public_bytes()));

    let connect = next_frame(&mut first.rx);
    assert_eq!(connect.kind, MessageKind::NeighbourConnect);
    assert_eq!(connect.payload, second.keypair.public_bytes());
}

#[tokio::test]
async fn hello_pubkey_mismatch_tears_down_dialed_peer() {
    let t = test_dispatcher(4, 8);
    let kp = Keypair::generate();
    let mut peer = connect_peer(&t.dispatcher, kp, vec![]).await;
    let _ = next_frame(&mut peer.rx);

    // A second HELLO claiming a different identity must close the session.
    let imposter = Keypair::generate();
    let hello = PeerHello::new(imposter.public_bytes(), vec![]);
    let msg = Message::unsigned(MessageKind::Hello, hello.serialize());
    let outcome = t
        .dispatcher
        .handle_peer_frame(peer.session, &peer.handle, &msg.encode())
        .await;
    assert!(outcome.is_err());
    let state = t.dispatcher.state.lock().await;
    assert!(!state.neighbours.contains_key(&peer.session));
}

fn gossip_block(t: &test_harness::TestDispatcher, height: u64) -> Block {
    let parent = t.dispatcher.chain.latest().hash;
    Block::new(Vec::new(), parent, height, 1, "remote".to_string())
}

#[tokio::test]
async fn block_gossip_installs_and_forwards_with_loop_avoidance() {
    // Topology seen from this dispatcher (playing B): neighbours A and C.
    // A emits a block. C does not know A, so C must receive the forward;
    // nothing goes back to A.
    let t = test_dispatcher(4, 8);
    let a_kp = Keypair::generate();
    let c_kp = Keypair::generate();
    let b_hex = t.dispatcher.public_hex();
    let mut a = connect_peer(&t.dispatcher, a_kp, vec![b_hex.clone()]).await;
    let mut c = connect_peer(&t.dispatcher, c_kp, vec![b_hex]).await;
    drain_frames(&mut a.rx);
    drain_frames(&mut c.rx);

    let block = gossip_block(&t, 1);
    let msg = Message::signed(MessageKind::Block, block.serialize(), &a.keypair);
    t.dispatcher
        .handle_peer_frame(a.session, &a.handle, &msg.encode())
        .await
        .unwrap();

    assert_eq!(t.dispatcher.chain.height(), 1);
    assert!(t.dispatcher.chain.contains(&block.hash));

    // Forwarded to C, re-signed by us.
    let forwarded = next_frame(&mut c.rx);
    assert_eq!(forwarded.kind, MessageKind::Block);
    assert!(forwarded.verify(&hex::decode(t.dispatcher.public_hex()).unwrap()));
    assert_eq!(forwarded.payload, block.serialize());
    // Nothing back to the sender.
    assert!(a.rx.try_recv().is_err());
}

#[tokio::test]
async fn block_gossip_skips_neighbours_who_know_the_sender() {
    let t = test_dispatcher(4, 8);
    let a_kp = Keypair::generate();
    let a_hex = hex::encode(a_kp.public_bytes());
    let c_kp = Keypair::generate();
    let mut a = connect_peer(&t.dispatcher, a_kp, vec![]).await;
    // C reports A among its own neighbours, so C already has the block.
    let mut c = connect_peer(&t.dispatcher, c_kp, vec![a_hex]).await;
    drain_frames(&mut a.rx);
    drain_frames(&mut c.rx);

    let block = gossip_block(&t, 1);
    let msg = Message::signed(MessageKind::Block, block.serialize(), &a.keypair);
    t.dispatcher
        .handle_peer_frame(a.session, &a.handle, &msg.encode())
        .await
        .unwrap();

    assert_eq!(t.dispatcher.chain.height(), 1);
    assert!(c.rx.try_recv().is_err());
    assert!(a.rx.try_recv().is_err());
}

#[tokio::test]
async fn badly_signed_block_changes_nothing() {
    let t = test_dispatcher(4, 8);
    let kp = Keypair::generate();
    let mut peer = connect_peer(&t.dispatcher, kp, vec![]).await;
    let _ = next_frame(&mut peer.rx);

    let block = gossip_block(&t, 1);
    let forger = Keypair::generate();
    let msg = Message::signed(MessageKind::Block, block.serialize(), &forger);
    t.dispatcher
        .handle_peer_frame(peer.session, &peer.handle, &msg.encode())
        .await
        .unwrap();

    assert_eq!(t.dispatcher.chain.height(), 0);
    assert!(!t.dispatcher.chain.contains(&block.hash));
}

#[tokio::test]
async fn block_request_is_answered_or_dropped() {
    let t = test_dispatcher(4, 8);
    let kp = Keypair::generate();
    let mut peer = connect_peer(&t.dispatcher, kp, vec![]).await;
    let _ = next_frame(&mut peer.rx);

    let genesis = t.dispatcher.chain.latest();
    let req = Message::signed(MessageKind::BlockReq, genesis.hash.clone(), &peer.keypair);
    t.dispatcher
        .handle_peer_frame(peer.session, &peer.handle, &req.encode())
        .await
        .unwrap();
    let res = next_frame(&mut peer.rx);
    assert_eq!(res.kind, MessageKind::BlockRes);
    assert_eq!(Block::deserialize(&res.payload).unwrap(), genesis);

    // Unknown hashes are dropped silently.
    let req = Message::signed(MessageKind::BlockReq, vec![0u8; 32], &peer.keypair);
    t.dispatcher
        .handle_peer_frame(peer.session, &peer.handle, &req.encode())
        .await
        .unwrap();
    assert!(peer.rx.try_recv().is_err());
}

#[tokio::test]
async fn block_response_installs_synced_block() {
    let t = test_dispatcher(4, 8);
    let kp = Keypair::generate();
    let mut peer = connect_peer(&t.dispatcher, kp, vec![]).await;
    let _ = next_frame(&mut peer.rx);

    let block = gossip_block(&t, 5);
    let res = Message::signed(MessageKind::BlockRes, block.serialize(), &peer.keypair);
    t.dispatcher
        .handle_peer_frame(peer.session, &peer.handle, &res.encode())
        .await
        .unwrap();
    assert_eq!(t.dispatcher.chain.height(), 5);
}

#[tokio::test]
async fn neighbour_updates_require_valid_signatures() {
    let t = test_dispatcher(4, 8);
    let kp = Keypair::generate();
    let mut peer = connect_peer(&t.dispatcher, kp, vec![]).await;
    let _ = next_frame(&mut peer.rx);
    let other_pub = Keypair::generate().public_bytes();

    // Forged update: ignored.
    let forger = Keypair::generate();
    let forged = Message::signed(MessageKind::NeighbourConnect, other_pub.clone(), &forger);
    t.dispatcher
        .handle_peer_frame(peer.session, &peer.handle, &forged.encode())
        .await
        .unwrap();
    {
        let state = t.dispatcher.state.lock().await;
        assert!(state.neighbours[&peer.session].neighbours.is_empty());
    }

    // Genuine connect then disconnect round-trips the list.
    let connect = Message::signed(MessageKind::NeighbourConnect, other_pub.clone(), &peer.keypair);
    t.dispatcher
        .handle_peer_frame(peer.session, &peer.handle, &connect.encode())
        .await
        .unwrap();
    {
        let state = t.dispatcher.state.lock().await;
        assert_eq!(
            state.neighbours[&peer.session].neighbours,
            vec![hex::encode(&other_pub)]
        );
    }

    let disconnect =
        Message::signed(MessageKind::NeighbourDisconnect, other_pub, &peer.keypair);
    t.dispatcher
        .handle_peer_frame(peer.session, &peer.handle, &disconnect.encode())
        .await
        .unwrap();
    let state = t.dispatcher.state.lock().await;
    assert!(state.neighbours[&peer.session].neighbours.is_empty());
}

#[tokio::test]
async fn peer_disconnect_is_broadcast_to_the_mesh() {
    let t = test_dispatcher(4, 8);
    let going_kp = Keypair::generate();
    let staying_kp = Keypair::generate();
    let going = connect_peer(&t.dispatcher, going_kp, vec![]).await;
    let mut staying = connect_peer(&t.dispatcher, staying_kp, vec![]).await;
    drain_frames(&mut staying.rx);

    t.dispatcher.handle_peer_disconnect(going.session).await;

    let notice = next_frame(&mut staying.rx);
    assert_eq!(notice.kind, MessageKind::NeighbourDisconnect);
    assert_eq!(notice.payload, going.keypair.public_bytes());
    assert!(notice.verify(&hex::decode(t.dispatcher.public_hex()).unwrap()));

    let state = t.dispatcher.state.lock().await;
    assert!(!state.neighbours.contains_key(&going.session));
}

#[tokio::test]
async fn unknown_peer_session_frames_are_ignored() {
    let t = test_dispatcher(4, 8);
    let kp = Keypair::generate();
    let (handle, mut rx) = SessionHandle::new();
    let session = SessionId::next();

    // BLOCK from a session that never said hello: dropped on the floor.
    let block = gossip_block(&t, 1);
    let msg = Message::signed(MessageKind::Block, block.serialize(), &kp);
    t.dispatcher
        .handle_peer_frame(session, &handle, &msg.encode())
        .await
        .unwrap();
    assert_eq!(t.dispatcher.chain.height(), 0);
    assert!(rx.try_recv().is_err());
}
