
use taskmesh::crypto::Keypair;
use taskmesh::protocol::message::{Message, MessageKind};
use taskmesh::scheduler::dispatch_once;
use taskmesh::scheduler::job::{ExecStatus, JobPriority};
use taskmesh::session::{SessionHandle, SessionId};

use test_harness::{connect_worker, next_frame, result_for, test_dispatcher};

#[tokio::test]
async fn single_job_single_worker_roundtrip() {
    let t = test_dispatcher(4, 8);
    let mut worker = connect_worker(&t.dispatcher).await;

    // Handshake reply carries the dispatcher's pubkey.
    let hello = next_frame(&mut worker.rx);
    assert_eq!(hello.kind, MessageKind::Hello);
    assert_eq!(hello.payload, hex::decode(t.dispatcher.public_hex()).unwrap());

    let (id, result_rx) = t
        .dispatcher
        .submit_job(b"compute".to_vec(), JobPriority::Medium)
        .await;
    assert!(dispatch_once(&t.dispatcher).await);
    let job_frame = next_frame(&mut worker.rx);

    let result = result_for(&job_frame, &worker, b"ok");
    t.dispatcher
        .handle_worker_frame(worker.session, &worker.handle, &result.encode())
        .await
        .unwrap();

    let job = result_rx.await.expect("terminal job");
    assert_eq!(job.id, id);
    assert_eq!(job.status(), ExecStatus::Done);
    assert_eq!(job.latest_exec().result, b"ok");
    assert_eq!(job.latest_exec().by, worker.keypair.public_bytes());
    assert!(job.latest_exec().verify_hash());

    // The worker is idle again and the job sits in the commit buffer.
    let state = t.dispatcher.state.lock().await;
    assert_eq!(state.worker_pq.len(), 1);
    assert!(state.workers[&worker.session].assigned.is_none());
    assert_eq!(state.pending.len(), 1);
    assert_eq!(state.pending[0].id, id);
}

#[tokio::test]
async fn worker_cap_rejects_with_connfull() {
    let t = test_dispatcher(2, 8);
    let mut first = connect_worker(&t.dispatcher).await;
    let mut second = connect_worker(&t.dispatcher).await;
    assert_eq!(next_frame(&mut first.rx).kind, MessageKind::Hello);
    assert_eq!(next_frame(&mut second.rx).kind, MessageKind::Hello);

    // The third HELLO must be refused and the connection closed.
    let (handle, mut rx) = SessionHandle::new();
    let session = SessionId::next();
    let keypair = Keypair::generate();
    let hello = Message::unsigned(MessageKind::Hello, keypair.public_bytes());
    let outcome = t
        .dispatcher
        .handle_worker_frame(session, &handle, &hello.encode())
        .await;
    assert!(outcome.is_err());
    assert_eq!(next_frame(&mut rx).kind, MessageKind::ConnFull);

    let state = t.dispatcher.state.lock().await;
    assert_eq!(state.workers.len(), 2);
}

#[tokio::test]
async fn mid_flight_disconnect_requeues_at_high() {
    let t = test_dispatcher(4, 8);
    let mut first = connect_worker(&t.dispatcher).await;
    let _ = next_frame(&mut first.rx);

    let (id, result_rx) = t
        .dispatcher
        .submit_job(b"compute".to_vec(), JobPriority::Low)
        .await;
    assert!(dispatch_once(&t.dispatcher).await);
    let _ = next_frame(&mut first.rx);

    // Worker dies mid-job; the job must be retried on the next worker even
    // ahead of other queued work.
    let (_later, _later_rx) = t
        .dispatcher
        .submit_job(b"other".to_vec(), JobPriority::Medium)
        .await;
    t.dispatcher.handle_worker_disconnect(first.session).await;

    let mut second = connect_worker(&t.dispatcher).await;
    let _ = next_frame(&mut second.rx);
    assert!(dispatch_once(&t.dispatcher).await);
    let job_frame = next_frame(&mut second.rx);
    let job = taskmesh::scheduler::job::Job::deserialize(&job_frame.payload).unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.latest_exec().by, second.keypair.public_bytes());

    let result = result_for(&job_frame, &second, b"recovered");
    t.dispatcher
        .handle_worker_frame(second.session, &second.handle, &result.encode())
        .await
        .unwrap();
    let job = result_rx.await.expect("terminal job");
    assert_eq!(job.latest_exec().result, b"recovered");
}

#[tokio::test]
async fn badly_signed_result_requeues_job() {
    let t = test_dispatcher(4, 8);
    let mut worker = connect_worker(&t.dispatcher).await;
    let _ = next_frame(&mut worker.rx);

    let (id, _result_rx) = t
        .dispatcher
        .submit_job(b"compute".to_vec(), JobPriority::Medium)
        .await;
    assert!(dispatch_once(&t.dispatcher).await);
    let job_frame = next_frame(&mut worker.rx);

    // Result signed by the wrong key: dropped, job requeued at High, worker
    // back in the pool.
    let mut other = connect_worker(&t.dispatcher).await;
    let _ = next_frame(&mut other.rx);
    let forged = result_for(&job_frame, &other, b"forged");
    t.dispatcher
        .handle_worker_frame(worker.session, &worker.handle, &forged.encode())
        .await
        .unwrap();

    {
        let state = t.dispatcher.state.lock().await;
        assert_eq!(state.job_pq.len(), 1);
        assert!(state.pending.is_empty());
        assert!(state.workers[&worker.session].assigned.is_none());
    }

    // The retry goes to the next idle worker in FIFO order: `other`
    // connected before the first worker was re-queued.
    assert!(dispatch_once(&t.dispatcher).await);
    let retry = next_frame(&mut other.rx);
    assert_eq!(retry.kind, MessageKind::Job);
    let job = taskmesh::scheduler::job::Job::deserialize(&retry.payload).unwrap();
    assert_eq!(job.id, id);
}

#[tokio::test]
async fn shut_worker_gets_ack_and_no_more_jobs() {
    let t = test_dispatcher(4, 8);
    let mut worker = connect_worker(&t.dispatcher).await;
    let _ = next_frame(&mut worker.rx);

    let shut = Message::signed(MessageKind::Shut, Vec::new(), &worker.keypair);
    t.dispatcher
        .handle_worker_frame(worker.session, &worker.handle, &shut.encode())
        .await
        .unwrap();
    let ack = next_frame(&mut worker.rx);
    assert_eq!(ack.kind, MessageKind::ShutAck);
    assert!(ack.verify(&hex::decode(t.dispatcher.public_hex()).unwrap()));

    let (_id, _rx) = t
        .dispatcher
        .submit_job(b"compute".to_vec(), JobPriority::High)
        .await;
    // The only worker is shut, so no dispatch happens.
    assert!(!dispatch_once(&t.dispatcher).await);
    assert!(worker.rx.try_recv().is_err());
}

#[tokio::test]
async fn unexpected_kind_gets_invalid_reply() {
    let t = test_dispatcher(4, 8);
    let mut worker = connect_worker(&t.dispatcher).await;
    let _ = next_frame(&mut worker.rx);

    let stray = Message::signed(MessageKind::BlockReq, b"hash".to_vec(), &worker.keypair);
    t.dispatcher
        .handle_worker_frame(worker.session, &worker.handle, &stray.encode())
        .await
        .unwrap();
    assert_eq!(next_frame(&mut worker.rx).kind, MessageKind::Invalid);
}

#[tokio::test]
async fn malformed_frame_gets_invalid_reply() {
    let t = test_dispatcher(4, 8);
    let mut worker = connect_worker(&t.dispatcher).await;
    let _ = next_frame(&mut worker.rx);

    t.dispatcher
        .handle_worker_frame(worker.session, &worker.handle, b"not a frame")
        .await
        .unwrap();
    assert_eq!(next_frame(&mut worker.rx).kind, MessageKind::Invalid);
}
