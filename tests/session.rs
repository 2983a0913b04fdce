mod common;

use std::sync::{Arc, Mutex};

use common::{dir_qid, init_logging, serve};
use hv9p::frame::{read_frame, write_frame};
use hv9p::protocol::{NO_FID, NO_TAG, Qid, TFLUSH, TREAD};
use hv9p::{Config, Dialect, Error, Fcall, Frame, Session, State};
use tokio::io::{DuplexStream, duplex};

async fn reply(server: &mut DuplexStream, fcall: Fcall, tag: u16) {
    let frame = Frame::new(&fcall, tag, Dialect::Linux).unwrap();
    write_frame(server, &frame).await.unwrap();
}

async fn negotiated(config: Config) -> (Session, DuplexStream) {
    let (client, mut server) = duplex(1 << 16);
    let session = Session::new(client, config);
    let answer = async {
        let request = read_frame(&mut server, 1 << 20).await.unwrap();
        let rversion = Fcall::Rversion {
            msize: 65536,
            version: b"9P2000.L".to_vec(),
        };
        reply(&mut server, rversion, request.tag).await;
    };
    let (result, ()) = tokio::join!(session.negotiate(), answer);
    result.unwrap();
    (session, server)
}

#[tokio::test]
async fn version_attach_and_walk() {
    init_logging();
    let (client, server) = duplex(1 << 16);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let usr = Qid { path: 2, ..dir_qid(0) };
    let lib = Qid { path: 3, ..dir_qid(0) };
    serve(server, Dialect::Linux, move |request| {
        log.lock().unwrap().push(request.clone());
        match request {
            Fcall::Tversion { .. } => Fcall::Rversion {
                msize: 65536,
                version: b"9P2000.L".to_vec(),
            },
            Fcall::Tattach { .. } => Fcall::Rattach { qid: dir_qid(1) },
            Fcall::Twalk { .. } => Fcall::Rwalk {
                wqids: vec![usr, lib],
            },
            _ => Fcall::Rlerror { ecode: 95 },
        }
    });

    let session = Session::connect(client, Config::default()).await.unwrap();
    assert_eq!(session.state(), State::Ready);
    assert_eq!(session.msize(), 65536);
    assert_eq!(session.dialect(), Dialect::Linux);

    let root = session.attach(0, NO_FID, b"user", b"", 0).await.unwrap();
    assert_eq!(root, dir_qid(1));
    let wqids = session
        .walk(0, 1, &[b"usr".as_slice(), b"lib".as_slice()])
        .await
        .unwrap();
    assert_eq!(wqids, vec![usr, lib]);

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen[1],
        Fcall::Tattach {
            fid: 0,
            afid: NO_FID,
            uname: b"user".to_vec(),
            aname: Vec::new(),
            n_uname: 0,
        }
    );
    assert_eq!(
        seen[2],
        Fcall::Twalk {
            fid: 0,
            newfid: 1,
            wnames: vec![b"usr".to_vec(), b"lib".to_vec()],
        }
    );
}

#[tokio::test]
async fn responses_may_arrive_out_of_order() {
    init_logging();
    let (session, mut server) = negotiated(Config::default()).await;

    let server_side = async {
        let first = read_frame(&mut server, 1 << 20).await.unwrap();
        let second = read_frame(&mut server, 1 << 20).await.unwrap();
        assert_ne!(first.tag, second.tag);
        assert_ne!(first.tag, NO_TAG);
        let data_for = |frame: &Frame| match frame.decode(Dialect::Linux).unwrap() {
            Fcall::Tread { fid, .. } => Fcall::Rread {
                data: format!("fid {}", fid).into_bytes(),
            },
            other => panic!("unexpected {:?}", other),
        };
        reply(&mut server, data_for(&second), second.tag).await;
        reply(&mut server, data_for(&first), first.tag).await;
    };
    let (a, b, ()) = tokio::join!(session.read(1, 0, 64), session.read(2, 0, 64), server_side);
    assert_eq!(a.unwrap(), b"fid 1");
    assert_eq!(b.unwrap(), b"fid 2");
    assert_eq!(session.in_flight(), 0);
}

#[tokio::test]
async fn flushed_request_is_cancelled() {
    init_logging();
    let (session, mut server) = negotiated(Config::default()).await;

    let pending = session
        .send(Fcall::Tread {
            fid: 5,
            offset: 0,
            count: 128,
        })
        .await
        .unwrap();
    let tag = pending.tag();

    let server_side = async {
        let read = read_frame(&mut server, 1 << 20).await.unwrap();
        assert_eq!((read.typ, read.tag), (TREAD, tag));
        let flush = read_frame(&mut server, 1 << 20).await.unwrap();
        assert_eq!(flush.typ, TFLUSH);
        assert_eq!(
            flush.decode(Dialect::Linux).unwrap(),
            Fcall::Tflush { oldtag: tag }
        );
        reply(&mut server, Fcall::Rflush, flush.tag).await;
    };
    let (result, ()) = tokio::join!(session.flush(pending), server_side);
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(session.in_flight(), 0);

    let (clunk, ()) = tokio::join!(session.clunk(5), async {
        let request = read_frame(&mut server, 1 << 20).await.unwrap();
        reply(&mut server, Fcall::Rclunk, request.tag).await;
    });
    clunk.unwrap();
}

#[tokio::test]
async fn flush_returns_a_response_that_won_the_race() {
    init_logging();
    let (session, mut server) = negotiated(Config::default()).await;

    let pending = session
        .send(Fcall::Tread {
            fid: 5,
            offset: 0,
            count: 128,
        })
        .await
        .unwrap();

    let server_side = async {
        let read = read_frame(&mut server, 1 << 20).await.unwrap();
        let flush = read_frame(&mut server, 1 << 20).await.unwrap();
        let data = Fcall::Rread {
            data: b"late".to_vec(),
        };
        reply(&mut server, data, read.tag).await;
        reply(&mut server, Fcall::Rflush, flush.tag).await;
    };
    let (result, ()) = tokio::join!(session.flush(pending), server_side);
    assert_eq!(
        result.unwrap(),
        Fcall::Rread {
            data: b"late".to_vec()
        }
    );
    assert_eq!(session.in_flight(), 0);
}

#[tokio::test]
async fn lost_connection_fails_pending_requests() {
    init_logging();
    let (session, mut server) = negotiated(Config::default()).await;

    let pending = session.send(Fcall::Tclunk { fid: 1 }).await.unwrap();
    read_frame(&mut server, 1 << 20).await.unwrap();
    drop(server);

    assert!(matches!(session.wait(pending).await, Err(Error::ConnectionLost)));
    assert_eq!(session.state(), State::Closed);
    assert!(matches!(
        session.clunk(2).await,
        Err(Error::NotReady(State::Closed))
    ));
}
