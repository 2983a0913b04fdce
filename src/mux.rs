//! Tag multiplexer: many outstanding requests over one duplex stream.
//!
//! ```text
//!   callers ──register──▶ Table ◀──resolve── receive loop ◀── read half
//!      │                    │ tag -> oneshot
//!      └──── mpsc<Frame> ──▶ write loop ──▶ write half
//! ```
//!
//! A tag is registered before its frame is queued for writing and is only
//! returned to the pool once a response for it has been read (or the
//! connection has failed). A caller that stops waiting leaves its slot in
//! place, so the late response is drained and discarded by the receive loop
//! instead of being matched against a reused tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::fcall::Fcall;
use crate::frame::{Frame, HEADER_SIZE, read_frame, write_frame};
use crate::protocol::{Dialect, NO_TAG, RFLUSH, msg_name};

/// Number of usable tags: every `u16` except `NO_TAG`.
pub const MAX_TAGS: usize = u16::MAX as usize;

const OUTBOUND_QUEUE: usize = 64;

type Resolution = Result<Frame>;

enum Slot {
    /// Allocated but not yet sent.
    Reserved,
    /// Sent; the response goes to `tx`. `seq` tells successive users of
    /// the same tag apart.
    Waiting {
        tx: oneshot::Sender<Resolution>,
        seq: u64,
    },
}

struct Table {
    slots: HashMap<u16, Slot>,
    next_tag: u16,
    next_seq: u64,
    closed: bool,
}

impl Table {
    fn in_flight(&self) -> usize {
        self.slots.len() - usize::from(self.slots.contains_key(&NO_TAG))
    }
}

struct Shared {
    table: Mutex<Table>,
    max_frame: AtomicU32,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `frame` to the caller waiting on its tag and free the tag.
    fn resolve(&self, frame: Frame) {
        let waiter = {
            let mut table = self.table();
            match table.slots.remove(&frame.tag) {
                Some(Slot::Waiting { tx, .. }) => Some(tx),
                Some(Slot::Reserved) => {
                    table.slots.insert(frame.tag, Slot::Reserved);
                    None
                }
                None => None,
            }
        };
        match waiter {
            Some(tx) => {
                if tx.send(Ok(frame)).is_err() {
                    debug!("drained late response for abandoned tag");
                }
            }
            None => warn!(
                "discarding {} for unregistered tag {}",
                msg_name(frame.typ),
                frame.tag
            ),
        }
    }

    /// Drop the waiter registered as `seq` on `tag` without a response and
    /// free the tag. A slot belonging to a later request on the same tag is
    /// left alone.
    fn retire(&self, tag: u16, seq: u64) {
        let mut table = self.table();
        if let Some(Slot::Waiting { seq: current, .. }) = table.slots.get(&tag) {
            if *current == seq {
                table.slots.remove(&tag);
            }
        }
    }

    /// Fail every waiter with `ConnectionLost`; later requests are refused.
    fn close(&self) {
        let drained: Vec<_> = {
            let mut table = self.table();
            if table.closed {
                return;
            }
            table.closed = true;
            table.slots.drain().collect()
        };
        let mut failed = 0usize;
        for (_, slot) in drained {
            if let Slot::Waiting { tx, .. } = slot {
                let _ = tx.send(Err(Error::ConnectionLost));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!("connection closed with {} requests pending", failed);
        }
    }
}

/// Handle to a request whose response has not been collected yet.
///
/// Dropping it without awaiting is allowed: the tag stays reserved until
/// the server's response arrives and is discarded.
pub struct PendingRequest {
    tag: u16,
    seq: u64,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingRequest {
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Wait for the response frame.
    pub async fn response(self) -> Result<Frame> {
        let mut this = self;
        this.wait().await
    }

    /// Wait without consuming the handle, so a timed-out wait can still be
    /// flushed afterwards. Must not be polled again once it has completed.
    pub(crate) async fn wait(&mut self) -> Result<Frame> {
        match (&mut self.rx).await {
            Ok(resolution) => resolution,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// Tag multiplexer over a split transport.
pub struct Mux {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Mux {
    /// Spawn the receive and write loops. Must be called inside a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, max_frame: u32) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            table: Mutex::new(Table {
                slots: HashMap::new(),
                next_tag: 1,
                next_seq: 0,
                closed: false,
            }),
            max_frame: AtomicU32::new(max_frame),
        });
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let reader_task = tokio::spawn(receive_loop(reader, shared.clone()));
        let writer_task = tokio::spawn(write_loop(writer, queue, shared.clone()));
        Self {
            shared,
            outbound,
            reader_task,
            writer_task,
        }
    }

    /// Largest frame the receive loop accepts.
    pub fn set_max_frame(&self, size: u32) {
        self.shared.max_frame.store(size, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.table().closed
    }

    /// Number of allocated tags, sent or not.
    pub fn in_flight(&self) -> usize {
        self.shared.table().in_flight()
    }

    /// Reserve a tag that is not in use.
    pub fn allocate_tag(&self) -> Result<u16> {
        let mut table = self.shared.table();
        if table.closed {
            return Err(Error::ConnectionLost);
        }
        if table.in_flight() >= MAX_TAGS {
            return Err(Error::TagSpaceExhausted);
        }
        loop {
            let tag = table.next_tag;
            table.next_tag = table.next_tag.wrapping_add(1);
            if tag != NO_TAG && !table.slots.contains_key(&tag) {
                table.slots.insert(tag, Slot::Reserved);
                return Ok(tag);
            }
        }
    }

    /// Return a tag that was allocated but never sent. Tags with a request
    /// on the wire are freed by the receive loop once their response arrives.
    pub fn free_tag(&self, tag: u16) {
        let mut table = self.shared.table();
        if let Some(Slot::Reserved) = table.slots.get(&tag) {
            table.slots.remove(&tag);
        } else {
            warn!("refusing to free tag {} with a request outstanding", tag);
        }
    }

    /// Queue `frame` for writing. Its tag must come from [`Mux::allocate_tag`]
    /// or be `NO_TAG`.
    pub async fn send_request(&self, frame: Frame) -> Result<PendingRequest> {
        let permit = self
            .outbound
            .reserve()
            .await
            .map_err(|_| Error::ConnectionLost)?;
        self.register_and_send(permit, frame)
    }

    /// Allocate a tag, encode `fcall` under it and queue it.
    pub async fn request(&self, fcall: &Fcall, dialect: Dialect) -> Result<PendingRequest> {
        let permit = self
            .outbound
            .reserve()
            .await
            .map_err(|_| Error::ConnectionLost)?;
        let tag = self.allocate_tag()?;
        let frame = Frame::new(fcall, tag, dialect).inspect_err(|_| self.free_tag(tag))?;
        self.register_and_send(permit, frame)
    }

    fn register_and_send(
        &self,
        permit: mpsc::Permit<'_, Frame>,
        frame: Frame,
    ) -> Result<PendingRequest> {
        let tag = frame.tag;
        let (tx, rx) = oneshot::channel();
        let seq;
        {
            let mut table = self.shared.table();
            if table.closed {
                return Err(Error::ConnectionLost);
            }
            match table.slots.get(&tag) {
                Some(Slot::Reserved) => {}
                None if tag == NO_TAG => {}
                _ => {
                    return Err(Error::MalformedFrame(format!(
                        "tag {} is not reserved for a new request",
                        tag
                    )));
                }
            }
            seq = table.next_seq;
            table.next_seq += 1;
            table.slots.insert(tag, Slot::Waiting { tx, seq });
        }
        debug!(
            "-> {} tag={} size={}",
            msg_name(frame.typ),
            tag,
            HEADER_SIZE + frame.body.len()
        );
        permit.send(frame);
        Ok(PendingRequest { tag, seq, rx })
    }

    /// Cancel `pending` with `Tflush`.
    ///
    /// Returns the original response if the server completed the request
    /// before honouring the flush, `None` if it was abandoned. Either way the
    /// old tag is free once this returns.
    pub async fn flush(
        &self,
        mut pending: PendingRequest,
        dialect: Dialect,
    ) -> Result<Option<Frame>> {
        let oldtag = pending.tag;
        let flush = self.request(&Fcall::Tflush { oldtag }, dialect).await?;
        let reply = flush.response().await?;
        if reply.typ != RFLUSH {
            warn!(
                "flush of tag {} answered with {}",
                oldtag,
                msg_name(reply.typ)
            );
        }
        // The server answers `oldtag` before the flush, if at all, so
        // anything still registered under it will never be answered. The
        // tag may already serve a newer request if the original response
        // arrived first.
        self.shared.retire(oldtag, pending.seq);
        match pending.rx.try_recv() {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Fail all pending requests and stop both loops.
    pub fn shutdown(&self) {
        self.shared.close();
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn receive_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let max_frame = shared.max_frame.load(Ordering::Acquire);
        match read_frame(&mut reader, max_frame).await {
            Ok(frame) => {
                debug!(
                    "<- {} tag={} size={}",
                    msg_name(frame.typ),
                    frame.tag,
                    HEADER_SIZE + frame.body.len()
                );
                shared.resolve(frame);
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("transport closed by peer");
                break;
            }
            Err(e) => {
                error!("receive loop stopped: {}", e);
                break;
            }
        }
    }
    shared.close();
}

async fn write_loop<W>(mut writer: W, mut queue: mpsc::Receiver<Frame>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            error!("write loop stopped: {}", e);
            shared.close();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    use super::*;
    use crate::protocol::{RREAD, TFLUSH, TREAD};

    struct Peer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn recv(&mut self) -> Frame {
            read_frame(&mut self.reader, 65536).await.unwrap()
        }

        async fn reply(&mut self, tag: u16, fcall: Fcall) {
            let frame = Frame::new(&fcall, tag, Dialect::Linux).unwrap();
            write_frame(&mut self.writer, &frame).await.unwrap();
        }
    }

    fn pair() -> (Mux, Peer) {
        let (client, server) = duplex(1 << 20);
        let (cr, cw) = split(client);
        let (sr, sw) = split(server);
        (
            Mux::new(cr, cw, 65536),
            Peer {
                reader: sr,
                writer: sw,
            },
        )
    }

    fn read(fid: u32) -> Fcall {
        Fcall::Tread {
            fid,
            offset: 0,
            count: 4096,
        }
    }

    #[tokio::test]
    async fn allocated_tags_are_distinct() {
        let (mux, _peer) = pair();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(mux.allocate_tag().unwrap()));
        }
        let recycled = *seen.iter().next().unwrap();
        mux.free_tag(recycled);
        seen.remove(&recycled);
        for _ in 0..10 {
            let tag = mux.allocate_tag().unwrap();
            assert!(seen.insert(tag));
        }
        assert_eq!(mux.in_flight(), 1009);
    }

    #[tokio::test]
    async fn tag_space_is_bounded_and_skips_notag() {
        let (mux, _peer) = pair();
        for _ in 0..MAX_TAGS {
            assert_ne!(mux.allocate_tag().unwrap(), NO_TAG);
        }
        assert!(matches!(mux.allocate_tag(), Err(Error::TagSpaceExhausted)));
        mux.free_tag(77);
        assert_eq!(mux.allocate_tag().unwrap(), 77);
    }

    #[tokio::test]
    async fn responses_are_matched_by_tag_not_order() {
        let (mux, mut peer) = pair();
        let first = mux.request(&read(1), Dialect::Linux).await.unwrap();
        let second = mux.request(&read(2), Dialect::Linux).await.unwrap();

        let a = peer.recv().await;
        let b = peer.recv().await;
        assert_eq!((a.tag, b.tag), (first.tag(), second.tag()));
        peer.reply(b.tag, Fcall::Rread { data: b"second".to_vec() }).await;
        peer.reply(a.tag, Fcall::Rread { data: b"first".to_vec() }).await;

        let got_first = first.response().await.unwrap();
        let got_second = second.response().await.unwrap();
        assert_eq!(
            got_first.decode(Dialect::Linux).unwrap(),
            Fcall::Rread { data: b"first".to_vec() }
        );
        assert_eq!(
            got_second.decode(Dialect::Linux).unwrap(),
            Fcall::Rread { data: b"second".to_vec() }
        );
        assert_eq!(mux.in_flight(), 0);
    }

    #[tokio::test]
    async fn unknown_tags_are_discarded() {
        let (mux, mut peer) = pair();
        let pending = mux.request(&read(1), Dialect::Linux).await.unwrap();
        let sent = peer.recv().await;
        peer.reply(sent.tag.wrapping_add(100), Fcall::Rread { data: vec![9] }).await;
        peer.reply(sent.tag, Fcall::Rread { data: vec![1] }).await;
        let frame = pending.response().await.unwrap();
        assert_eq!(frame.typ, RREAD);
        assert_eq!(frame.body, [1, 0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn abandoned_tag_is_not_reused_until_drained() {
        let (mux, mut peer) = pair();
        let pending = mux.request(&read(1), Dialect::Linux).await.unwrap();
        let tag = pending.tag();
        drop(pending);
        let sent = peer.recv().await;
        assert_eq!(sent.tag, tag);
        assert_eq!(mux.in_flight(), 1);

        peer.reply(tag, Fcall::Rread { data: Vec::new() }).await;
        // Round-trip another request so the late response has been processed.
        let probe = mux.request(&read(2), Dialect::Linux).await.unwrap();
        let probe_sent = peer.recv().await;
        assert_ne!(probe_sent.tag, tag);
        peer.reply(probe_sent.tag, Fcall::Rread { data: Vec::new() }).await;
        probe.response().await.unwrap();
        assert_eq!(mux.in_flight(), 0);
    }

    #[tokio::test]
    async fn connection_loss_reaches_every_waiter() {
        let (mux, mut peer) = pair();
        let a = mux.request(&read(1), Dialect::Linux).await.unwrap();
        let b = mux.request(&read(2), Dialect::Linux).await.unwrap();
        peer.recv().await;
        peer.recv().await;
        drop(peer);

        assert!(matches!(a.response().await, Err(Error::ConnectionLost)));
        assert!(matches!(b.response().await, Err(Error::ConnectionLost)));
        assert!(mux.is_closed());
        assert!(matches!(
            mux.request(&read(3), Dialect::Linux).await,
            Err(Error::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn flush_discards_the_original_response() {
        let (mux, mut peer) = pair();
        let pending = mux.request(&read(1), Dialect::Linux).await.unwrap();
        let tag = pending.tag();

        let server = tokio::spawn(async move {
            let read = peer.recv().await;
            assert_eq!(read.typ, TREAD);
            let flush = peer.recv().await;
            assert_eq!(flush.typ, TFLUSH);
            assert_eq!(flush.body, read.tag.to_le_bytes());
            peer.reply(read.tag, Fcall::Rread { data: vec![0; 16] }).await;
            peer.reply(flush.tag, Fcall::Rflush).await;
            peer
        });

        let original = mux.flush(pending, Dialect::Linux).await.unwrap();
        assert!(original.is_some());
        let _peer = server.await.unwrap();
        assert_eq!(mux.in_flight(), 0);

        let mut tags = HashSet::new();
        for _ in 0..MAX_TAGS {
            tags.insert(mux.allocate_tag().unwrap());
        }
        assert!(tags.contains(&tag));
    }

    #[tokio::test]
    async fn flush_without_original_response_frees_the_tag() {
        let (mux, mut peer) = pair();
        let pending = mux.request(&read(1), Dialect::Linux).await.unwrap();

        let server = tokio::spawn(async move {
            peer.recv().await;
            let flush = peer.recv().await;
            peer.reply(flush.tag, Fcall::Rflush).await;
            peer
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), mux.flush(pending, Dialect::Linux))
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_none());
        let _peer = server.await.unwrap();
        assert_eq!(mux.in_flight(), 0);
    }

    #[tokio::test]
    async fn flush_leaves_a_reused_tag_alone() {
        let (mux, mut peer) = pair();
        let pending = mux.request(&read(1), Dialect::Linux).await.unwrap();
        let tag = pending.tag();

        let server_side = async {
            let sent = peer.recv().await;
            let flush = peer.recv().await;
            assert_eq!(flush.typ, TFLUSH);
            peer.reply(sent.tag, Fcall::Rread { data: b"old".to_vec() }).await;

            // Occupy every other tag so the next allocation has to be the
            // one freed by the original response.
            let reused = loop {
                match mux.allocate_tag() {
                    Ok(t) if t == tag => break t,
                    Ok(_) => {}
                    Err(Error::TagSpaceExhausted) => tokio::task::yield_now().await,
                    Err(e) => panic!("{}", e),
                }
            };
            let frame = Frame::new(&read(2), reused, Dialect::Linux).unwrap();
            let second = mux.send_request(frame).await.unwrap();
            assert_eq!(peer.recv().await.tag, tag);
            peer.reply(flush.tag, Fcall::Rflush).await;
            second
        };
        let (flushed, second) = tokio::join!(mux.flush(pending, Dialect::Linux), server_side);
        let original = flushed.unwrap().unwrap();
        assert_eq!(
            original.decode(Dialect::Linux).unwrap(),
            Fcall::Rread { data: b"old".to_vec() }
        );

        peer.reply(tag, Fcall::Rread { data: b"new".to_vec() }).await;
        let answer = second.response().await.unwrap();
        assert_eq!(
            answer.decode(Dialect::Linux).unwrap(),
            Fcall::Rread { data: b"new".to_vec() }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_get_distinct_tags() {
        let (mux, mut peer) = pair();
        let mux = Arc::new(mux);
        let mut tasks = tokio::task::JoinSet::new();
        for fid in 0..200 {
            let mux = mux.clone();
            tasks.spawn(async move { mux.request(&read(fid), Dialect::Linux).await.unwrap() });
        }
        let mut pending = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            pending.push(joined.unwrap());
        }
        let tags: HashSet<u16> = pending.iter().map(PendingRequest::tag).collect();
        assert_eq!(tags.len(), 200);
        assert!(!tags.contains(&NO_TAG));

        let mut on_wire = HashSet::new();
        for _ in 0..200 {
            let frame = peer.recv().await;
            on_wire.insert(frame.tag);
            peer.reply(frame.tag, Fcall::Rread { data: frame.tag.to_le_bytes().to_vec() }).await;
        }
        assert_eq!(on_wire, tags);
        for request in pending {
            let tag = request.tag();
            let frame = request.response().await.unwrap();
            assert_eq!(
                frame.decode(Dialect::Linux).unwrap(),
                Fcall::Rread { data: tag.to_le_bytes().to_vec() }
            );
        }
        assert_eq!(mux.in_flight(), 0);
    }

    #[tokio::test]
    async fn unallocated_tag_is_refused() {
        let (mux, _peer) = pair();
        let frame = Frame::new(&read(1), 5, Dialect::Linux).unwrap();
        assert!(matches!(
            mux.send_request(frame).await,
            Err(Error::MalformedFrame(_))
        ));
    }
}
