//! 9P session state and protocol operations.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fcall::Fcall;
use crate::frame::Frame;
use crate::message::dump_hex;
use crate::mux::{Mux, PendingRequest};
use crate::protocol::*;
use crate::transport::Transport;

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Unconnected,
    VersionNegotiating,
    Ready,
    Closed,
}

/// Attributes returned by `Tgetattr`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileAttr {
    pub valid: GetattrMask,
    pub qid: Qid,
    pub attr: Attr,
}

/// Result of a `.W` open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowsOpen {
    pub status: u8,
    pub walked: u16,
    pub qid: Qid,
    pub symlink_qid: Qid,
    pub iounit: u32,
    pub attr: Attr,
}

/// A request on the wire whose response has not been collected.
pub struct Pending {
    request: PendingRequest,
    expected: u8,
}

impl Pending {
    pub fn tag(&self) -> u16 {
        self.request.tag()
    }
}

struct Status {
    state: State,
    msize: u32,
    dialect: Dialect,
}

struct Inner {
    mux: Mux,
    config: Config,
    status: Mutex<Status>,
}

/// A single 9P connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

macro_rules! rpc {
    ($session:expr, $request:expr, $reply:pat => $out:expr) => {{
        let request = $request;
        let expected = request.msg_type() + 1;
        match $session.call(request).await? {
            $reply => Ok($out),
            other => Err(Error::UnexpectedResponse {
                expected,
                got: other.msg_type(),
            }),
        }
    }};
}

impl Session {
    /// Wrap an established transport. The session starts in
    /// `VersionNegotiating`; call [`Session::negotiate`] before anything else.
    pub fn new<T: Transport>(transport: T, config: Config) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        let mux = Mux::new(reader, writer, config.msize);
        let status = Status {
            state: State::VersionNegotiating,
            msize: config.msize,
            dialect: config.dialect,
        };
        Self {
            inner: Arc::new(Inner {
                mux,
                config,
                status: Mutex::new(status),
            }),
        }
    }

    /// Wrap `transport` and negotiate the version.
    pub async fn connect<T: Transport>(transport: T, config: Config) -> Result<Self> {
        let session = Self::new(transport, config);
        session.negotiate().await?;
        Ok(session)
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.inner.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> State {
        if self.inner.mux.is_closed() {
            return State::Closed;
        }
        self.status().state
    }

    /// Negotiated message size (the proposed one before negotiation).
    pub fn msize(&self) -> u32 {
        self.status().msize
    }

    pub fn dialect(&self) -> Dialect {
        self.status().dialect
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Largest payload a single `Tread`/`Twrite` can carry.
    pub fn max_io(&self) -> u32 {
        self.msize().saturating_sub(IOHDRSZ)
    }

    /// Requests sent whose responses have not arrived yet.
    pub fn in_flight(&self) -> usize {
        self.inner.mux.in_flight()
    }

    fn ready(&self) -> Result<Dialect> {
        match self.state() {
            State::Ready => Ok(self.dialect()),
            other => Err(Error::NotReady(other)),
        }
    }

    /// Exchange `Tversion`/`Rversion` under `NO_TAG`.
    pub async fn negotiate(&self) -> Result<()> {
        let state = self.state();
        if state != State::VersionNegotiating {
            return Err(Error::NotReady(state));
        }
        let config = &self.inner.config;
        let proposed = config.dialect;
        let request = Fcall::Tversion {
            msize: config.msize,
            version: proposed.as_str().as_bytes().to_vec(),
        };
        let frame = Frame::new(&request, NO_TAG, proposed)?;
        let outcome = match self.inner.mux.send_request(frame).await {
            Ok(pending) => match pending.response().await {
                Ok(reply) => self.check_version(&reply),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok((msize, dialect)) => {
                self.inner.mux.set_max_frame(msize);
                let mut status = self.status();
                status.msize = msize;
                status.dialect = dialect;
                status.state = State::Ready;
                info!("negotiated {} with msize {}", dialect, msize);
                Ok(())
            }
            Err(e) => {
                warn!("version negotiation failed: {}", e);
                self.status().state = State::Closed;
                self.inner.mux.shutdown();
                Err(e)
            }
        }
    }

    fn check_version(&self, reply: &Frame) -> Result<(u32, Dialect)> {
        let config = &self.inner.config;
        let (msize, version) = match reply.decode(config.dialect)? {
            Fcall::Rversion { msize, version } => (msize, version),
            Fcall::Rerror { ename, .. } => {
                return Err(Error::NegotiationFailed(
                    String::from_utf8_lossy(&ename).into_owned(),
                ));
            }
            Fcall::Rlerror { ecode } => {
                return Err(Error::NegotiationFailed(format!("errno {}", ecode)));
            }
            other => {
                return Err(Error::NegotiationFailed(format!(
                    "unexpected {}",
                    msg_name(other.msg_type())
                )));
            }
        };
        if msize > config.msize {
            return Err(Error::NegotiationFailed(format!(
                "server raised msize from {} to {}",
                config.msize, msize
            )));
        }
        if msize < MIN_MSIZE {
            return Err(Error::NegotiationFailed(format!("msize {} is too small", msize)));
        }
        let dialect = match Dialect::parse(&version) {
            Some(d) if d <= config.dialect => d,
            _ => {
                return Err(Error::NegotiationFailed(format!(
                    "server answered version {:?}",
                    String::from_utf8_lossy(&version)
                )));
            }
        };
        if dialect != config.dialect {
            warn!("server downgraded {} to {}", config.dialect, dialect);
        }
        Ok((msize, dialect))
    }

    /// Send `request` without waiting for its response.
    pub async fn send(&self, request: Fcall) -> Result<Pending> {
        let dialect = self.ready()?;
        let expected = request.msg_type() + 1;
        let request = self.inner.mux.request(&request, dialect).await?;
        Ok(Pending { request, expected })
    }

    /// Wait for the response to `pending`, applying the configured timeout.
    ///
    /// On expiry the request is flushed. The tag cannot be reused until the
    /// server answers the `Tflush`, so this keeps waiting for that answer,
    /// logging each further timeout period it stays outstanding.
    pub async fn wait(&self, pending: Pending) -> Result<Fcall> {
        let Pending {
            mut request,
            expected,
        } = pending;
        let frame = match self.inner.config.request_timeout {
            None => request.wait().await?,
            Some(limit) => {
                let waited = tokio::time::timeout(limit, request.wait()).await;
                match waited {
                    Ok(frame) => frame?,
                    Err(_) => {
                        let tag = request.tag();
                        warn!("tag {} timed out after {:?}, flushing", tag, limit);
                        let flush = self.inner.mux.flush(request, self.dialect());
                        tokio::pin!(flush);
                        let mut waited = limit;
                        let flushed = loop {
                            match tokio::time::timeout(limit, &mut flush).await {
                                Ok(flushed) => break flushed?,
                                Err(_) => {
                                    waited += limit;
                                    warn!("flush of tag {} still unanswered after {:?}", tag, waited);
                                }
                            }
                        };
                        match flushed {
                            Some(frame) => frame,
                            None => return Err(Error::TimedOut),
                        }
                    }
                }
            }
        };
        self.decode_reply(&frame, expected)
    }

    /// Cancel `pending`. Returns the original response if the server
    /// completed it before the flush took effect, otherwise `Cancelled`.
    pub async fn flush(&self, pending: Pending) -> Result<Fcall> {
        let Pending { request, expected } = pending;
        match self.inner.mux.flush(request, self.dialect()).await? {
            Some(frame) => self.decode_reply(&frame, expected),
            None => Err(Error::Cancelled),
        }
    }

    /// Send `request` and wait for its response.
    pub async fn call(&self, request: Fcall) -> Result<Fcall> {
        let pending = self.send(request).await?;
        self.wait(pending).await
    }

    fn decode_reply(&self, frame: &Frame, expected: u8) -> Result<Fcall> {
        let reply = frame.decode(self.dialect()).inspect_err(|e| {
            warn!("undecodable {} on tag {}: {}", msg_name(frame.typ), frame.tag, e);
            trace!("body: {}", dump_hex(&frame.body));
        })?;
        match reply {
            Fcall::Rlerror { ecode } => Err(Error::Protocol {
                message: format!("errno {}", ecode),
                code: ecode,
            }),
            Fcall::Rerror { ename, code } => Err(Error::Protocol {
                message: String::from_utf8_lossy(&ename).into_owned(),
                code,
            }),
            reply if reply.msg_type() == expected => Ok(reply),
            reply => Err(Error::UnexpectedResponse {
                expected,
                got: reply.msg_type(),
            }),
        }
    }

    /// Fail all pending requests and close the connection.
    pub fn shutdown(&self) {
        debug!("shutting down session");
        self.status().state = State::Closed;
        self.inner.mux.shutdown();
    }

    pub async fn auth(&self, afid: u32, uname: &[u8], aname: &[u8], n_uname: u32) -> Result<Qid> {
        rpc!(self, Fcall::Tauth {
            afid,
            uname: uname.to_vec(),
            aname: aname.to_vec(),
            n_uname,
        }, Fcall::Rauth { aqid } => aqid)
    }

    pub async fn attach(
        &self,
        fid: u32,
        afid: u32,
        uname: &[u8],
        aname: &[u8],
        n_uname: u32,
    ) -> Result<Qid> {
        rpc!(self, Fcall::Tattach {
            fid,
            afid,
            uname: uname.to_vec(),
            aname: aname.to_vec(),
            n_uname,
        }, Fcall::Rattach { qid } => qid)
    }

    /// Walk `names` from `fid` to `newfid`. The server binds `newfid` only if
    /// every element was walked; a short reply leaves it unbound.
    pub async fn walk(&self, fid: u32, newfid: u32, names: &[&[u8]]) -> Result<Vec<Qid>> {
        rpc!(self, Fcall::Twalk {
            fid,
            newfid,
            wnames: names.iter().map(|n| n.to_vec()).collect(),
        }, Fcall::Rwalk { wqids } => wqids)
    }

    pub async fn open(&self, fid: u32, mode: u8) -> Result<(Qid, u32)> {
        rpc!(self, Fcall::Topen { fid, mode }, Fcall::Ropen { qid, iounit } => (qid, iounit))
    }

    pub async fn create(
        &self,
        fid: u32,
        name: &[u8],
        perm: u32,
        mode: u8,
        extension: &[u8],
    ) -> Result<(Qid, u32)> {
        rpc!(self, Fcall::Tcreate {
            fid,
            name: name.to_vec(),
            perm,
            mode,
            extension: extension.to_vec(),
        }, Fcall::Rcreate { qid, iounit } => (qid, iounit))
    }

    /// Read up to `count` bytes; `count` is capped to what fits one message.
    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let count = count.min(self.max_io());
        rpc!(self, Fcall::Tread { fid, offset, count }, Fcall::Rread { data } => data)
    }

    /// Write as much of `data` as fits one message; returns the count written.
    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let len = data.len().min(self.max_io() as usize);
        rpc!(self, Fcall::Twrite {
            fid,
            offset,
            data: data[..len].to_vec(),
        }, Fcall::Rwrite { count } => count)
    }

    pub async fn clunk(&self, fid: u32) -> Result<()> {
        rpc!(self, Fcall::Tclunk { fid }, Fcall::Rclunk => ())
    }

    /// Remove the file behind `fid`. The fid is released even on failure.
    pub async fn remove(&self, fid: u32) -> Result<()> {
        rpc!(self, Fcall::Tremove { fid }, Fcall::Rremove => ())
    }

    pub async fn stat(&self, fid: u32) -> Result<Stat> {
        rpc!(self, Fcall::Tstat { fid }, Fcall::Rstat { stat } => stat)
    }

    pub async fn wstat(&self, fid: u32, stat: &Stat) -> Result<()> {
        rpc!(self, Fcall::Twstat { fid, stat: stat.clone() }, Fcall::Rwstat => ())
    }

    pub async fn statfs(&self, fid: u32) -> Result<Statfs> {
        rpc!(self, Fcall::Tstatfs { fid }, Fcall::Rstatfs { statfs } => statfs)
    }

    pub async fn lopen(&self, fid: u32, flags: u32) -> Result<(Qid, u32)> {
        rpc!(self, Fcall::Tlopen { fid, flags }, Fcall::Rlopen { qid, iounit } => (qid, iounit))
    }

    /// Create `name` in directory `fid`; on success `fid` is the open new file.
    pub async fn lcreate(
        &self,
        fid: u32,
        name: &[u8],
        flags: u32,
        mode: u32,
        gid: u32,
    ) -> Result<(Qid, u32)> {
        rpc!(self, Fcall::Tlcreate {
            fid,
            name: name.to_vec(),
            flags,
            mode,
            gid,
        }, Fcall::Rlcreate { qid, iounit } => (qid, iounit))
    }

    pub async fn symlink(&self, fid: u32, name: &[u8], target: &[u8], gid: u32) -> Result<Qid> {
        rpc!(self, Fcall::Tsymlink {
            fid,
            name: name.to_vec(),
            symtgt: target.to_vec(),
            gid,
        }, Fcall::Rsymlink { qid } => qid)
    }

    pub async fn mknod(
        &self,
        dfid: u32,
        name: &[u8],
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    ) -> Result<Qid> {
        rpc!(self, Fcall::Tmknod {
            dfid,
            name: name.to_vec(),
            mode,
            major,
            minor,
            gid,
        }, Fcall::Rmknod { qid } => qid)
    }

    pub async fn rename(&self, fid: u32, dfid: u32, name: &[u8]) -> Result<()> {
        rpc!(self, Fcall::Trename { fid, dfid, name: name.to_vec() }, Fcall::Rrename => ())
    }

    pub async fn readlink(&self, fid: u32) -> Result<Vec<u8>> {
        rpc!(self, Fcall::Treadlink { fid }, Fcall::Rreadlink { target } => target)
    }

    pub async fn getattr(&self, fid: u32, req_mask: GetattrMask) -> Result<FileAttr> {
        rpc!(self, Fcall::Tgetattr { fid, req_mask },
            Fcall::Rgetattr { valid, qid, attr } => FileAttr { valid, qid, attr })
    }

    pub async fn setattr(&self, fid: u32, valid: SetattrMask, stat: SetAttr) -> Result<()> {
        rpc!(self, Fcall::Tsetattr { fid, valid, stat }, Fcall::Rsetattr => ())
    }

    /// Bind `newfid` to extended attribute `name` (all names if empty);
    /// returns the attribute size.
    pub async fn xattrwalk(&self, fid: u32, newfid: u32, name: &[u8]) -> Result<u64> {
        rpc!(self, Fcall::Txattrwalk {
            fid,
            newfid,
            name: name.to_vec(),
        }, Fcall::Rxattrwalk { size } => size)
    }

    pub async fn xattrcreate(&self, fid: u32, name: &[u8], attr_size: u64, flags: u32) -> Result<()> {
        rpc!(self, Fcall::Txattrcreate {
            fid,
            name: name.to_vec(),
            attr_size,
            flags,
        }, Fcall::Rxattrcreate => ())
    }

    /// Read directory entries starting at `offset`, a cursor taken from the
    /// last entry of a previous call (0 to start).
    pub async fn readdir(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<DirEntry>> {
        let count = count.min(self.max_io());
        rpc!(self, Fcall::Treaddir { fid, offset, count }, Fcall::Rreaddir { entries } => entries)
    }

    pub async fn fsync(&self, fid: u32, datasync: bool) -> Result<()> {
        rpc!(self, Fcall::Tfsync {
            fid,
            datasync: u32::from(datasync),
        }, Fcall::Rfsync => ())
    }

    /// Request a POSIX record lock; returns one of the `P9_LOCK_*` statuses.
    pub async fn lock(&self, fid: u32, flock: Flock) -> Result<u8> {
        rpc!(self, Fcall::Tlock { fid, flock }, Fcall::Rlock { status } => status)
    }

    pub async fn getlock(&self, fid: u32, flock: Getlock) -> Result<Getlock> {
        rpc!(self, Fcall::Tgetlock { fid, flock }, Fcall::Rgetlock { flock } => flock)
    }

    pub async fn link(&self, dfid: u32, fid: u32, name: &[u8]) -> Result<()> {
        rpc!(self, Fcall::Tlink { dfid, fid, name: name.to_vec() }, Fcall::Rlink => ())
    }

    pub async fn mkdir(&self, dfid: u32, name: &[u8], mode: u32, gid: u32) -> Result<Qid> {
        rpc!(self, Fcall::Tmkdir {
            dfid,
            name: name.to_vec(),
            mode,
            gid,
        }, Fcall::Rmkdir { qid } => qid)
    }

    pub async fn renameat(
        &self,
        olddirfid: u32,
        oldname: &[u8],
        newdirfid: u32,
        newname: &[u8],
    ) -> Result<()> {
        rpc!(self, Fcall::Trenameat {
            olddirfid,
            oldname: oldname.to_vec(),
            newdirfid,
            newname: newname.to_vec(),
        }, Fcall::Rrenameat => ())
    }

    pub async fn unlinkat(&self, dirfid: u32, name: &[u8], flags: u32) -> Result<()> {
        rpc!(self, Fcall::Tunlinkat {
            dirfid,
            name: name.to_vec(),
            flags,
        }, Fcall::Runlinkat => ())
    }

    pub async fn access(&self, fid: u32, flags: u32) -> Result<()> {
        rpc!(self, Fcall::Taccess { fid, flags }, Fcall::Raccess => ())
    }

    /// `.W` readdir: entries carry their attributes.
    pub async fn wreaddir(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<WindowsDirEntry>> {
        let count = count.min(self.max_io());
        rpc!(self, Fcall::Twreaddir { fid, offset, count }, Fcall::Rwreaddir { entries } => entries)
    }

    /// `.W` walk-and-open in one round trip.
    #[allow(clippy::too_many_arguments)]
    pub async fn wopen(
        &self,
        fid: u32,
        newfid: u32,
        flags: u32,
        wflags: u32,
        mode: u32,
        gid: u32,
        attr_mask: GetattrMask,
        names: &[&[u8]],
    ) -> Result<WindowsOpen> {
        rpc!(self, Fcall::Twopen {
            fid,
            newfid,
            flags,
            wflags,
            mode,
            gid,
            attr_mask,
            wnames: names.iter().map(|n| n.to_vec()).collect(),
        }, Fcall::Rwopen { status, walked, qid, symlink_qid, iounit, attr } => WindowsOpen {
            status,
            walked,
            qid,
            symlink_qid,
            iounit,
            attr,
        })
    }
}
