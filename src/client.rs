//! Path-level filesystem operations over a [`Session`].

use std::sync::{Mutex, PoisonError};

use log::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::parse::{is_dot_entry, parse_dir_stats, path_parts, split_parent_name};
use crate::protocol::*;
use crate::session::{FileAttr, Session};
use crate::transport::Transport;

const ENOENT: u32 = 2;

/// Hands out fids. A fid only returns to the pool after the server
/// acknowledged its release, so it is never rebound while still in use.
pub struct FidPool {
    inner: Mutex<FidPoolInner>,
}

struct FidPoolInner {
    next: u32,
    free: Vec<u32>,
}

impl FidPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FidPoolInner {
                next: 0,
                free: Vec::new(),
            }),
        }
    }

    pub fn alloc(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fid) = inner.free.pop() {
            return fid;
        }
        let fid = inner.next;
        inner.next = inner.next.wrapping_add(1);
        if inner.next == NO_FID {
            inner.next = 0;
        }
        fid
    }

    pub fn release(&self, fid: u32) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free
            .push(fid);
    }
}

impl Default for FidPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An attached 9P filesystem.
pub struct Client {
    session: Session,
    fids: FidPool,
    root_fid: u32,
    root_qid: Qid,
}

impl Client {
    /// Negotiate on `transport` and attach to the configured export.
    pub async fn connect<T: Transport>(transport: T, config: Config) -> Result<Self> {
        let session = Session::connect(transport, config).await?;
        Self::attach(session).await
    }

    /// Attach the root of a negotiated session.
    pub async fn attach(session: Session) -> Result<Self> {
        let fids = FidPool::new();
        let root_fid = fids.alloc();
        let config = session.config().clone();
        let root_qid = session
            .attach(
                root_fid,
                NO_FID,
                config.uname.as_bytes(),
                config.aname.as_bytes(),
                config.n_uname,
            )
            .await?;
        if !root_qid.is_dir() {
            warn!("attached root of {:?} is not a directory", config.aname);
        }
        Ok(Self {
            session,
            fids,
            root_fid,
            root_qid,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn root_qid(&self) -> Qid {
        self.root_qid
    }

    fn is_linux(&self) -> bool {
        self.session.dialect().is_linux()
    }

    fn not_found(path: &str) -> Error {
        Error::Protocol {
            message: format!("{}: no such file or directory", path),
            code: ENOENT,
        }
    }

    /// Clunk `fid` and return it to the pool.
    pub async fn clunk(&self, fid: u32) -> Result<()> {
        let result = self.session.clunk(fid).await;
        // The server drops the fid even when the clunk itself fails.
        match &result {
            Ok(()) => self.fids.release(fid),
            Err(e @ Error::Protocol { .. }) => {
                warn!("clunk of fid {} failed: {}", fid, e);
                self.fids.release(fid);
            }
            Err(_) => {}
        }
        result
    }

    async fn release<T>(&self, fid: u32, result: Result<T>) -> Result<T> {
        let clunked = self.clunk(fid).await;
        let value = result?;
        clunked?;
        Ok(value)
    }

    /// Walk from the root to `path`, returning a new fid and the final qid.
    pub async fn walk_path(&self, path: &str) -> Result<(u32, Qid)> {
        let names = path_parts(path);
        let fid = self.fids.alloc();
        if names.is_empty() {
            return match self.session.walk(self.root_fid, fid, &[]).await {
                Ok(_) => Ok((fid, self.root_qid)),
                Err(e) => {
                    self.fids.release(fid);
                    Err(e)
                }
            };
        }

        let mut from = self.root_fid;
        let mut qid = self.root_qid;
        for chunk in names.chunks(MAXWELEM) {
            let wnames: Vec<&[u8]> = chunk.iter().map(|n| n.as_bytes()).collect();
            let walked = match self.session.walk(from, fid, &wnames).await {
                Ok(qids) => qids,
                Err(e) => {
                    return Err(self.abandon_walk(fid, from != self.root_fid, e).await);
                }
            };
            if walked.len() < chunk.len() {
                let e = Self::not_found(path);
                return Err(self.abandon_walk(fid, from != self.root_fid, e).await);
            }
            if let Some(last) = walked.last() {
                qid = *last;
            }
            from = fid;
        }
        Ok((fid, qid))
    }

    /// A failed walk leaves `fid` unbound unless an earlier chunk bound it.
    async fn abandon_walk(&self, fid: u32, bound: bool, error: Error) -> Error {
        if bound {
            if let Err(e) = self.clunk(fid).await {
                warn!("clunk of partially walked fid {} failed: {}", fid, e);
            }
        } else if !matches!(error, Error::ConnectionLost | Error::TimedOut) {
            self.fids.release(fid);
        }
        error
    }

    async fn open_fid(&self, fid: u32, flags: u32, mode: u8) -> Result<()> {
        if self.is_linux() {
            self.session.lopen(fid, flags).await?;
        } else {
            self.session.open(fid, mode).await?;
        }
        Ok(())
    }

    /// List directory entry names at `path`, without `.` and `..`.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let (fid, qid) = self.walk_path(path).await?;
        if !qid.is_dir() {
            self.clunk(fid).await?;
            return Err(Error::InvalidPath(format!("{}: not a directory", path)));
        }
        let result = self.list_fid(fid).await;
        self.release(fid, result).await
    }

    async fn list_fid(&self, fid: u32) -> Result<Vec<String>> {
        self.open_fid(fid, P9_DOTL_RDONLY | P9_DOTL_DIRECTORY, OREAD)
            .await?;
        let dialect = self.session.dialect();
        let count = self.session.max_io();
        let mut names = Vec::new();
        let mut offset = 0u64;
        loop {
            let chunk: Vec<(Vec<u8>, u64)> = match dialect {
                Dialect::Windows => self
                    .session
                    .wreaddir(fid, offset, count)
                    .await?
                    .into_iter()
                    .map(|e| (e.entry.name, e.entry.offset))
                    .collect(),
                Dialect::Linux => self
                    .session
                    .readdir(fid, offset, count)
                    .await?
                    .into_iter()
                    .map(|e| (e.name, e.offset))
                    .collect(),
                Dialect::Base | Dialect::Unix => {
                    let data = self.session.read(fid, offset, count).await?;
                    if data.is_empty() {
                        break;
                    }
                    offset += data.len() as u64;
                    for stat in parse_dir_stats(&data, dialect)? {
                        if !is_dot_entry(&stat.base.name) {
                            names.push(String::from_utf8_lossy(&stat.base.name).into_owned());
                        }
                    }
                    continue;
                }
            };
            let Some(&(_, next)) = chunk.last() else {
                break;
            };
            for (name, _) in chunk {
                if !is_dot_entry(&name) {
                    names.push(String::from_utf8_lossy(&name).into_owned());
                }
            }
            if next <= offset {
                break;
            }
            offset = next;
        }
        Ok(names)
    }

    /// Ensure the path points to a directory.
    pub async fn ensure_dir(&self, path: &str) -> Result<()> {
        let (fid, qid) = self.walk_path(path).await?;
        self.clunk(fid).await?;
        if qid.is_dir() {
            Ok(())
        } else {
            Err(Error::InvalidPath(format!("{}: not a directory", path)))
        }
    }

    /// Create a directory at `path`.
    pub async fn create_dir(&self, path: &str, mode: u32) -> Result<Qid> {
        let (parent, name) = split_parent_name(path)?;
        let (fid, qid) = self.walk_path(parent).await?;
        if !qid.is_dir() {
            self.clunk(fid).await?;
            return Err(Error::InvalidPath(format!("{}: parent is not a directory", path)));
        }
        let result = if self.is_linux() {
            self.session
                .mkdir(fid, name.as_bytes(), mode, self.session.config().gid)
                .await
        } else {
            self.session
                .create(fid, name.as_bytes(), DMDIR | mode, OREAD, b"")
                .await
                .map(|(qid, _)| qid)
        };
        self.release(fid, result).await
    }

    /// Read a whole file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (fid, _) = self.walk_path(path).await?;
        let result = self.read_fid(fid).await;
        self.release(fid, result).await
    }

    async fn read_fid(&self, fid: u32) -> Result<Vec<u8>> {
        self.open_fid(fid, P9_DOTL_RDONLY, OREAD).await?;
        let mut content = Vec::new();
        loop {
            let data = self
                .session
                .read(fid, content.len() as u64, self.session.max_io())
                .await?;
            if data.is_empty() {
                return Ok(content);
            }
            content.extend_from_slice(&data);
        }
    }

    /// Create or truncate the file at `path` and write `data` to it.
    pub async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        let fid = match self.walk_path(path).await {
            Ok((fid, _)) => {
                if let Err(e) = self
                    .open_fid(fid, P9_DOTL_WRONLY | P9_DOTL_TRUNC, OWRITE | OTRUNC)
                    .await
                {
                    return self.release(fid, Err(e)).await;
                }
                fid
            }
            Err(Error::Protocol { .. }) => self.create_file(path, mode).await?,
            Err(e) => return Err(e),
        };
        let result = self.write_fid(fid, data).await;
        self.release(fid, result).await
    }

    async fn create_file(&self, path: &str, mode: u32) -> Result<u32> {
        let (parent, name) = split_parent_name(path)?;
        let (fid, _) = self.walk_path(parent).await?;
        let created = if self.is_linux() {
            self.session
                .lcreate(
                    fid,
                    name.as_bytes(),
                    P9_DOTL_WRONLY | P9_DOTL_CREATE | P9_DOTL_TRUNC,
                    mode,
                    self.session.config().gid,
                )
                .await
        } else {
            self.session
                .create(fid, name.as_bytes(), mode, OWRITE, b"")
                .await
        };
        match created {
            Ok(_) => Ok(fid),
            Err(e) => self.release(fid, Err(e)).await,
        }
    }

    async fn write_fid(&self, fid: u32, data: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < data.len() {
            let wrote = self.session.write(fid, done as u64, &data[done..]).await? as usize;
            if wrote == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "server accepted no bytes",
                )));
            }
            done += wrote;
        }
        Ok(())
    }

    /// Remove the file or empty directory at `path`.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let (fid, _) = self.walk_path(path).await?;
        let result = self.session.remove(fid).await;
        // Tremove clunks the fid whether or not the removal succeeded.
        if matches!(result, Ok(()) | Err(Error::Protocol { .. })) {
            self.fids.release(fid);
        }
        result
    }

    /// Attributes of the file at `path`.
    pub async fn metadata(&self, path: &str) -> Result<FileAttr> {
        let (fid, _) = self.walk_path(path).await?;
        let result = if self.is_linux() {
            self.session.getattr(fid, GetattrMask::BASIC).await
        } else {
            self.session.stat(fid).await.map(|stat| stat_to_attr(&stat))
        };
        self.release(fid, result).await
    }

    /// Rename `from` to `to`.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (old_parent, old_name) = split_parent_name(from)?;
        let (new_parent, new_name) = split_parent_name(to)?;
        if self.is_linux() {
            let (olddir, _) = self.walk_path(old_parent).await?;
            let newdir = match self.walk_path(new_parent).await {
                Ok((fid, _)) => fid,
                Err(e) => return self.release(olddir, Err(e)).await,
            };
            let result = self
                .session
                .renameat(olddir, old_name.as_bytes(), newdir, new_name.as_bytes())
                .await;
            let result = self.release(newdir, result).await;
            return self.release(olddir, result).await;
        }

        if path_parts(old_parent) != path_parts(new_parent) {
            return Err(Error::InvalidPath(format!(
                "{} -> {}: 9P2000 renames stay within one directory",
                from, to
            )));
        }
        let (fid, _) = self.walk_path(from).await?;
        let mut stat = dont_touch_stat(self.session.dialect());
        stat.base.name = new_name.as_bytes().to_vec();
        let result = self.session.wstat(fid, &stat).await;
        self.release(fid, result).await
    }
}

/// A `Twstat` record that changes nothing.
fn dont_touch_stat(dialect: Dialect) -> Stat {
    Stat {
        base: StatBase {
            typ: u16::MAX,
            dev: u32::MAX,
            qid: Qid {
                typ: QidType::from_bits_retain(u8::MAX),
                version: u32::MAX,
                path: u64::MAX,
            },
            mode: u32::MAX,
            atime: u32::MAX,
            mtime: u32::MAX,
            length: u64::MAX,
            ..StatBase::default()
        },
        unix: dialect.has_numeric_ids().then(|| UnixStat {
            extension: Vec::new(),
            n_uid: u32::MAX,
            n_gid: u32::MAX,
            n_muid: u32::MAX,
        }),
    }
}

fn stat_to_attr(stat: &Stat) -> FileAttr {
    let base = &stat.base;
    let (uid, gid) = stat
        .unix
        .as_ref()
        .map(|u| (u.n_uid, u.n_gid))
        .unwrap_or((NO_UNAME, NO_UNAME));
    FileAttr {
        valid: GetattrMask::MODE
            | GetattrMask::SIZE
            | GetattrMask::ATIME
            | GetattrMask::MTIME
            | GetattrMask::UID
            | GetattrMask::GID,
        qid: base.qid,
        attr: Attr {
            mode: base.mode,
            uid,
            gid,
            size: base.length,
            atime: Time {
                sec: u64::from(base.atime),
                nsec: 0,
            },
            mtime: Time {
                sec: u64::from(base.mtime),
                nsec: 0,
            },
            ..Attr::default()
        },
    }
}
