#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hv9p::frame::{read_frame, write_frame};
use hv9p::protocol::{Attr, DirEntry, GetattrMask, Qid, QidType};
use hv9p::{Dialect, Fcall, Frame};
use tokio::io::DuplexStream;

pub const ENOENT: u32 = 2;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn dir_qid(path: u64) -> Qid {
    Qid {
        typ: QidType::DIR,
        version: 0,
        path,
    }
}

pub fn file_qid(path: u64) -> Qid {
    Qid {
        typ: QidType::FILE,
        version: 0,
        path,
    }
}

/// Answer every request on `stream` with `handler`, in arrival order.
pub fn serve<F>(mut stream: DuplexStream, dialect: Dialect, mut handler: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut(Fcall) -> Fcall + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(request) = read_frame(&mut stream, 1 << 20).await {
            let fcall = request.decode(dialect).unwrap();
            let reply = Frame::new(&handler(fcall), request.tag, dialect).unwrap();
            if write_frame(&mut stream, &reply).await.is_err() {
                break;
            }
        }
    })
}

/// A flat in-memory export: regular files and empty directories under `/`.
#[derive(Default)]
pub struct MemFs {
    pub files: Vec<(String, Option<Vec<u8>>)>,
    pub fids: HashMap<u32, String>,
    pub requests: Vec<Fcall>,
}

impl MemFs {
    pub fn new(entries: &[(&str, Option<&[u8]>)]) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(MemFs {
            files: entries
                .iter()
                .map(|(name, data)| (name.to_string(), data.map(<[u8]>::to_vec)))
                .collect(),
            ..MemFs::default()
        }))
    }

    fn lookup(&self, path: &str) -> Option<(Qid, Option<&Vec<u8>>)> {
        if path.is_empty() {
            return Some((dir_qid(0), None));
        }
        self.files
            .iter()
            .enumerate()
            .find(|(_, (name, _))| name == path)
            .map(|(i, (_, data))| match data {
                Some(data) => (file_qid(i as u64 + 1), Some(data)),
                None => (dir_qid(i as u64 + 1), None),
            })
    }

    pub fn handle(&mut self, request: Fcall) -> Fcall {
        self.requests.push(request.clone());
        match request {
            Fcall::Tversion { msize, .. } => Fcall::Rversion {
                msize,
                version: b"9P2000.L".to_vec(),
            },
            Fcall::Tattach { fid, .. } => {
                self.fids.insert(fid, String::new());
                Fcall::Rattach { qid: dir_qid(0) }
            }
            Fcall::Twalk { fid, newfid, wnames } => {
                let Some(mut path) = self.fids.get(&fid).cloned() else {
                    return Fcall::Rlerror { ecode: 9 };
                };
                let mut wqids = Vec::new();
                for name in &wnames {
                    path = String::from_utf8_lossy(name).into_owned();
                    match self.lookup(&path) {
                        Some((qid, _)) => wqids.push(qid),
                        None if wqids.is_empty() => return Fcall::Rlerror { ecode: ENOENT },
                        None => return Fcall::Rwalk { wqids },
                    }
                }
                self.fids.insert(newfid, path);
                Fcall::Rwalk { wqids }
            }
            Fcall::Tlopen { fid, .. } => match self.fids.get(&fid).and_then(|p| self.lookup(p)) {
                Some((qid, _)) => Fcall::Rlopen { qid, iounit: 0 },
                None => Fcall::Rlerror { ecode: 9 },
            },
            Fcall::Tread { fid, offset, count } => {
                let data = self
                    .fids
                    .get(&fid)
                    .and_then(|p| self.lookup(p))
                    .and_then(|(_, data)| data.cloned())
                    .unwrap_or_default();
                let start = (offset as usize).min(data.len());
                let end = (start + count as usize).min(data.len());
                Fcall::Rread {
                    data: data[start..end].to_vec(),
                }
            }
            Fcall::Treaddir { offset, .. } => {
                let mut names = vec![(".".to_string(), dir_qid(0)), ("..".to_string(), dir_qid(0))];
                for (name, _) in &self.files {
                    if let Some((qid, _)) = self.lookup(name) {
                        names.push((name.clone(), qid));
                    }
                }
                let entries = names
                    .into_iter()
                    .enumerate()
                    .skip(offset as usize)
                    .map(|(i, (name, qid))| DirEntry {
                        qid,
                        offset: i as u64 + 1,
                        typ: 0,
                        name: name.into_bytes(),
                    })
                    .collect();
                Fcall::Rreaddir { entries }
            }
            Fcall::Tgetattr { fid, .. } => match self.fids.get(&fid).and_then(|p| self.lookup(p)) {
                Some((qid, data)) => Fcall::Rgetattr {
                    valid: GetattrMask::BASIC,
                    qid,
                    attr: Attr {
                        mode: if qid.is_dir() { 0o040755 } else { 0o100644 },
                        size: data.map_or(0, |d| d.len() as u64),
                        ..Attr::default()
                    },
                },
                None => Fcall::Rlerror { ecode: 9 },
            },
            Fcall::Tmkdir { dfid, name, .. } => {
                if self.fids.get(&dfid).map(String::as_str) != Some("") {
                    return Fcall::Rlerror { ecode: 20 };
                }
                let name = String::from_utf8_lossy(&name).into_owned();
                self.files.push((name, None));
                Fcall::Rmkdir {
                    qid: dir_qid(self.files.len() as u64),
                }
            }
            Fcall::Tclunk { fid } => match self.fids.remove(&fid) {
                Some(_) => Fcall::Rclunk,
                None => Fcall::Rlerror { ecode: 9 },
            },
            _ => Fcall::Rlerror { ecode: 95 },
        }
    }
}
