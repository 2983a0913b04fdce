//! Message bodies for every 9P2000, .u, .L and .W request and response.
//!
//! A body is encoded without its frame header; [`crate::frame`] adds that.
//! Layout differences between dialects are resolved here from the
//! negotiated [`Dialect`].

use crate::error::{Error, Result};
use crate::message::*;
use crate::protocol::*;

/// A decoded 9P message body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fcall {
    Tversion { msize: u32, version: Vec<u8> },
    Rversion { msize: u32, version: Vec<u8> },
    Tauth { afid: u32, uname: Vec<u8>, aname: Vec<u8>, n_uname: u32 },
    Rauth { aqid: Qid },
    Tattach { fid: u32, afid: u32, uname: Vec<u8>, aname: Vec<u8>, n_uname: u32 },
    Rattach { qid: Qid },
    Rerror { ename: Vec<u8>, code: u32 },
    Rlerror { ecode: u32 },
    Tflush { oldtag: u16 },
    Rflush,
    Twalk { fid: u32, newfid: u32, wnames: Vec<Vec<u8>> },
    Rwalk { wqids: Vec<Qid> },
    Topen { fid: u32, mode: u8 },
    Ropen { qid: Qid, iounit: u32 },
    Tcreate { fid: u32, name: Vec<u8>, perm: u32, mode: u8, extension: Vec<u8> },
    Rcreate { qid: Qid, iounit: u32 },
    Tread { fid: u32, offset: u64, count: u32 },
    Rread { data: Vec<u8> },
    Twrite { fid: u32, offset: u64, data: Vec<u8> },
    Rwrite { count: u32 },
    Tclunk { fid: u32 },
    Rclunk,
    Tremove { fid: u32 },
    Rremove,
    Tstat { fid: u32 },
    Rstat { stat: Stat },
    Twstat { fid: u32, stat: Stat },
    Rwstat,

    Tstatfs { fid: u32 },
    Rstatfs { statfs: Statfs },
    Tlopen { fid: u32, flags: u32 },
    Rlopen { qid: Qid, iounit: u32 },
    Tlcreate { fid: u32, name: Vec<u8>, flags: u32, mode: u32, gid: u32 },
    Rlcreate { qid: Qid, iounit: u32 },
    Tsymlink { fid: u32, name: Vec<u8>, symtgt: Vec<u8>, gid: u32 },
    Rsymlink { qid: Qid },
    Tmknod { dfid: u32, name: Vec<u8>, mode: u32, major: u32, minor: u32, gid: u32 },
    Rmknod { qid: Qid },
    Trename { fid: u32, dfid: u32, name: Vec<u8> },
    Rrename,
    Treadlink { fid: u32 },
    Rreadlink { target: Vec<u8> },
    Tgetattr { fid: u32, req_mask: GetattrMask },
    Rgetattr { valid: GetattrMask, qid: Qid, attr: Attr },
    Tsetattr { fid: u32, valid: SetattrMask, stat: SetAttr },
    Rsetattr,
    Txattrwalk { fid: u32, newfid: u32, name: Vec<u8> },
    Rxattrwalk { size: u64 },
    Txattrcreate { fid: u32, name: Vec<u8>, attr_size: u64, flags: u32 },
    Rxattrcreate,
    Treaddir { fid: u32, offset: u64, count: u32 },
    Rreaddir { entries: Vec<DirEntry> },
    Tfsync { fid: u32, datasync: u32 },
    Rfsync,
    Tlock { fid: u32, flock: Flock },
    Rlock { status: u8 },
    Tgetlock { fid: u32, flock: Getlock },
    Rgetlock { flock: Getlock },
    Tlink { dfid: u32, fid: u32, name: Vec<u8> },
    Rlink,
    Tmkdir { dfid: u32, name: Vec<u8>, mode: u32, gid: u32 },
    Rmkdir { qid: Qid },
    Trenameat { olddirfid: u32, oldname: Vec<u8>, newdirfid: u32, newname: Vec<u8> },
    Rrenameat,
    Tunlinkat { dirfid: u32, name: Vec<u8>, flags: u32 },
    Runlinkat,

    Taccess { fid: u32, flags: u32 },
    Raccess,
    Twreaddir { fid: u32, offset: u64, count: u32 },
    Rwreaddir { entries: Vec<WindowsDirEntry> },
    Twopen {
        fid: u32,
        newfid: u32,
        flags: u32,
        wflags: u32,
        mode: u32,
        gid: u32,
        attr_mask: GetattrMask,
        wnames: Vec<Vec<u8>>,
    },
    Rwopen { status: u8, walked: u16, qid: Qid, symlink_qid: Qid, iounit: u32, attr: Attr },
}

impl Fcall {
    /// Wire message type code.
    pub fn msg_type(&self) -> u8 {
        use Fcall::*;
        match self {
            Tversion { .. } => TVERSION,
            Rversion { .. } => RVERSION,
            Tauth { .. } => TAUTH,
            Rauth { .. } => RAUTH,
            Tattach { .. } => TATTACH,
            Rattach { .. } => RATTACH,
            Rerror { .. } => RERROR,
            Rlerror { .. } => RLERROR,
            Tflush { .. } => TFLUSH,
            Rflush => RFLUSH,
            Twalk { .. } => TWALK,
            Rwalk { .. } => RWALK,
            Topen { .. } => TOPEN,
            Ropen { .. } => ROPEN,
            Tcreate { .. } => TCREATE,
            Rcreate { .. } => RCREATE,
            Tread { .. } => TREAD,
            Rread { .. } => RREAD,
            Twrite { .. } => TWRITE,
            Rwrite { .. } => RWRITE,
            Tclunk { .. } => TCLUNK,
            Rclunk => RCLUNK,
            Tremove { .. } => TREMOVE,
            Rremove => RREMOVE,
            Tstat { .. } => TSTAT,
            Rstat { .. } => RSTAT,
            Twstat { .. } => TWSTAT,
            Rwstat => RWSTAT,
            Tstatfs { .. } => TSTATFS,
            Rstatfs { .. } => RSTATFS,
            Tlopen { .. } => TLOPEN,
            Rlopen { .. } => RLOPEN,
            Tlcreate { .. } => TLCREATE,
            Rlcreate { .. } => RLCREATE,
            Tsymlink { .. } => TSYMLINK,
            Rsymlink { .. } => RSYMLINK,
            Tmknod { .. } => TMKNOD,
            Rmknod { .. } => RMKNOD,
            Trename { .. } => TRENAME,
            Rrename => RRENAME,
            Treadlink { .. } => TREADLINK,
            Rreadlink { .. } => RREADLINK,
            Tgetattr { .. } => TGETATTR,
            Rgetattr { .. } => RGETATTR,
            Tsetattr { .. } => TSETATTR,
            Rsetattr => RSETATTR,
            Txattrwalk { .. } => TXATTRWALK,
            Rxattrwalk { .. } => RXATTRWALK,
            Txattrcreate { .. } => TXATTRCREATE,
            Rxattrcreate => RXATTRCREATE,
            Treaddir { .. } => TREADDIR,
            Rreaddir { .. } => RREADDIR,
            Tfsync { .. } => TFSYNC,
            Rfsync => RFSYNC,
            Tlock { .. } => TLOCK,
            Rlock { .. } => RLOCK,
            Tgetlock { .. } => TGETLOCK,
            Rgetlock { .. } => RGETLOCK,
            Tlink { .. } => TLINK,
            Rlink => RLINK,
            Tmkdir { .. } => TMKDIR,
            Rmkdir { .. } => RMKDIR,
            Trenameat { .. } => TRENAMEAT,
            Rrenameat => RRENAMEAT,
            Tunlinkat { .. } => TUNLINKAT,
            Runlinkat => RUNLINKAT,
            Taccess { .. } => TACCESS,
            Raccess => RACCESS,
            Twreaddir { .. } => TWREADDIR,
            Rwreaddir { .. } => RWREADDIR,
            Twopen { .. } => TWOPEN,
            Rwopen { .. } => RWOPEN,
        }
    }

    /// Append the body to `out`, leaving its existing contents untouched.
    pub fn encode(&self, dialect: Dialect, out: &mut Vec<u8>) -> Result<()> {
        use Fcall::*;
        match self {
            Tversion { msize, version } | Rversion { msize, version } => {
                push_u32(out, *msize);
                push_string(out, version)?;
            }
            Tauth { afid, uname, aname, n_uname } => {
                push_u32(out, *afid);
                push_string(out, uname)?;
                push_string(out, aname)?;
                if dialect.has_numeric_ids() {
                    push_u32(out, *n_uname);
                }
            }
            Rauth { aqid: qid } | Rattach { qid } => push_qid(out, qid),
            Tattach { fid, afid, uname, aname, n_uname } => {
                push_u32(out, *fid);
                push_u32(out, *afid);
                push_string(out, uname)?;
                push_string(out, aname)?;
                if dialect.has_numeric_ids() {
                    push_u32(out, *n_uname);
                }
            }
            Rerror { ename, code } => {
                push_string(out, ename)?;
                if dialect.has_numeric_ids() {
                    push_u32(out, *code);
                }
            }
            Rlerror { ecode } => push_u32(out, *ecode),
            Tflush { oldtag } => push_u16(out, *oldtag),
            Twalk { fid, newfid, wnames } => {
                push_u32(out, *fid);
                push_u32(out, *newfid);
                push_names(out, wnames)?;
            }
            Rwalk { wqids } => {
                push_u16(out, count_u16(wqids.len())?);
                for qid in wqids {
                    push_qid(out, qid);
                }
            }
            Topen { fid, mode } => {
                push_u32(out, *fid);
                push_u8(out, *mode);
            }
            Ropen { qid, iounit } | Rcreate { qid, iounit } | Rlopen { qid, iounit }
            | Rlcreate { qid, iounit } => {
                push_qid(out, qid);
                push_u32(out, *iounit);
            }
            Tcreate { fid, name, perm, mode, extension } => {
                push_u32(out, *fid);
                push_string(out, name)?;
                push_u32(out, *perm);
                push_u8(out, *mode);
                if dialect.has_numeric_ids() {
                    push_string(out, extension)?;
                }
            }
            Tread { fid, offset, count } | Treaddir { fid, offset, count }
            | Twreaddir { fid, offset, count } => {
                push_u32(out, *fid);
                push_u64(out, *offset);
                push_u32(out, *count);
            }
            Rread { data } => push_data(out, data)?,
            Twrite { fid, offset, data } => {
                push_u32(out, *fid);
                push_u64(out, *offset);
                push_data(out, data)?;
            }
            Rwrite { count } => push_u32(out, *count),
            Tclunk { fid } | Tremove { fid } | Tstat { fid } | Tstatfs { fid }
            | Treadlink { fid } => push_u32(out, *fid),
            Rflush | Rclunk | Rremove | Rwstat | Rrename | Rsetattr | Rxattrcreate | Rfsync
            | Rlink | Rrenameat | Runlinkat | Raccess => {}
            Rstat { stat } => push_stat_with_count(out, stat)?,
            Twstat { fid, stat } => {
                push_u32(out, *fid);
                push_stat_with_count(out, stat)?;
            }
            Rstatfs { statfs } => {
                push_u32(out, statfs.typ);
                push_u32(out, statfs.bsize);
                push_u64(out, statfs.blocks);
                push_u64(out, statfs.bfree);
                push_u64(out, statfs.bavail);
                push_u64(out, statfs.files);
                push_u64(out, statfs.ffree);
                push_u64(out, statfs.fsid);
                push_u32(out, statfs.namelen);
            }
            Tlopen { fid, flags } | Taccess { fid, flags } => {
                push_u32(out, *fid);
                push_u32(out, *flags);
            }
            Tlcreate { fid, name, flags, mode, gid } => {
                push_u32(out, *fid);
                push_string(out, name)?;
                push_u32(out, *flags);
                push_u32(out, *mode);
                push_u32(out, *gid);
            }
            Tsymlink { fid, name, symtgt, gid } => {
                push_u32(out, *fid);
                push_string(out, name)?;
                push_string(out, symtgt)?;
                push_u32(out, *gid);
            }
            Rsymlink { qid } | Rmknod { qid } | Rmkdir { qid } => push_qid(out, qid),
            Tmknod { dfid, name, mode, major, minor, gid } => {
                push_u32(out, *dfid);
                push_string(out, name)?;
                push_u32(out, *mode);
                push_u32(out, *major);
                push_u32(out, *minor);
                push_u32(out, *gid);
            }
            Trename { fid, dfid, name } => {
                push_u32(out, *fid);
                push_u32(out, *dfid);
                push_string(out, name)?;
            }
            Rreadlink { target } => push_string(out, target)?,
            Tgetattr { fid, req_mask } => {
                push_u32(out, *fid);
                push_u64(out, req_mask.bits());
            }
            Rgetattr { valid, qid, attr } => {
                push_u64(out, valid.bits());
                push_qid(out, qid);
                push_attr(out, attr);
            }
            Tsetattr { fid, valid, stat } => {
                push_u32(out, *fid);
                push_u32(out, valid.bits());
                push_u32(out, stat.mode);
                push_u32(out, stat.uid);
                push_u32(out, stat.gid);
                push_u64(out, stat.size);
                push_time(out, &stat.atime);
                push_time(out, &stat.mtime);
            }
            Txattrwalk { fid, newfid, name } => {
                push_u32(out, *fid);
                push_u32(out, *newfid);
                push_string(out, name)?;
            }
            Rxattrwalk { size } => push_u64(out, *size),
            Txattrcreate { fid, name, attr_size, flags } => {
                push_u32(out, *fid);
                push_string(out, name)?;
                push_u64(out, *attr_size);
                push_u32(out, *flags);
            }
            Rreaddir { entries } => {
                let mut data = Vec::new();
                for entry in entries {
                    push_dirent(&mut data, entry)?;
                }
                push_data(out, &data)?;
            }
            Tfsync { fid, datasync } => {
                push_u32(out, *fid);
                push_u32(out, *datasync);
            }
            Tlock { fid, flock } => {
                push_u32(out, *fid);
                push_u8(out, flock.typ);
                push_u32(out, flock.flags);
                push_u64(out, flock.start);
                push_u64(out, flock.length);
                push_u32(out, flock.proc_id);
                push_string(out, &flock.client_id)?;
            }
            Rlock { status } => push_u8(out, *status),
            Tgetlock { fid, flock } => {
                push_u32(out, *fid);
                push_getlock(out, flock)?;
            }
            Rgetlock { flock } => push_getlock(out, flock)?,
            Tlink { dfid, fid, name } => {
                push_u32(out, *dfid);
                push_u32(out, *fid);
                push_string(out, name)?;
            }
            Tmkdir { dfid, name, mode, gid } => {
                push_u32(out, *dfid);
                push_string(out, name)?;
                push_u32(out, *mode);
                push_u32(out, *gid);
            }
            Trenameat { olddirfid, oldname, newdirfid, newname } => {
                push_u32(out, *olddirfid);
                push_string(out, oldname)?;
                push_u32(out, *newdirfid);
                push_string(out, newname)?;
            }
            Tunlinkat { dirfid, name, flags } => {
                push_u32(out, *dirfid);
                push_string(out, name)?;
                push_u32(out, *flags);
            }
            Rwreaddir { entries } => {
                let mut data = Vec::new();
                for entry in entries {
                    push_dirent(&mut data, &entry.entry)?;
                    push_attr(&mut data, &entry.attr);
                }
                push_data(out, &data)?;
            }
            Twopen { fid, newfid, flags, wflags, mode, gid, attr_mask, wnames } => {
                push_u32(out, *fid);
                push_u32(out, *newfid);
                push_u32(out, *flags);
                push_u32(out, *wflags);
                push_u32(out, *mode);
                push_u32(out, *gid);
                push_u64(out, attr_mask.bits());
                push_names(out, wnames)?;
            }
            Rwopen { status, walked, qid, symlink_qid, iounit, attr } => {
                push_u8(out, *status);
                push_u16(out, *walked);
                push_qid(out, qid);
                push_qid(out, symlink_qid);
                push_u32(out, *iounit);
                push_attr(out, attr);
            }
        }
        Ok(())
    }

    /// Decode a body of message type `typ`.
    ///
    /// Bytes left over after the last field are ignored, except where a
    /// trailing field is itself inferred from the remaining length.
    pub fn decode(typ: u8, body: &[u8], dialect: Dialect) -> Result<Fcall> {
        use Fcall::*;
        let buf = &mut &body[..];
        let fcall = match typ {
            TVERSION => Tversion { msize: pop_u32(buf)?, version: pop_string(buf)? },
            RVERSION => Rversion { msize: pop_u32(buf)?, version: pop_string(buf)? },
            TAUTH => Tauth {
                afid: pop_u32(buf)?,
                uname: pop_string(buf)?,
                aname: pop_string(buf)?,
                n_uname: pop_n_uname(buf, dialect)?,
            },
            RAUTH => Rauth { aqid: pop_qid(buf)? },
            TATTACH => Tattach {
                fid: pop_u32(buf)?,
                afid: pop_u32(buf)?,
                uname: pop_string(buf)?,
                aname: pop_string(buf)?,
                n_uname: pop_n_uname(buf, dialect)?,
            },
            RATTACH => Rattach { qid: pop_qid(buf)? },
            RERROR => {
                let ename = pop_string(buf)?;
                let code = if buf.len() == 4 { pop_u32(buf)? } else { ERROR_UNDEFINED };
                Rerror { ename, code }
            }
            RLERROR => Rlerror { ecode: pop_u32(buf)? },
            TFLUSH => Tflush { oldtag: pop_u16(buf)? },
            RFLUSH => Rflush,
            TWALK => Twalk { fid: pop_u32(buf)?, newfid: pop_u32(buf)?, wnames: pop_names(buf)? },
            RWALK => {
                let count = pop_u16(buf)? as usize;
                let mut wqids = Vec::with_capacity(count.min(buf.len() / 13));
                for _ in 0..count {
                    wqids.push(pop_qid(buf)?);
                }
                Rwalk { wqids }
            }
            TOPEN => Topen { fid: pop_u32(buf)?, mode: pop_u8(buf)? },
            ROPEN => Ropen { qid: pop_qid(buf)?, iounit: pop_u32(buf)? },
            TCREATE => Tcreate {
                fid: pop_u32(buf)?,
                name: pop_string(buf)?,
                perm: pop_u32(buf)?,
                mode: pop_u8(buf)?,
                extension: if dialect.has_numeric_ids() { pop_string(buf)? } else { Vec::new() },
            },
            RCREATE => Rcreate { qid: pop_qid(buf)?, iounit: pop_u32(buf)? },
            TREAD => Tread { fid: pop_u32(buf)?, offset: pop_u64(buf)?, count: pop_u32(buf)? },
            RREAD => Rread { data: pop_data(buf)?.to_vec() },
            TWRITE => Twrite {
                fid: pop_u32(buf)?,
                offset: pop_u64(buf)?,
                data: pop_data(buf)?.to_vec(),
            },
            RWRITE => Rwrite { count: pop_u32(buf)? },
            TCLUNK => Tclunk { fid: pop_u32(buf)? },
            RCLUNK => Rclunk,
            TREMOVE => Tremove { fid: pop_u32(buf)? },
            RREMOVE => Rremove,
            TSTAT => Tstat { fid: pop_u32(buf)? },
            RSTAT => Rstat { stat: pop_stat_with_count(buf, dialect)? },
            TWSTAT => Twstat { fid: pop_u32(buf)?, stat: pop_stat_with_count(buf, dialect)? },
            RWSTAT => Rwstat,
            TSTATFS => Tstatfs { fid: pop_u32(buf)? },
            RSTATFS => Rstatfs {
                statfs: Statfs {
                    typ: pop_u32(buf)?,
                    bsize: pop_u32(buf)?,
                    blocks: pop_u64(buf)?,
                    bfree: pop_u64(buf)?,
                    bavail: pop_u64(buf)?,
                    files: pop_u64(buf)?,
                    ffree: pop_u64(buf)?,
                    fsid: pop_u64(buf)?,
                    namelen: pop_u32(buf)?,
                },
            },
            TLOPEN => Tlopen { fid: pop_u32(buf)?, flags: pop_u32(buf)? },
            RLOPEN => Rlopen { qid: pop_qid(buf)?, iounit: pop_u32(buf)? },
            TLCREATE => Tlcreate {
                fid: pop_u32(buf)?,
                name: pop_string(buf)?,
                flags: pop_u32(buf)?,
                mode: pop_u32(buf)?,
                gid: pop_u32(buf)?,
            },
            RLCREATE => Rlcreate { qid: pop_qid(buf)?, iounit: pop_u32(buf)? },
            TSYMLINK => Tsymlink {
                fid: pop_u32(buf)?,
                name: pop_string(buf)?,
                symtgt: pop_string(buf)?,
                gid: pop_u32(buf)?,
            },
            RSYMLINK => Rsymlink { qid: pop_qid(buf)? },
            TMKNOD => Tmknod {
                dfid: pop_u32(buf)?,
                name: pop_string(buf)?,
                mode: pop_u32(buf)?,
                major: pop_u32(buf)?,
                minor: pop_u32(buf)?,
                gid: pop_u32(buf)?,
            },
            RMKNOD => Rmknod { qid: pop_qid(buf)? },
            TRENAME => Trename { fid: pop_u32(buf)?, dfid: pop_u32(buf)?, name: pop_string(buf)? },
            RRENAME => Rrename,
            TREADLINK => Treadlink { fid: pop_u32(buf)? },
            RREADLINK => Rreadlink { target: pop_string(buf)? },
            TGETATTR => Tgetattr {
                fid: pop_u32(buf)?,
                req_mask: GetattrMask::from_bits_retain(pop_u64(buf)?),
            },
            RGETATTR => Rgetattr {
                valid: GetattrMask::from_bits_retain(pop_u64(buf)?),
                qid: pop_qid(buf)?,
                attr: pop_attr(buf)?,
            },
            TSETATTR => Tsetattr {
                fid: pop_u32(buf)?,
                valid: SetattrMask::from_bits_retain(pop_u32(buf)?),
                stat: SetAttr {
                    mode: pop_u32(buf)?,
                    uid: pop_u32(buf)?,
                    gid: pop_u32(buf)?,
                    size: pop_u64(buf)?,
                    atime: pop_time(buf)?,
                    mtime: pop_time(buf)?,
                },
            },
            RSETATTR => Rsetattr,
            TXATTRWALK => Txattrwalk {
                fid: pop_u32(buf)?,
                newfid: pop_u32(buf)?,
                name: pop_string(buf)?,
            },
            RXATTRWALK => Rxattrwalk { size: pop_u64(buf)? },
            TXATTRCREATE => Txattrcreate {
                fid: pop_u32(buf)?,
                name: pop_string(buf)?,
                attr_size: pop_u64(buf)?,
                flags: pop_u32(buf)?,
            },
            RXATTRCREATE => Rxattrcreate,
            TREADDIR => Treaddir { fid: pop_u32(buf)?, offset: pop_u64(buf)?, count: pop_u32(buf)? },
            RREADDIR => {
                let data = &mut pop_data(buf)?;
                let mut entries = Vec::new();
                while !data.is_empty() {
                    entries.push(pop_dirent(data)?);
                }
                Rreaddir { entries }
            }
            TFSYNC => Tfsync { fid: pop_u32(buf)?, datasync: pop_u32(buf)? },
            RFSYNC => Rfsync,
            TLOCK => Tlock {
                fid: pop_u32(buf)?,
                flock: Flock {
                    typ: pop_u8(buf)?,
                    flags: pop_u32(buf)?,
                    start: pop_u64(buf)?,
                    length: pop_u64(buf)?,
                    proc_id: pop_u32(buf)?,
                    client_id: pop_string(buf)?,
                },
            },
            RLOCK => Rlock { status: pop_u8(buf)? },
            TGETLOCK => Tgetlock { fid: pop_u32(buf)?, flock: pop_getlock(buf)? },
            RGETLOCK => Rgetlock { flock: pop_getlock(buf)? },
            TLINK => Tlink { dfid: pop_u32(buf)?, fid: pop_u32(buf)?, name: pop_string(buf)? },
            RLINK => Rlink,
            TMKDIR => Tmkdir {
                dfid: pop_u32(buf)?,
                name: pop_string(buf)?,
                mode: pop_u32(buf)?,
                gid: pop_u32(buf)?,
            },
            RMKDIR => Rmkdir { qid: pop_qid(buf)? },
            TRENAMEAT => Trenameat {
                olddirfid: pop_u32(buf)?,
                oldname: pop_string(buf)?,
                newdirfid: pop_u32(buf)?,
                newname: pop_string(buf)?,
            },
            RRENAMEAT => Rrenameat,
            TUNLINKAT => Tunlinkat {
                dirfid: pop_u32(buf)?,
                name: pop_string(buf)?,
                flags: pop_u32(buf)?,
            },
            RUNLINKAT => Runlinkat,
            TACCESS => Taccess { fid: pop_u32(buf)?, flags: pop_u32(buf)? },
            RACCESS => Raccess,
            TWREADDIR => Twreaddir { fid: pop_u32(buf)?, offset: pop_u64(buf)?, count: pop_u32(buf)? },
            RWREADDIR => {
                let data = &mut pop_data(buf)?;
                let mut entries = Vec::new();
                while !data.is_empty() {
                    entries.push(WindowsDirEntry { entry: pop_dirent(data)?, attr: pop_attr(data)? });
                }
                Rwreaddir { entries }
            }
            TWOPEN => Twopen {
                fid: pop_u32(buf)?,
                newfid: pop_u32(buf)?,
                flags: pop_u32(buf)?,
                wflags: pop_u32(buf)?,
                mode: pop_u32(buf)?,
                gid: pop_u32(buf)?,
                attr_mask: GetattrMask::from_bits_retain(pop_u64(buf)?),
                wnames: pop_names(buf)?,
            },
            RWOPEN => Rwopen {
                status: pop_u8(buf)?,
                walked: pop_u16(buf)?,
                qid: pop_qid(buf)?,
                symlink_qid: pop_qid(buf)?,
                iounit: pop_u32(buf)?,
                attr: pop_attr(buf)?,
            },
            other => return Err(Error::UnknownMessageType(other)),
        };
        Ok(fcall)
    }
}

fn count_u16(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::MalformedFrame(format!("{} elements do not fit a u16 count", len)))
}

fn pop_n_uname(buf: &mut &[u8], dialect: Dialect) -> Result<u32> {
    if dialect.has_numeric_ids() { pop_u32(buf) } else { Ok(NO_UNAME) }
}

fn push_names(out: &mut Vec<u8>, names: &[Vec<u8>]) -> Result<()> {
    push_u16(out, count_u16(names.len())?);
    for name in names {
        push_string(out, name)?;
    }
    Ok(())
}

fn pop_names(buf: &mut &[u8]) -> Result<Vec<Vec<u8>>> {
    let count = pop_u16(buf)? as usize;
    let mut names = Vec::with_capacity(count.min(buf.len() / 2));
    for _ in 0..count {
        names.push(pop_string(buf)?);
    }
    Ok(names)
}

/// `count[4]` followed by that many bytes.
fn push_data(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| Error::MalformedFrame(format!("{} byte payload does not fit a u32 count", data.len())))?;
    push_u32(out, len);
    push_bytes(out, data);
    Ok(())
}

fn pop_data<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let mut cur = *buf;
    let len = pop_u32(&mut cur)? as usize;
    let data = pop_bytes(&mut cur, len)?;
    *buf = cur;
    Ok(data)
}

fn push_time(out: &mut Vec<u8>, time: &Time) {
    push_u64(out, time.sec);
    push_u64(out, time.nsec);
}

fn pop_time(buf: &mut &[u8]) -> Result<Time> {
    Ok(Time { sec: pop_u64(buf)?, nsec: pop_u64(buf)? })
}

fn push_attr(out: &mut Vec<u8>, attr: &Attr) {
    push_u32(out, attr.mode);
    push_u32(out, attr.uid);
    push_u32(out, attr.gid);
    push_u64(out, attr.nlink);
    push_u64(out, attr.rdev);
    push_u64(out, attr.size);
    push_u64(out, attr.blksize);
    push_u64(out, attr.blocks);
    push_time(out, &attr.atime);
    push_time(out, &attr.mtime);
    push_time(out, &attr.ctime);
    push_time(out, &attr.btime);
    push_u64(out, attr.generation);
    push_u64(out, attr.data_version);
}

fn pop_attr(buf: &mut &[u8]) -> Result<Attr> {
    Ok(Attr {
        mode: pop_u32(buf)?,
        uid: pop_u32(buf)?,
        gid: pop_u32(buf)?,
        nlink: pop_u64(buf)?,
        rdev: pop_u64(buf)?,
        size: pop_u64(buf)?,
        blksize: pop_u64(buf)?,
        blocks: pop_u64(buf)?,
        atime: pop_time(buf)?,
        mtime: pop_time(buf)?,
        ctime: pop_time(buf)?,
        btime: pop_time(buf)?,
        generation: pop_u64(buf)?,
        data_version: pop_u64(buf)?,
    })
}

fn push_getlock(out: &mut Vec<u8>, flock: &Getlock) -> Result<()> {
    push_u8(out, flock.typ);
    push_u64(out, flock.start);
    push_u64(out, flock.length);
    push_u32(out, flock.proc_id);
    push_string(out, &flock.client_id)
}

fn pop_getlock(buf: &mut &[u8]) -> Result<Getlock> {
    Ok(Getlock {
        typ: pop_u8(buf)?,
        start: pop_u64(buf)?,
        length: pop_u64(buf)?,
        proc_id: pop_u32(buf)?,
        client_id: pop_string(buf)?,
    })
}

pub(crate) fn push_dirent(out: &mut Vec<u8>, entry: &DirEntry) -> Result<()> {
    push_qid(out, &entry.qid);
    push_u64(out, entry.offset);
    push_u8(out, entry.typ);
    push_string(out, &entry.name)
}

pub(crate) fn pop_dirent(buf: &mut &[u8]) -> Result<DirEntry> {
    Ok(DirEntry {
        qid: pop_qid(buf)?,
        offset: pop_u64(buf)?,
        typ: pop_u8(buf)?,
        name: pop_string(buf)?,
    })
}

/// Append a `stat` record: `size[2]` followed by the record itself.
pub fn push_stat(out: &mut Vec<u8>, stat: &Stat) -> Result<()> {
    let mut body = Vec::with_capacity(64);
    let base = &stat.base;
    push_u16(&mut body, base.typ);
    push_u32(&mut body, base.dev);
    push_qid(&mut body, &base.qid);
    push_u32(&mut body, base.mode);
    push_u32(&mut body, base.atime);
    push_u32(&mut body, base.mtime);
    push_u64(&mut body, base.length);
    push_string(&mut body, &base.name)?;
    push_string(&mut body, &base.uid)?;
    push_string(&mut body, &base.gid)?;
    push_string(&mut body, &base.muid)?;
    if let Some(unix) = &stat.unix {
        push_string(&mut body, &unix.extension)?;
        push_u32(&mut body, unix.n_uid);
        push_u32(&mut body, unix.n_gid);
        push_u32(&mut body, unix.n_muid);
    }
    push_u16(out, count_u16(body.len())?);
    push_bytes(out, &body);
    Ok(())
}

/// Pop a `stat` record. The `.u` suffix is read when the dialect carries it.
pub fn pop_stat(buf: &mut &[u8], dialect: Dialect) -> Result<Stat> {
    let mut cur = *buf;
    let size = pop_u16(&mut cur)? as usize;
    let rec = &mut pop_bytes(&mut cur, size)?;
    let base = StatBase {
        typ: pop_u16(rec)?,
        dev: pop_u32(rec)?,
        qid: pop_qid(rec)?,
        mode: pop_u32(rec)?,
        atime: pop_u32(rec)?,
        mtime: pop_u32(rec)?,
        length: pop_u64(rec)?,
        name: pop_string(rec)?,
        uid: pop_string(rec)?,
        gid: pop_string(rec)?,
        muid: pop_string(rec)?,
    };
    let unix = if dialect.has_numeric_ids() {
        Some(UnixStat {
            extension: pop_string(rec)?,
            n_uid: pop_u32(rec)?,
            n_gid: pop_u32(rec)?,
            n_muid: pop_u32(rec)?,
        })
    } else {
        None
    };
    *buf = cur;
    Ok(Stat { base, unix })
}

/// `Rstat`/`Twstat` wrap the record in one more `u16` count.
fn push_stat_with_count(out: &mut Vec<u8>, stat: &Stat) -> Result<()> {
    let mut rec = Vec::with_capacity(64);
    push_stat(&mut rec, stat)?;
    push_u16(out, count_u16(rec.len())?);
    push_bytes(out, &rec);
    Ok(())
}

fn pop_stat_with_count(buf: &mut &[u8], dialect: Dialect) -> Result<Stat> {
    let mut cur = *buf;
    let size = pop_u16(&mut cur)? as usize;
    let rec = &mut pop_bytes(&mut cur, size)?;
    let stat = pop_stat(rec, dialect)?;
    *buf = cur;
    Ok(stat)
}
