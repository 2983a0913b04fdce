//! 9P protocol constants and data types.

use core::fmt;

use bitflags::bitflags;

/// Special values used by the protocol.
pub const NO_FID: u32 = 0xFFFF_FFFF;
pub const NO_TAG: u16 = 0xFFFF;
/// `n_uname` meaning "no numeric uid supplied".
pub const NO_UNAME: u32 = 0xFFFF_FFFF;
/// Legacy `Rerror` code when the peer did not send one.
pub const ERROR_UNDEFINED: u32 = 0xFFFF_FFFF;

// 9P2000.L
pub const TLERROR: u8 = 6;
pub const RLERROR: u8 = 7;
pub const TSTATFS: u8 = 8;
pub const RSTATFS: u8 = 9;
pub const TLOPEN: u8 = 12;
pub const RLOPEN: u8 = 13;
pub const TLCREATE: u8 = 14;
pub const RLCREATE: u8 = 15;
pub const TSYMLINK: u8 = 16;
pub const RSYMLINK: u8 = 17;
pub const TMKNOD: u8 = 18;
pub const RMKNOD: u8 = 19;
pub const TRENAME: u8 = 20;
pub const RRENAME: u8 = 21;
pub const TREADLINK: u8 = 22;
pub const RREADLINK: u8 = 23;
pub const TGETATTR: u8 = 24;
pub const RGETATTR: u8 = 25;
pub const TSETATTR: u8 = 26;
pub const RSETATTR: u8 = 27;
pub const TXATTRWALK: u8 = 30;
pub const RXATTRWALK: u8 = 31;
pub const TXATTRCREATE: u8 = 32;
pub const RXATTRCREATE: u8 = 33;
pub const TREADDIR: u8 = 40;
pub const RREADDIR: u8 = 41;
pub const TFSYNC: u8 = 50;
pub const RFSYNC: u8 = 51;
pub const TLOCK: u8 = 52;
pub const RLOCK: u8 = 53;
pub const TGETLOCK: u8 = 54;
pub const RGETLOCK: u8 = 55;
pub const TLINK: u8 = 70;
pub const RLINK: u8 = 71;
pub const TMKDIR: u8 = 72;
pub const RMKDIR: u8 = 73;
pub const TRENAMEAT: u8 = 74;
pub const RRENAMEAT: u8 = 75;
pub const TUNLINKAT: u8 = 76;
pub const RUNLINKAT: u8 = 77;

// 9P2000 / 9P2000.u
pub const TVERSION: u8 = 100;
pub const RVERSION: u8 = 101;
pub const TAUTH: u8 = 102;
pub const RAUTH: u8 = 103;
pub const TATTACH: u8 = 104;
pub const RATTACH: u8 = 105;
pub const TERROR: u8 = 106;
pub const RERROR: u8 = 107;
pub const TFLUSH: u8 = 108;
pub const RFLUSH: u8 = 109;
pub const TWALK: u8 = 110;
pub const RWALK: u8 = 111;
pub const TOPEN: u8 = 112;
pub const ROPEN: u8 = 113;
pub const TCREATE: u8 = 114;
pub const RCREATE: u8 = 115;
pub const TREAD: u8 = 116;
pub const RREAD: u8 = 117;
pub const TWRITE: u8 = 118;
pub const RWRITE: u8 = 119;
pub const TCLUNK: u8 = 120;
pub const RCLUNK: u8 = 121;
pub const TREMOVE: u8 = 122;
pub const RREMOVE: u8 = 123;
pub const TSTAT: u8 = 124;
pub const RSTAT: u8 = 125;
pub const TWSTAT: u8 = 126;
pub const RWSTAT: u8 = 127;

// 9P2000.W
pub const TACCESS: u8 = 128;
pub const RACCESS: u8 = 129;
pub const TWREADDIR: u8 = 130;
pub const RWREADDIR: u8 = 131;
pub const TWOPEN: u8 = 132;
pub const RWOPEN: u8 = 133;

pub const OREAD: u8 = 0;
pub const OWRITE: u8 = 1;
pub const ORDWR: u8 = 2;
pub const OEXEC: u8 = 3;
pub const OTRUNC: u8 = 0x10;
pub const ORCLOSE: u8 = 0x40;

pub const P9_DOTL_RDONLY: u32 = 0;
pub const P9_DOTL_WRONLY: u32 = 1;
pub const P9_DOTL_RDWR: u32 = 2;
pub const P9_DOTL_CREATE: u32 = 0x40;
pub const P9_DOTL_EXCL: u32 = 0x80;
pub const P9_DOTL_TRUNC: u32 = 0x200;
pub const P9_DOTL_APPEND: u32 = 0x400;
pub const P9_DOTL_DIRECTORY: u32 = 0x10000;

pub const P9_LOCK_TYPE_RDLCK: u8 = 0;
pub const P9_LOCK_TYPE_WRLCK: u8 = 1;
pub const P9_LOCK_TYPE_UNLCK: u8 = 2;

pub const P9_LOCK_SUCCESS: u8 = 0;
pub const P9_LOCK_BLOCKED: u8 = 1;
pub const P9_LOCK_ERROR: u8 = 2;
pub const P9_LOCK_GRACE: u8 = 3;

pub const P9_LOCK_FLAGS_BLOCK: u32 = 1;
pub const P9_LOCK_FLAGS_RECLAIM: u32 = 2;

/// `Tunlinkat` flag requesting directory removal.
pub const AT_REMOVEDIR: u32 = 0x200;

pub const DMDIR: u32 = 0x8000_0000;

pub const DEFAULT_MSIZE: u32 = 65536;
/// Smallest `msize` accepted from a server.
pub const MIN_MSIZE: u32 = 256;

/// Most path elements a single `Twalk` may carry.
pub const MAXWELEM: usize = 16;

/// Room for the `Twrite`/`Rread` header: size, type, tag, fid, offset, count.
pub const IOHDRSZ: u32 = 24;

bitflags! {
    /// Bits in `Qid::typ`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QidType: u8 {
        const DIR     = 0x80;
        const APPEND  = 0x40;
        const EXCL    = 0x20;
        const MOUNT   = 0x10;
        const AUTH    = 0x08;
        const TMP     = 0x04;
        const SYMLINK = 0x02;
        const LINK    = 0x01;
        const FILE    = 0x00;
    }
}

bitflags! {
    /// Bits in `mask` and `valid` of `Tgetattr` and `Rgetattr`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GetattrMask: u64 {
        const MODE         = 0x0000_0001;
        const NLINK        = 0x0000_0002;
        const UID          = 0x0000_0004;
        const GID          = 0x0000_0008;
        const RDEV         = 0x0000_0010;
        const ATIME        = 0x0000_0020;
        const MTIME        = 0x0000_0040;
        const CTIME        = 0x0000_0080;
        const INO          = 0x0000_0100;
        const SIZE         = 0x0000_0200;
        const BLOCKS       = 0x0000_0400;
        const BTIME        = 0x0000_0800;
        const GEN          = 0x0000_1000;
        const DATA_VERSION = 0x0000_2000;

        const BASIC = 0x0000_07ff;
        const ALL   = 0x0000_3fff;
    }
}

bitflags! {
    /// Bits in `valid` of `Tsetattr`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SetattrMask: u32 {
        const MODE      = 0x0000_0001;
        const UID       = 0x0000_0002;
        const GID       = 0x0000_0004;
        const SIZE      = 0x0000_0008;
        const ATIME     = 0x0000_0010;
        const MTIME     = 0x0000_0020;
        const CTIME     = 0x0000_0040;
        const ATIME_SET = 0x0000_0080;
        const MTIME_SET = 0x0000_0100;
    }
}

/// Protocol dialect, ordered from oldest to newest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Dialect {
    /// Plain 9P2000.
    Base,
    /// 9P2000.u: numeric ids and the `Stat` extension.
    Unix,
    /// 9P2000.L
    #[default]
    Linux,
    /// 9P2000.W: `.L` plus the Windows access/readdir/open messages.
    Windows,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Base => "9P2000",
            Dialect::Unix => "9P2000.u",
            Dialect::Linux => "9P2000.L",
            Dialect::Windows => "9P2000.W",
        }
    }

    /// Parse a version string; servers disagree on case, so matching ignores it.
    pub fn parse(version: &[u8]) -> Option<Self> {
        [Dialect::Base, Dialect::Unix, Dialect::Linux, Dialect::Windows]
            .into_iter()
            .find(|d| d.as_str().as_bytes().eq_ignore_ascii_case(version))
    }

    /// Whether `Tattach`/`Tauth` carry `n_uname` and `Stat` carries the `.u` suffix.
    pub fn has_numeric_ids(self) -> bool {
        self != Dialect::Base
    }

    pub fn is_linux(self) -> bool {
        matches!(self, Dialect::Linux | Dialect::Windows)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qid identifies a file within a 9P server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub fn is_dir(&self) -> bool {
        self.typ.contains(QidType::DIR)
    }

    pub fn is_symlink(&self) -> bool {
        self.typ.contains(QidType::SYMLINK)
    }
}

/// Seconds and nanoseconds, as carried by `.L` attribute records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Time {
    pub sec: u64,
    pub nsec: u64,
}

/// Fields common to every 9P2000 `stat` record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatBase {
    pub typ: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: Vec<u8>,
    pub uid: Vec<u8>,
    pub gid: Vec<u8>,
    pub muid: Vec<u8>,
}

/// 9P2000.u suffix of a `stat` record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnixStat {
    pub extension: Vec<u8>,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
}

/// A `stat` record; `unix` is present exactly when the dialect carries it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub base: StatBase,
    pub unix: Option<UnixStat>,
}

/// `Rstatfs` body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statfs {
    pub typ: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

/// Attribute block shared by `Rgetattr`, `Rwopen` and `.W` directory entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
    pub btime: Time,
    pub generation: u64,
    pub data_version: u64,
}

/// `Tsetattr` payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Time,
    pub mtime: Time,
}

/// `Tlock` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Flock {
    pub typ: u8,
    pub flags: u32,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: Vec<u8>,
}

/// `Tgetlock`/`Rgetlock` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Getlock {
    pub typ: u8,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: Vec<u8>,
}

/// `.L` directory entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub qid: Qid,
    pub offset: u64,
    pub typ: u8,
    pub name: Vec<u8>,
}

/// `.W` directory entry: a `DirEntry` with its attributes inline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WindowsDirEntry {
    pub entry: DirEntry,
    pub attr: Attr,
}

/// Human-readable message name for logging.
pub fn msg_name(typ: u8) -> &'static str {
    match typ {
        TLERROR => "Tlerror",
        RLERROR => "Rlerror",
        TSTATFS => "Tstatfs",
        RSTATFS => "Rstatfs",
        TLOPEN => "Tlopen",
        RLOPEN => "Rlopen",
        TLCREATE => "Tlcreate",
        RLCREATE => "Rlcreate",
        TSYMLINK => "Tsymlink",
        RSYMLINK => "Rsymlink",
        TMKNOD => "Tmknod",
        RMKNOD => "Rmknod",
        TRENAME => "Trename",
        RRENAME => "Rrename",
        TREADLINK => "Treadlink",
        RREADLINK => "Rreadlink",
        TGETATTR => "Tgetattr",
        RGETATTR => "Rgetattr",
        TSETATTR => "Tsetattr",
        RSETATTR => "Rsetattr",
        TXATTRWALK => "Txattrwalk",
        RXATTRWALK => "Rxattrwalk",
        TXATTRCREATE => "Txattrcreate",
        RXATTRCREATE => "Rxattrcreate",
        TREADDIR => "Treaddir",
        RREADDIR => "Rreaddir",
        TFSYNC => "Tfsync",
        RFSYNC => "Rfsync",
        TLOCK => "Tlock",
        RLOCK => "Rlock",
        TGETLOCK => "Tgetlock",
        RGETLOCK => "Rgetlock",
        TLINK => "Tlink",
        RLINK => "Rlink",
        TMKDIR => "Tmkdir",
        RMKDIR => "Rmkdir",
        TRENAMEAT => "Trenameat",
        RRENAMEAT => "Rrenameat",
        TUNLINKAT => "Tunlinkat",
        RUNLINKAT => "Runlinkat",
        TVERSION => "Tversion",
        RVERSION => "Rversion",
        TAUTH => "Tauth",
        RAUTH => "Rauth",
        TATTACH => "Tattach",
        RATTACH => "Rattach",
        TERROR => "Terror",
        RERROR => "Rerror",
        TFLUSH => "Tflush",
        RFLUSH => "Rflush",
        TWALK => "Twalk",
        RWALK => "Rwalk",
        TOPEN => "Topen",
        ROPEN => "Ropen",
        TCREATE => "Tcreate",
        RCREATE => "Rcreate",
        TREAD => "Tread",
        RREAD => "Rread",
        TWRITE => "Twrite",
        RWRITE => "Rwrite",
        TCLUNK => "Tclunk",
        RCLUNK => "Rclunk",
        TREMOVE => "Tremove",
        RREMOVE => "Rremove",
        TSTAT => "Tstat",
        RSTAT => "Rstat",
        TWSTAT => "Twstat",
        RWSTAT => "Rwstat",
        TACCESS => "Taccess",
        RACCESS => "Raccess",
        TWREADDIR => "Twreaddir",
        RWREADDIR => "Rwreaddir",
        TWOPEN => "Twopen",
        RWOPEN => "Rwopen",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_parse_ignores_case() {
        assert_eq!(Dialect::parse(b"9p2000.L"), Some(Dialect::Linux));
        assert_eq!(Dialect::parse(b"9P2000.u"), Some(Dialect::Unix));
        assert_eq!(Dialect::parse(b"9P2000"), Some(Dialect::Base));
        assert_eq!(Dialect::parse(b"unknown"), None);
        assert_eq!(Dialect::parse(b"9P2000.X"), None);
    }

    #[test]
    fn dialects_are_ordered_oldest_first() {
        assert!(Dialect::Base < Dialect::Unix);
        assert!(Dialect::Unix < Dialect::Linux);
        assert!(Dialect::Linux < Dialect::Windows);
        assert_eq!(Dialect::default().as_str(), "9P2000.L");
    }

    #[test]
    fn response_codes_are_request_plus_one() {
        for t in [TSTATFS, TLOPEN, TREADDIR, TUNLINKAT, TVERSION, TWSTAT, TWOPEN] {
            assert_eq!(t % 2, 0);
            assert!(msg_name(t + 1).starts_with('R'));
        }
    }
}
