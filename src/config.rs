//! Connection settings.

use std::time::Duration;

use crate::protocol::{DEFAULT_MSIZE, Dialect, NO_UNAME};

/// Parameters proposed during negotiation and used for the root attach.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Largest message the client proposes; the server may only lower it.
    pub msize: u32,
    /// Dialect proposed in `Tversion`.
    pub dialect: Dialect,
    pub uname: String,
    /// Export to attach to; for virtio and hypervisor shares this is the mount tag.
    pub aname: String,
    pub n_uname: u32,
    /// Group id for files and directories created through `.L`.
    pub gid: u32,
    /// Give up on a response after this long, flushing the request.
    pub request_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            msize: DEFAULT_MSIZE,
            dialect: Dialect::Linux,
            uname: String::from("user"),
            aname: String::new(),
            n_uname: NO_UNAME,
            gid: 0,
            request_timeout: None,
        }
    }
}

impl Config {
    pub fn with_msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_uname(mut self, uname: impl Into<String>, n_uname: u32) -> Self {
        self.uname = uname.into();
        self.n_uname = n_uname;
        self
    }

    pub fn with_gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self
    }

    pub fn with_aname(mut self, aname: impl Into<String>) -> Self {
        self.aname = aname.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
