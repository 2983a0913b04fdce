//! Asynchronous 9P client engine for 9P2000, 9P2000.u, 9P2000.L and 9P2000.W.
//!
//! A [`Session`] negotiates the version on any tokio byte stream and
//! multiplexes concurrent requests over it by tag. [`Client`] layers
//! path-based file operations on top of an attached session.

mod client;
mod config;
mod error;
pub mod fcall;
pub mod frame;
pub mod message;
mod mux;
mod parse;
pub mod protocol;
mod session;
pub mod transport;

pub use client::{Client, FidPool};
pub use config::Config;
pub use error::{Error, Result};
pub use fcall::Fcall;
pub use frame::Frame;
pub use protocol::{Dialect, Qid, QidType, Stat};
pub use session::{FileAttr, Pending, Session, State, WindowsOpen};
pub use transport::{BoxTransport, Transport};
