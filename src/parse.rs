//! Path handling and 9P2000 directory data parsing.

use crate::error::{Error, Result};
use crate::fcall::pop_stat;
use crate::protocol::{Dialect, Stat};

/// Split a path into parent directory and leaf name.
pub(crate) fn split_parent_name(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }
    let (parent, name) = match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    };
    let parent = if parent.is_empty() { "/" } else { parent };
    if name.is_empty() || name == "." || name == ".." {
        Err(Error::InvalidPath(path.to_string()))
    } else {
        Ok((parent, name))
    }
}

/// Split a path into normalized components.
pub(crate) fn path_parts(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

pub(crate) fn is_dot_entry(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

/// Parse the stat records a 9P2000 `Tread` on a directory returns. Servers
/// only return whole records, so a short or misshapen one is an error.
pub(crate) fn parse_dir_stats(data: &[u8], dialect: Dialect) -> Result<Vec<Stat>> {
    let mut cur = data;
    let mut stats = Vec::new();
    while !cur.is_empty() {
        stats.push(pop_stat(&mut cur, dialect)?);
    }
    Ok(stats)
}
