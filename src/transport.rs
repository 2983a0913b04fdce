//! Transport abstraction for 9P traffic.
//!
//! The engine only needs a duplex byte stream. Hypervisor sockets, vsock or
//! virtio channels are established by the caller and handed over as any tokio
//! stream; `connect` covers the plain socket cases.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Duplex byte stream carrying 9P frames.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxTransport = Box<dyn Transport>;

/// Split `proto!addr[!port]` into the protocol and a socket address.
pub fn parse_addr(addr: &str) -> Option<(&str, String)> {
    let mut parts = addr.splitn(3, '!');
    let proto = parts.next()?;
    let host = parts.next()?;
    if host.is_empty() {
        return None;
    }
    let target = match (proto, parts.next()) {
        ("tcp", Some(port)) if !port.is_empty() => format!("{}:{}", host, port),
        ("unix", None) => host.to_string(),
        _ => return None,
    };
    Some((proto, target))
}

/// Connect to `tcp!host!port` or `unix!path`.
pub async fn connect(addr: &str) -> Result<BoxTransport> {
    let (proto, target) =
        parse_addr(addr).ok_or_else(|| Error::InvalidPath(format!("bad address {:?}", addr)))?;
    log::debug!("connecting to {} over {}", target, proto);
    match proto {
        "tcp" => {
            let stream = TcpStream::connect(&target).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => Ok(Box::new(tokio::net::UnixStream::connect(&target).await?)),
        _ => Err(Error::InvalidPath(format!("unsupported transport {:?}", proto))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_socket_addresses() {
        assert_eq!(
            parse_addr("tcp!127.0.0.1!564"),
            Some(("tcp", "127.0.0.1:564".to_string()))
        );
        assert_eq!(
            parse_addr("unix!/run/9p.sock"),
            Some(("unix", "/run/9p.sock".to_string()))
        );
        assert_eq!(parse_addr("tcp!host"), None);
        assert_eq!(parse_addr("unix!/a!b"), None);
        assert_eq!(parse_addr("tcp!!564"), None);
        assert_eq!(parse_addr("nonsense"), None);
    }

    #[tokio::test]
    async fn unsupported_protocol_is_rejected() {
        assert!(matches!(
            connect("udp!host!1").await,
            Err(Error::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn connects_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let transport = connect(&format!("tcp!127.0.0.1!{}", port)).await;
        assert!(transport.is_ok());
        accept.await.unwrap();
    }
}
