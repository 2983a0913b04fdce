//! Frame layer: `size[4] type[1] tag[2] body`, with `size` counting itself.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::fcall::Fcall;
use crate::message::{pop_u8, pop_u16, pop_u32, push_u8, push_u16, push_u32};
use crate::protocol::{Dialect, msg_name};

pub const HEADER_SIZE: usize = 7;

/// Frame header as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub typ: u8,
    pub tag: u16,
}

impl Header {
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u32(out, self.size);
        push_u8(out, self.typ);
        push_u16(out, self.tag);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Header> {
        let mut cur = *buf;
        let header = Header {
            size: pop_u32(&mut cur)?,
            typ: pop_u8(&mut cur)?,
            tag: pop_u16(&mut cur)?,
        };
        *buf = cur;
        Ok(header)
    }
}

/// A complete frame with its body still encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub typ: u8,
    pub tag: u16,
    pub body: Vec<u8>,
}

impl Frame {
    /// Encode `fcall` into a frame for `tag`.
    pub fn new(fcall: &Fcall, tag: u16, dialect: Dialect) -> Result<Self> {
        let mut body = Vec::with_capacity(64);
        fcall.encode(dialect, &mut body)?;
        Ok(Self {
            typ: fcall.msg_type(),
            tag,
            body,
        })
    }

    pub fn header(&self) -> Result<Header> {
        let size = u32::try_from(HEADER_SIZE + self.body.len())
            .map_err(|_| Error::MalformedFrame(format!("{} byte body", self.body.len())))?;
        Ok(Header {
            size,
            typ: self.typ,
            tag: self.tag,
        })
    }

    /// Header followed by body, ready for a single write.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.body.len());
        self.header()?.encode(&mut buf);
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    pub fn decode(&self, dialect: Dialect) -> Result<Fcall> {
        Fcall::decode(self.typ, &self.body, dialect)
    }
}

/// Read one frame. Frames larger than `max_size` are rejected before their
/// body is read.
pub async fn read_frame<R>(reader: &mut R, max_size: u32) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut size_buf = [0u8; 4];
    reader.read_exact(&mut size_buf).await?;
    let size = u32::from_le_bytes(size_buf);
    if (size as usize) < HEADER_SIZE {
        return Err(Error::MalformedFrame(format!(
            "declared size {} is smaller than the header",
            size
        )));
    }
    if size > max_size {
        return Err(Error::MalformedFrame(format!(
            "declared size {} exceeds msize {}",
            size, max_size
        )));
    }

    let mut rest = vec![0u8; size as usize - 4];
    reader.read_exact(&mut rest).await?;
    let mut cur = rest.as_slice();
    let typ = pop_u8(&mut cur)?;
    let tag = pop_u16(&mut cur)?;
    rest.drain(..HEADER_SIZE - 4);
    log::trace!("read {} tag={} size={}", msg_name(typ), tag, size);
    Ok(Frame {
        typ,
        tag,
        body: rest,
    })
}

/// Write one frame as a single buffer and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    log::trace!(
        "wrote {} tag={} size={}",
        msg_name(frame.typ),
        frame.tag,
        bytes.len()
    );
    Ok(())
}
