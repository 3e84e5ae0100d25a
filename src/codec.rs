//! Length-prefixed binary framing for [`Packet`].
//!
//! ```text
//! [4B length][4B ver][4B mt][8B mid][8B sid][8B rid][4B extLen][4B plLen][ext][pl]
//! ```
//! All integers are big-endian. `length` counts the bytes that follow it,
//! so `length = 40 + extLen + plLen`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::packet::Packet;

pub const LENGTH_PREFIX_LEN: usize = 4;
/// ver + mt + mid + sid + rid + extLen + plLen
pub const HEADER_LEN: usize = 40;
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encodes without a size check. Use [`serialize_with_limit`] for packets
/// whose body size is not already bounded.
pub fn serialize(p: &Packet) -> Bytes {
    let len = HEADER_LEN + p.ext.len() + p.pl.len();
    debug_assert!(len <= u32::MAX as usize, "frame length {} overflows the u32 prefix", len);
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + len);
    buf.put_u32(len as u32);
    buf.put_i32(p.ver);
    buf.put_i32(p.mt);
    buf.put_i64(p.mid);
    buf.put_i64(p.sid);
    buf.put_i64(p.rid);
    buf.put_u32(p.ext.len() as u32);
    buf.put_u32(p.pl.len() as u32);
    buf.put_slice(&p.ext);
    buf.put_slice(&p.pl);
    buf.freeze()
}

/// Encodes `p`, refusing frames whose length exceeds `max_frame_len` or
/// does not fit the 32-bit length prefix.
pub fn serialize_with_limit(p: &Packet, max_frame_len: usize) -> Result<Bytes, FrameError> {
    let len = HEADER_LEN + p.ext.len() + p.pl.len();
    let max = max_frame_len.min(u32::MAX as usize);
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    Ok(serialize(p))
}

/// Decode one complete frame (length prefix included) using the default size limit.
pub fn deserialize(frame: &[u8]) -> Result<Packet, FrameError> {
    deserialize_with_limit(frame, DEFAULT_MAX_FRAME_LEN)
}

pub fn deserialize_with_limit(frame: &[u8], max_frame_len: usize) -> Result<Packet, FrameError> {
    if frame.len() < LENGTH_PREFIX_LEN + HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: LENGTH_PREFIX_LEN + HEADER_LEN,
            actual: frame.len(),
        });
    }
    let len = check_length(read_prefix(frame), max_frame_len)?;
    let body = &frame[LENGTH_PREFIX_LEN..];
    if body.len() < len {
        return Err(FrameError::Truncated {
            expected: len,
            actual: body.len(),
        });
    }
    decode_body(&body[..len])
}

/// Reads exactly one frame. A stream that ends cleanly before a new frame
/// yields [`FrameError::Closed`]; one that ends inside a frame is truncated.
pub async fn read_packet<R>(reader: &mut R, max_frame_len: usize) -> Result<Packet, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::Closed
            } else {
                FrameError::Truncated {
                    expected: LENGTH_PREFIX_LEN,
                    actual: filled,
                }
            });
        }
        filled += n;
    }

    let len = check_length(u32::from_be_bytes(prefix) as usize, max_frame_len)?;
    let mut body = vec![0u8; len];
    let mut got = 0;
    while got < len {
        let n = reader.read(&mut body[got..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: len,
                actual: got,
            });
        }
        got += n;
    }
    decode_body(&body)
}

pub async fn write_packet<W>(writer: &mut W, p: &Packet) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    // write_all reports a short write as WriteZero
    writer.write_all(&serialize_with_limit(p, u32::MAX as usize)?).await?;
    writer.flush().await?;
    Ok(())
}

fn read_prefix(frame: &[u8]) -> usize {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&frame[..LENGTH_PREFIX_LEN]);
    u32::from_be_bytes(prefix) as usize
}

fn check_length(len: usize, max_frame_len: usize) -> Result<usize, FrameError> {
    if len < HEADER_LEN {
        return Err(FrameError::TooShort(len));
    }
    if len > max_frame_len {
        return Err(FrameError::TooLarge {
            len,
            max: max_frame_len,
        });
    }
    Ok(len)
}

/// `body` is exactly `length` bytes, starting at `ver`.
fn decode_body(body: &[u8]) -> Result<Packet, FrameError> {
    let len = body.len();
    let mut cur = body;
    let ver = cur.get_i32();
    let mt = cur.get_i32();
    let mid = cur.get_i64();
    let sid = cur.get_i64();
    let rid = cur.get_i64();
    let ext_len = cur.get_u32() as usize;
    let pl_len = cur.get_u32() as usize;

    if ext_len.checked_add(pl_len) != Some(cur.remaining()) {
        return Err(FrameError::LengthMismatch {
            len,
            ext: ext_len,
            pl: pl_len,
        });
    }

    let ext = Bytes::copy_from_slice(&cur[..ext_len]);
    let pl = Bytes::copy_from_slice(&cur[ext_len..]);

    Ok(Packet {
        ver,
        mt,
        mid,
        sid,
        rid,
        ext,
        pl,
    })
}
