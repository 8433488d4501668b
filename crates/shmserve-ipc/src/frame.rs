//! Multipart frame codec.
//!
//! ```text
//! u32 part_count | (u32 part_len | part_bytes)*      all little endian
//! ```

use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{IpcError, Result};

pub const MAX_PARTS: usize = 16;
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

pub type Parts = Vec<Bytes>;

pub fn encode(parts: &[&[u8]]) -> Result<Bytes> {
    if parts.len() > MAX_PARTS {
        return Err(IpcError::Malformed(format!("{} parts exceeds {MAX_PARTS}", parts.len())));
    }
    let total = 4 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
    if total > MAX_FRAME_BYTES {
        return Err(IpcError::Malformed(format!("frame of {total} bytes is too large")));
    }
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32_le(parts.len() as u32);
    for part in parts {
        buf.put_u32_le(part.len() as u32);
        buf.put_slice(part);
    }
    Ok(buf.freeze())
}

/// Decodes one complete frame held in memory (a datagram).
pub fn decode(mut buf: Bytes) -> Result<Parts> {
    let count = take_u32(&mut buf)? as usize;
    check_count(count)?;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let len = take_u32(&mut buf)? as usize;
        if buf.remaining() < len {
            return Err(IpcError::Malformed("truncated part".into()));
        }
        parts.push(buf.split_to(len));
    }
    if buf.has_remaining() {
        return Err(IpcError::Malformed(format!("{} trailing bytes", buf.remaining())));
    }
    Ok(parts)
}

pub fn write_frame<W: Write>(w: &mut W, parts: &[&[u8]]) -> Result<()> {
    let frame = encode(parts)?;
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame from a stream.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<Parts>> {
    let mut word = [0u8; 4];
    match r.read_exact(&mut word) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let count = u32::from_le_bytes(word) as usize;
    check_count(count)?;

    let mut parts = Vec::with_capacity(count);
    let mut total = 4;
    for _ in 0..count {
        read_exact_in_frame(r, &mut word)?;
        let len = u32::from_le_bytes(word) as usize;
        total += 4 + len;
        if total > MAX_FRAME_BYTES {
            return Err(IpcError::Malformed(format!("frame exceeds {MAX_FRAME_BYTES} bytes")));
        }
        let mut part = BytesMut::zeroed(len);
        read_exact_in_frame(r, &mut part)?;
        parts.push(part.freeze());
    }
    Ok(Some(parts))
}

fn read_exact_in_frame<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => IpcError::Closed,
        _ => IpcError::Io(e),
    })
}

fn take_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(IpcError::Malformed("truncated length".into()));
    }
    Ok(buf.get_u32_le())
}

fn check_count(count: usize) -> Result<()> {
    if count == 0 || count > MAX_PARTS {
        return Err(IpcError::Malformed(format!("invalid part count {count}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_frames_are_delimited() -> anyhow::Result<()> {
        let mut wire = Vec::new();
        write_frame(&mut wire, &[b"input0".as_slice(), b"output0".as_slice()])?;
        write_frame(&mut wire, &[b"ACK".as_slice()])?;

        let mut cursor = std::io::Cursor::new(wire);
        let first = read_frame(&mut cursor)?.unwrap();
        assert_eq!(first, vec![Bytes::from_static(b"input0"), Bytes::from_static(b"output0")]);
        let second = read_frame(&mut cursor)?.unwrap();
        assert_eq!(second, vec![Bytes::from_static(b"ACK")]);
        assert!(read_frame(&mut cursor)?.is_none());
        Ok(())
    }

    #[test]
    fn empty_parts_survive() -> anyhow::Result<()> {
        let frame = encode(&[b"".as_slice(), b"x".as_slice()])?;
        let parts = decode(frame)?;
        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_empty());
        Ok(())
    }

    #[test]
    fn eof_mid_frame_is_closed() -> anyhow::Result<()> {
        let frame = encode(&[b"abcdef".as_slice()])?;
        let mut cursor = std::io::Cursor::new(frame[..frame.len() - 2].to_vec());
        assert!(matches!(read_frame(&mut cursor), Err(IpcError::Closed)));
        Ok(())
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode(Bytes::from_static(&[0, 0, 0, 0])),
            Err(IpcError::Malformed(_))
        ));
        assert!(matches!(
            decode(Bytes::from_static(&[1, 0, 0, 0, 9, 0, 0, 0, 1])),
            Err(IpcError::Malformed(_))
        ));
        let mut cursor = std::io::Cursor::new(vec![0xff, 0xff, 0, 0]);
        assert!(matches!(read_frame(&mut cursor), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn oversized_frames_are_refused() {
        let big = vec![0u8; MAX_FRAME_BYTES];
        assert!(matches!(encode(&[big.as_slice()]), Err(IpcError::Malformed(_))));
    }
}
