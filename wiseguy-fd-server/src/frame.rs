//! Length-prefixed wire framing: 4-byte big-endian length followed by
//! that many bytes. Bare integers travel as 4-byte big-endian values.

use std::io::{Read, Write};

use anyhow::{bail, Context, Error};

/// Upper bound on a single frame. Anything larger is a protocol error.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub fn send_u32<W: Write>(writer: &mut W, value: u32) -> Result<(), Error> {
    writer
        .write_all(&value.to_be_bytes())
        .context("failed to write integer")?;
    Ok(())
}

pub fn recv_u32<R: Read>(reader: &mut R) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .context("failed to read integer")?;
    Ok(u32::from_be_bytes(buf))
}

pub fn send_str<W: Write>(writer: &mut W, value: &str) -> Result<(), Error> {
    if value.len() > MAX_FRAME_LEN {
        bail!("frame too large ({} bytes)", value.len());
    }
    send_u32(writer, value.len() as u32)?;
    writer
        .write_all(value.as_bytes())
        .context("failed to write frame body")?;
    Ok(())
}

pub fn recv_str<R: Read>(reader: &mut R) -> Result<String, Error> {
    let len = recv_u32(reader).context("failed to read frame length")? as usize;
    if len > MAX_FRAME_LEN {
        bail!("malformed frame length {len}");
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .context("failed to read frame body")?;
    String::from_utf8(buf).context("frame body is not valid utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_str_round_trip() {
        let mut buf = Vec::new();
        send_str(&mut buf, "127.0.0.1:8080").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 14]);
        let mut cursor = Cursor::new(buf);
        assert_eq!(recv_str(&mut cursor).unwrap(), "127.0.0.1:8080");
    }

    #[test]
    fn test_u32_is_big_endian() {
        let mut buf = Vec::new();
        send_u32(&mut buf, 0x01020304).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_malformed_length_is_rejected() {
        let mut cursor = Cursor::new(vec![0xff, 0xff, 0xff, 0xff]);
        assert!(recv_str(&mut cursor).is_err());
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 5, b'a', b'b']);
        assert!(recv_str(&mut cursor).is_err());
    }
}
