//! FastCGI responder-role wire codec: just enough of the record layer
//! to accept a request off a listening socket and stream a response
//! back. Multiplexing is not supported; one request per connection.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};

use anyhow::{bail, Context, Error};

use wiseguy_daemon::Environ;

pub const FCGI_VERSION_1: u8 = 1;

pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_ABORT_REQUEST: u8 = 2;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;

pub const FCGI_RESPONDER: u16 = 1;
pub const FCGI_KEEP_CONN: u8 = 1;

pub const FCGI_REQUEST_COMPLETE: u8 = 0;
pub const FCGI_UNKNOWN_ROLE: u8 = 3;

/// Largest record payload; chosen as a multiple of 8 so full records
/// need no padding.
const MAX_CONTENT: usize = 0xfff8;

#[derive(Debug)]
pub struct Record {
    pub record_type: u8,
    pub request_id: u16,
    pub content: Vec<u8>,
}

pub fn read_record<R: Read>(reader: &mut R) -> io::Result<Record> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;
    if header[0] != FCGI_VERSION_1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported fcgi version {}", header[0]),
        ));
    }
    let record_type = header[1];
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_length = header[6] as usize;

    let mut content = vec![0u8; content_length];
    reader.read_exact(&mut content)?;
    if padding_length > 0 {
        let mut padding = [0u8; 255];
        reader.read_exact(&mut padding[..padding_length])?;
    }
    Ok(Record {
        record_type,
        request_id,
        content,
    })
}

pub fn write_record<W: Write>(
    writer: &mut W,
    record_type: u8,
    request_id: u16,
    content: &[u8],
) -> io::Result<()> {
    debug_assert!(content.len() <= 0xffff);
    let padding = (8 - content.len() % 8) % 8;
    let id = request_id.to_be_bytes();
    let len = (content.len() as u16).to_be_bytes();
    let header = [
        FCGI_VERSION_1,
        record_type,
        id[0],
        id[1],
        len[0],
        len[1],
        padding as u8,
        0,
    ];
    writer.write_all(&header)?;
    writer.write_all(content)?;
    writer.write_all(&[0u8; 8][..padding])?;
    Ok(())
}

fn read_pair_length(data: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *data.get(*pos)?;
    if first & 0x80 == 0 {
        *pos += 1;
        Some(first as usize)
    } else {
        let bytes = data.get(*pos..*pos + 4)?;
        *pos += 4;
        Some((u32::from_be_bytes([bytes[0] & 0x7f, bytes[1], bytes[2], bytes[3]])) as usize)
    }
}

/// Decode a FCGI_PARAMS payload into name/value pairs.
pub fn parse_name_value_pairs(data: &[u8]) -> Result<Vec<(String, String)>, Error> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let name_len = read_pair_length(data, &mut pos)
            .ok_or_else(|| anyhow::format_err!("truncated name length"))?;
        let value_len = read_pair_length(data, &mut pos)
            .ok_or_else(|| anyhow::format_err!("truncated value length"))?;
        if pos + name_len + value_len > data.len() {
            bail!("name-value pair overruns the record");
        }
        let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
        pos += name_len;
        let value = String::from_utf8_lossy(&data[pos..pos + value_len]).into_owned();
        pos += value_len;
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn write_pair_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        buf.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Encode one name/value pair as it appears in a FCGI_PARAMS payload.
pub fn encode_name_value_pair(buf: &mut Vec<u8>, name: &str, value: &str) {
    write_pair_length(buf, name.len());
    write_pair_length(buf, value.len());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// One accepted FastCGI request: the environment the web server sent
/// as PARAMS, the buffered STDIN body, and the stream to respond on.
pub struct FcgiRequest<S> {
    stream: S,
    request_id: u16,
    pub keep_conn: bool,
    params: Environ,
    stdin: Vec<u8>,
}

impl<S: Read + Write> FcgiRequest<S> {
    pub fn params(&self) -> &Environ {
        &self.params
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn take_stdin(&mut self) -> Cursor<Vec<u8>> {
        Cursor::new(std::mem::take(&mut self.stdin))
    }

    /// Stream response bytes to the web server as FCGI_STDOUT records.
    pub fn write_stdout(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let chunk = data.len().min(MAX_CONTENT);
            write_record(&mut self.stream, FCGI_STDOUT, self.request_id, &data[..chunk])?;
            data = &data[chunk..];
        }
        Ok(())
    }

    /// Close the stdout stream and complete the request.
    pub fn finish(mut self, app_status: u32) -> io::Result<()> {
        write_record(&mut self.stream, FCGI_STDOUT, self.request_id, &[])?;
        let status = app_status.to_be_bytes();
        let body = [
            status[0],
            status[1],
            status[2],
            status[3],
            FCGI_REQUEST_COMPLETE,
            0,
            0,
            0,
        ];
        write_record(&mut self.stream, FCGI_END_REQUEST, self.request_id, &body)?;
        self.stream.flush()
    }
}

/// Read one request off a fresh connection: BEGIN_REQUEST, the PARAMS
/// stream, then the STDIN stream. Returns `None` when the peer hangs
/// up before a request completes, aborts it, or asks for a role other
/// than responder.
pub fn accept_request<S: Read + Write>(mut stream: S) -> Result<Option<FcgiRequest<S>>, Error> {
    let begin = read_record(&mut stream).context("failed to read BEGIN_REQUEST")?;
    if begin.record_type != FCGI_BEGIN_REQUEST || begin.content.len() < 8 {
        bail!("expected BEGIN_REQUEST, got record type {}", begin.record_type);
    }
    let request_id = begin.request_id;
    let role = u16::from_be_bytes([begin.content[0], begin.content[1]]);
    let keep_conn = begin.content[2] & FCGI_KEEP_CONN != 0;
    if role != FCGI_RESPONDER {
        log::warn!("rejecting fcgi request with role {role}");
        let body = [0, 0, 0, 0, FCGI_UNKNOWN_ROLE, 0, 0, 0];
        write_record(&mut stream, FCGI_END_REQUEST, request_id, &body)?;
        return Ok(None);
    }

    let mut params_data = Vec::new();
    let mut stdin = Vec::new();
    let mut params_done = false;
    let mut stdin_done = false;
    while !(params_done && stdin_done) {
        let record = read_record(&mut stream).context("failed to read request records")?;
        match record.record_type {
            FCGI_PARAMS if record.request_id == request_id => {
                if record.content.is_empty() {
                    params_done = true;
                } else {
                    params_data.extend_from_slice(&record.content);
                }
            }
            FCGI_STDIN if record.request_id == request_id => {
                if record.content.is_empty() {
                    stdin_done = true;
                } else {
                    stdin.extend_from_slice(&record.content);
                }
            }
            FCGI_ABORT_REQUEST if record.request_id == request_id => {
                log::warn!("fcgi request {request_id} aborted by peer");
                return Ok(None);
            }
            // management records and stray ids are ignored
            _ => {}
        }
    }

    let params: HashMap<String, String> =
        parse_name_value_pairs(&params_data)?.into_iter().collect();
    Ok(Some(FcgiRequest {
        stream,
        request_id,
        keep_conn,
        params,
        stdin,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip_with_padding() {
        let mut buf = Vec::new();
        write_record(&mut buf, FCGI_STDOUT, 1, b"hello").unwrap();
        // 8-byte header + 5 content + 3 padding
        assert_eq!(buf.len(), 16);
        let record = read_record(&mut &buf[..]).unwrap();
        assert_eq!(record.record_type, FCGI_STDOUT);
        assert_eq!(record.request_id, 1);
        assert_eq!(record.content, b"hello");
    }

    #[test]
    fn test_full_records_need_no_padding() {
        let mut buf = Vec::new();
        write_record(&mut buf, FCGI_STDIN, 7, &[0u8; 16]).unwrap();
        assert_eq!(buf.len(), 24);
    }

    #[test]
    fn test_name_value_pairs_round_trip() {
        let long_value = "v".repeat(300);
        let mut buf = Vec::new();
        encode_name_value_pair(&mut buf, "REQUEST_METHOD", "GET");
        encode_name_value_pair(&mut buf, "LONG", &long_value);
        let pairs = parse_name_value_pairs(&buf).unwrap();
        assert_eq!(pairs[0], ("REQUEST_METHOD".to_string(), "GET".to_string()));
        assert_eq!(pairs[1].0, "LONG");
        assert_eq!(pairs[1].1.len(), 300);
    }

    #[test]
    fn test_truncated_pairs_are_rejected() {
        let mut buf = Vec::new();
        encode_name_value_pair(&mut buf, "NAME", "VALUE");
        buf.truncate(buf.len() - 2);
        assert!(parse_name_value_pairs(&buf).is_err());
    }

    #[test]
    fn test_bad_version_is_rejected() {
        let bytes = [9u8, FCGI_BEGIN_REQUEST, 0, 1, 0, 0, 0, 0];
        assert!(read_record(&mut &bytes[..]).is_err());
    }
}
