//! Request-side plumbing: a byte-counting buffered reader, the
//! HTTP/1.1 head parser and the CGI-style environment builder.

use std::io::{self, BufRead, BufReader, Read};

use percent_encoding::percent_decode_str;

use wiseguy_daemon::Environ;

/// Longest request or header line we are willing to buffer.
const MAX_LINE: usize = 64 * 1024;

/// A buffered reader that tracks the cumulative bytes handed out, so
/// the worker can tell exactly how much of a request body was consumed
/// (`socket_tell`).
pub struct CountingReader<R> {
    inner: BufReader<R>,
    bytes_read: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> CountingReader<R> {
        CountingReader {
            inner: BufReader::new(inner),
            bytes_read: 0,
        }
    }

    /// Total bytes consumed from the socket so far.
    pub fn socket_tell(&self) -> u64 {
        self.bytes_read
    }

    /// True when a pipelined request is already sitting in the buffer,
    /// in which case the keep-alive poll must be skipped.
    pub fn has_buffered_data(&self) -> bool {
        !self.inner.buffer().is_empty()
    }

    /// Read one line including its terminator. `None` means EOF before
    /// any byte arrived.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self.inner.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_LINE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        self.bytes_read += n as u64;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Request body handed to the application. For a POST with a declared
/// `Content-Length` the reader is clamped to that length, so even an
/// unbounded read cannot swallow the next pipelined request.
pub struct RequestBody<'a, R> {
    reader: &'a mut CountingReader<R>,
    remaining: Option<u64>,
}

impl<'a, R: Read> RequestBody<'a, R> {
    pub fn new(reader: &'a mut CountingReader<R>, limit: Option<u64>) -> RequestBody<'a, R> {
        RequestBody {
            reader,
            remaining: limit,
        }
    }
}

impl<R: Read> Read for RequestBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.remaining {
            None => self.reader.read(buf),
            Some(0) => Ok(0),
            Some(remaining) => {
                let want = buf.len().min(remaining.min(usize::MAX as u64) as usize);
                let n = self.reader.read(&mut buf[..want])?;
                self.remaining = Some(remaining - n as u64);
                Ok(n)
            }
        }
    }
}

/// Parsed request line and headers.
#[derive(Debug)]
pub struct RequestHead {
    /// The raw request line, terminator stripped, kept for logging.
    pub raw_requestline: String,
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub version: (u8, u8),
    /// Headers in arrival order; names as received.
    pub headers: Vec<(String, String)>,
    /// Bytes consumed by the request line plus headers.
    pub header_size: u64,
}

impl RequestHead {
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Content-Length` parsed as a non-negative integer, `None` when
    /// absent or unparseable.
    pub fn content_length(&self) -> Option<u64> {
        self.get_header("content-length")?.trim().parse().ok()
    }
}

pub enum HeadOutcome {
    /// The peer closed before sending anything.
    Eof,
    /// Unparseable request; the connection gets a 400 and closes.
    Malformed(String),
    Head(RequestHead),
}

/// Read and parse the request line and headers, recording
/// `header_size` at the exact point header parsing finished.
pub fn read_head<R: Read>(reader: &mut CountingReader<R>) -> io::Result<HeadOutcome> {
    let raw_requestline = match reader.read_line()? {
        None => return Ok(HeadOutcome::Eof),
        Some(line) => line,
    };
    let request_line = raw_requestline.trim_end_matches(['\r', '\n']).to_string();

    let (method, path, protocol, version) = match parse_request_line(&request_line) {
        Some(parts) => parts,
        None => {
            return Ok(HeadOutcome::Malformed(format!(
                "bad request line {request_line:?}"
            )))
        }
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let line = match reader.read_line()? {
            None => return Ok(HeadOutcome::Malformed("eof inside headers".to_string())),
            Some(line) => line,
        };
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // obsolete line folding: append to the previous header
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Ok(HeadOutcome::Malformed("continuation before any header".to_string())),
            }
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            None => return Ok(HeadOutcome::Malformed(format!("bad header line {line:?}"))),
        }
    }

    Ok(HeadOutcome::Head(RequestHead {
        raw_requestline: request_line,
        method,
        path,
        protocol,
        version,
        headers,
        header_size: reader.socket_tell(),
    }))
}

fn parse_request_line(line: &str) -> Option<(String, String, String, (u8, u8))> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    match parts.next() {
        Some(protocol) => {
            if parts.next().is_some() {
                return None;
            }
            let version = parse_http_version(protocol)?;
            Some((method, path, protocol.to_string(), version))
        }
        // bare "GET /path" is an HTTP/0.9 request
        None => Some((method, path, "HTTP/0.9".to_string(), (0, 9))),
    }
}

fn parse_http_version(protocol: &str) -> Option<(u8, u8)> {
    let rest = protocol.strip_prefix("HTTP/")?;
    let (major, minor) = rest.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Map a header name to its CGI form: uppercased, `-` to `_`.
fn translate_header(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Build the request environment handed to the application.
pub fn build_environ(head: &RequestHead, remote_addr: &str, base: &Environ) -> Environ {
    let mut env = base.clone();
    env.insert("SERVER_PROTOCOL".to_string(), head.protocol.clone());
    env.insert("REQUEST_METHOD".to_string(), head.method.clone());

    let (path, query) = match head.path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (head.path.as_str(), ""),
    };
    env.insert(
        "PATH_INFO".to_string(),
        percent_decode_str(path).decode_utf8_lossy().into_owned(),
    );
    env.insert("QUERY_STRING".to_string(), query.to_string());
    env.insert("REMOTE_ADDR".to_string(), remote_addr.to_string());

    env.insert(
        "CONTENT_TYPE".to_string(),
        head.get_header("content-type")
            .unwrap_or("text/plain")
            .to_string(),
    );
    if let Some(length) = head.get_header("content-length") {
        if !length.is_empty() {
            env.insert("CONTENT_LENGTH".to_string(), length.to_string());
        }
    }

    for (name, value) in &head.headers {
        let translated = translate_header(name);
        if env.contains_key(&translated) {
            continue;
        }
        let http_key = format!("HTTP_{translated}");
        match env.get_mut(&http_key) {
            // repeated headers are comma-joined in arrival order
            Some(existing) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => {
                env.insert(http_key, value.clone());
            }
        }
    }
    env
}
