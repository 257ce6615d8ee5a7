//! The response finalizer. The whole response is buffered, so the
//! `Connection` decision (including the POST keep-alive safety check)
//! is settled before the first header byte is written, and the access
//! log line can carry the final status and byte count.

use std::io::{self, Write};

use wiseguy_daemon::Response;

pub const SERVER_SOFTWARE: &str = concat!("wiseguy/", env!("CARGO_PKG_VERSION"));

/// Write the response head and body. Returns the number of body bytes
/// actually written (zero for HEAD and bodyless statuses).
pub fn write_response<W: Write>(
    mut writer: W,
    response: &Response,
    method: &str,
    close_connection: bool,
) -> io::Result<u64> {
    write!(
        writer,
        "HTTP/1.1 {} {}\r\n",
        response.status, response.reason
    )?;

    let mut have_server = false;
    let mut have_length = false;
    for (name, value) in &response.headers {
        // the worker owns the Connection header outright
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        if name.eq_ignore_ascii_case("server") {
            have_server = true;
        }
        if name.eq_ignore_ascii_case("content-length") {
            have_length = true;
        }
        write!(writer, "{name}: {value}\r\n")?;
    }
    if !have_server {
        write!(writer, "Server: {SERVER_SOFTWARE}\r\n")?;
    }
    if !have_length && !response.body_forbidden() {
        write!(writer, "Content-Length: {}\r\n", response.body.len())?;
    }
    if close_connection {
        writer.write_all(b"Connection: close\r\n")?;
    }
    writer.write_all(b"\r\n")?;

    let mut body_bytes = 0u64;
    if method != "HEAD" && !response.body_forbidden() && !response.body.is_empty() {
        writer.write_all(&response.body)?;
        body_bytes = response.body.len() as u64;
    }
    writer.flush()?;
    Ok(body_bytes)
}
