//! Per-connection keep-alive loop: poll for input, parse the head,
//! dispatch to the application, settle the `Connection` decision and
//! finalize the response.

use std::io::{self, Read, Write};
use std::os::unix::io::AsFd;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Error};

use wiseguy_daemon::{poll_readable, Application, Environ, ManagedServer, Response};
use wiseguy_events::CollectorStack;

use crate::request::{build_environ, read_head, CountingReader, HeadOutcome, RequestBody};
use crate::response::write_response;

pub(crate) fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct ConnState {
    close_connection: bool,
    request_count: u64,
    start_time: Instant,
    raw_requestline: String,
}

/// Serve requests on one accepted connection until it closes.
///
/// Request-scoped failures never escape: I/O errors are logged at
/// warning with the elapsed time and request line, anything else at
/// error, and the connection is torn down either way.
pub fn handle_connection<S>(
    stream: &S,
    remote_addr: &str,
    server: &mut ManagedServer,
    app: &dyn Application,
    events: &mut CollectorStack,
    base_environ: &Environ,
) where
    S: AsFd,
    for<'a> &'a S: Read + Write,
{
    let mut reader = CountingReader::new(stream);
    let mut state = ConnState {
        close_connection: false,
        request_count: 0,
        start_time: Instant::now(),
        raw_requestline: String::new(),
    };

    loop {
        match handle_one_request(
            stream,
            &mut reader,
            &mut state,
            server,
            app,
            events,
            base_environ,
            remote_addr,
        ) {
            Ok(()) => {
                if state.close_connection {
                    break;
                }
            }
            Err(err) => {
                let elapsed = state.start_time.elapsed().as_secs_f64();
                if err.downcast_ref::<io::Error>().is_some() {
                    log::warn!(
                        "{remote_addr} \"{}\" {err:#} {elapsed:8.6}",
                        state.raw_requestline
                    );
                } else {
                    log::error!(
                        "http error {remote_addr} \"{}\" {err:?} {elapsed}",
                        state.raw_requestline
                    );
                }
                break;
            }
        }
    }
    // the teardown increment is the authoritative close of this
    // persistent connection
    server.close_request();
}

#[allow(clippy::too_many_arguments)]
fn handle_one_request<S>(
    stream: &S,
    reader: &mut CountingReader<&S>,
    state: &mut ConnState,
    server: &mut ManagedServer,
    app: &dyn Application,
    events: &mut CollectorStack,
    base_environ: &Environ,
    remote_addr: &str,
) -> Result<(), Error>
where
    S: AsFd,
    for<'a> &'a S: Read + Write,
{
    // a pipelined request may already be buffered; only poll the socket
    // when the buffer is dry
    if !reader.has_buffered_data() {
        let keepalive = server.config().keepalive_timeout;
        if !poll_readable(stream.as_fd(), keepalive)? {
            log::debug!("{remote_addr} closing idle connection");
            state.close_connection = true;
            return Ok(());
        }
    }
    state.start_time = Instant::now();

    let head = match read_head(reader).context("failed to read request head")? {
        HeadOutcome::Eof => {
            state.close_connection = true;
            return Ok(());
        }
        HeadOutcome::Malformed(reason) => {
            log::warn!("{remote_addr} bad request: {reason}");
            state.close_connection = true;
            write_response(stream, &Response::text(400, "Bad Request"), "GET", true)
                .context("failed to write error response")?;
            return Ok(());
        }
        HeadOutcome::Head(head) => head,
    };
    state.raw_requestline = head.raw_requestline.clone();

    let connection_header = head
        .get_header("connection")
        .map(|v| v.trim().to_ascii_lowercase());
    if head.version >= (1, 1) {
        state.close_connection = connection_header.as_deref() == Some("close");
    } else {
        state.close_connection = connection_header.as_deref() != Some("keep-alive");
    }
    if server.is_quit_requested() {
        state.close_connection = true;
    }

    let environ = build_environ(&head, remote_addr, base_environ);
    let is_post = head.method == "POST";
    let declared_length = head.content_length();
    let body_limit = if is_post { declared_length } else { None };

    let collector = events.open();
    let mut app_failed = false;
    let response = {
        let mut body = RequestBody::new(reader, body_limit);
        match app.call(&environ, &mut body) {
            Ok(response) => response,
            Err(err) => {
                app_failed = true;
                state.close_connection = true;
                log::error!(
                    "http error {remote_addr} \"{}\" {err:?}",
                    state.raw_requestline
                );
                Response::text(500, "Internal Server Error")
            }
        }
    };

    // Assume a POST closes the connection and only keep it alive when
    // the declared length matches exactly what was consumed from the
    // socket. Multipart and chunked POSTs therefore always close, which
    // keeps a confused body from corrupting the pipeline.
    if is_post && !app_failed {
        state.close_connection = true;
        if let Some(content_length) = declared_length {
            if reader.socket_tell() == head.header_size + content_length {
                state.close_connection = false;
            }
        }
    }

    let body_bytes = write_response(stream, &response, &head.method, state.close_connection)
        .context("failed to write response")?;

    // only the finalizer knows the final status and byte count, so the
    // access log and the metrics update live here
    let elapsed = state.start_time.elapsed().as_secs_f64();
    log::info!(
        "{remote_addr} \"{}\" {} {} {:.6}",
        state.raw_requestline,
        response.status,
        body_bytes,
        elapsed
    );
    let now = epoch_now();
    events.current().increment("requests", 1, now);
    events
        .current()
        .increment(format!("status.{}", response.status), 1, now);
    events.current().log_exec_time(head.method.clone(), elapsed, now);
    if let Err(err) = events.close(collector) {
        log::error!("collector stack misuse: {err}");
    }

    state.request_count += 1;
    if !state.close_connection {
        server.close_request();
        if server.is_quit_requested() {
            state.close_connection = true;
        }
    }
    Ok(())
}
