//! The FastCGI worker: same supervision semantics as the HTTP worker,
//! but each accepted connection carries exactly one request object and
//! there is no transport-level keep-alive. The quit flag is observed
//! between requests.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Error;

use wiseguy_daemon::{
    Application, ManagedServer, PreForkingSupervisor, Response, ServerConfig,
};
use wiseguy_events::CollectorStack;

pub mod protocol;

pub use protocol::{accept_request, FcgiRequest};

/// Poll interval on the FastCGI accept; bounds how long a drain waits
/// on an idle worker.
const ACCEPT_INPUT_TIMEOUT: Duration = Duration::from_secs(1);

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Render a buffered response in CGI form for the web server in front:
/// a `Status` pseudo-header, the response headers, then the body.
fn render_cgi_response(response: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(response.body.len() + 256);
    out.extend_from_slice(
        format!("Status: {} {}\r\n", response.status, response.reason).as_bytes(),
    );
    let mut have_length = false;
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            have_length = true;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !have_length && !response.body_forbidden() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    if !response.body_forbidden() {
        out.extend_from_slice(&response.body);
    }
    out
}

/// Serve one connection: accept its request object, dispatch to the
/// application, stream the response and complete. `FCGI_KEEP_CONN` is
/// ignored; the connection closes when this returns.
pub fn handle_fcgi_connection<S: Read + Write>(
    stream: S,
    app: &dyn Application,
    events: &mut CollectorStack,
) -> Result<(), Error> {
    let mut request = match accept_request(stream)? {
        Some(request) => request,
        None => return Ok(()),
    };
    let start = Instant::now();
    let environ = request.params().clone();
    let requestline = format!(
        "{} {}",
        environ.get("REQUEST_METHOD").map_or("-", String::as_str),
        environ.get("REQUEST_URI").or_else(|| environ.get("PATH_INFO")).map_or("-", String::as_str),
    );

    let collector = events.open();
    let response = {
        let mut body = request.take_stdin();
        match app.call(&environ, &mut body) {
            Ok(response) => response,
            Err(err) => {
                log::error!("fcgi error \"{requestline}\" {err:?}");
                Response::text(500, "Internal Server Error")
            }
        }
    };

    let payload = render_cgi_response(&response);
    request.write_stdout(&payload)?;
    request.finish(0)?;

    let elapsed = start.elapsed().as_secs_f64();
    log::info!(
        "\"{requestline}\" {} {} {:.6}",
        response.status,
        response.body.len(),
        elapsed
    );
    let now = epoch_now();
    events.current().increment("requests", 1, now);
    events
        .current()
        .increment(format!("status.{}", response.status), 1, now);
    events.current().log_exec_time("request", elapsed, now);
    if let Err(err) = events.close(collector) {
        log::error!("collector stack misuse: {err}");
    }
    Ok(())
}

/// The worker entry point: accept FastCGI connections until the quit
/// flag trips.
pub fn serve_forever(server: &mut ManagedServer, app: &dyn Application) -> Result<(), Error> {
    let is_unix = server.config().bind_address.is_unix();
    let mut events = CollectorStack::new();

    server.signal_ready();
    while !server.is_quit_requested() {
        let Some(fd) = server.accept_pending(ACCEPT_INPUT_TIMEOUT)? else {
            continue;
        };
        let served = if is_unix {
            handle_fcgi_connection(UnixStream::from(fd), app, &mut events)
        } else {
            handle_fcgi_connection(TcpStream::from(fd), app, &mut events)
        };
        if let Err(err) = served {
            log::warn!("fcgi request failed: {err:#}");
        }
        server.close_request();
    }

    log::info!(
        "worker {} exiting after {} requests",
        std::process::id(),
        server.request_count()
    );
    for line in events.root().get_log_lines(true, true) {
        log::info!("{line}");
    }
    Ok(())
}

/// A preforking FastCGI server analogous to the HTTP one.
pub struct PreForkingFcgiServer {
    supervisor: PreForkingSupervisor,
}

impl PreForkingFcgiServer {
    pub fn new(config: ServerConfig, app: Arc<dyn Application>) -> PreForkingFcgiServer {
        Self::with_server(ManagedServer::new(config), app)
    }

    pub fn with_server(server: ManagedServer, app: Arc<dyn Application>) -> PreForkingFcgiServer {
        let supervisor =
            PreForkingSupervisor::new(server, move |server| serve_forever(server, app.as_ref()));
        PreForkingFcgiServer { supervisor }
    }

    pub fn server(&self) -> &ManagedServer {
        self.supervisor.server()
    }

    pub fn server_mut(&mut self) -> &mut ManagedServer {
        self.supervisor.server_mut()
    }

    pub fn run(&mut self) -> Result<(), Error> {
        self.supervisor.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;

    use protocol::{
        encode_name_value_pair, read_record, write_record, FCGI_BEGIN_REQUEST, FCGI_END_REQUEST,
        FCGI_PARAMS, FCGI_STDIN, FCGI_STDOUT,
    };
    use wiseguy_daemon::Environ;

    fn echo_app(environ: &Environ, body: &mut dyn Read) -> Result<Response, Error> {
        let mut data = Vec::new();
        body.read_to_end(&mut data)?;
        Ok(Response::text(
            200,
            format!(
                "{} {} body={}",
                environ["REQUEST_METHOD"],
                environ["PATH_INFO"],
                String::from_utf8_lossy(&data)
            ),
        ))
    }

    fn send_request(
        stream: &mut StdUnixStream,
        params: &[(&str, &str)],
        body: &[u8],
    ) {
        let begin = [0u8, 1, 0, 0, 0, 0, 0, 0]; // responder, no keep-conn
        write_record(stream, FCGI_BEGIN_REQUEST, 1, &begin).unwrap();
        let mut encoded = Vec::new();
        for (name, value) in params {
            encode_name_value_pair(&mut encoded, name, value);
        }
        write_record(stream, FCGI_PARAMS, 1, &encoded).unwrap();
        write_record(stream, FCGI_PARAMS, 1, &[]).unwrap();
        if !body.is_empty() {
            write_record(stream, FCGI_STDIN, 1, body).unwrap();
        }
        write_record(stream, FCGI_STDIN, 1, &[]).unwrap();
    }

    fn collect_response(stream: &mut StdUnixStream) -> (Vec<u8>, bool) {
        let mut stdout = Vec::new();
        let mut completed = false;
        loop {
            let record = match read_record(stream) {
                Ok(record) => record,
                Err(_) => break,
            };
            match record.record_type {
                FCGI_STDOUT => stdout.extend_from_slice(&record.content),
                FCGI_END_REQUEST => {
                    completed = true;
                    break;
                }
                _ => {}
            }
        }
        (stdout, completed)
    }

    #[test]
    fn test_one_request_per_connection() {
        let (mut client, server_side) = StdUnixStream::pair().unwrap();
        let worker = std::thread::spawn(move || {
            let mut events = CollectorStack::new();
            handle_fcgi_connection(server_side, &echo_app, &mut events).unwrap();
        });

        send_request(
            &mut client,
            &[
                ("REQUEST_METHOD", "POST"),
                ("PATH_INFO", "/submit"),
                ("CONTENT_LENGTH", "5"),
            ],
            b"hello",
        );
        let (stdout, completed) = collect_response(&mut client);
        worker.join().unwrap();

        assert!(completed);
        let text = String::from_utf8_lossy(&stdout);
        assert!(text.starts_with("Status: 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain"));
        assert!(text.contains("POST /submit body=hello"));

        // the worker closed the connection after one request
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_application_error_maps_to_500() {
        let failing: fn(&Environ, &mut dyn Read) -> Result<Response, Error> =
            |_env, _body| anyhow::bail!("nope");
        let (mut client, server_side) = StdUnixStream::pair().unwrap();
        let worker = std::thread::spawn(move || {
            let mut events = CollectorStack::new();
            handle_fcgi_connection(server_side, &failing, &mut events).unwrap();
        });

        send_request(&mut client, &[("REQUEST_METHOD", "GET")], &[]);
        let (stdout, completed) = collect_response(&mut client);
        worker.join().unwrap();

        assert!(completed);
        assert!(String::from_utf8_lossy(&stdout).starts_with("Status: 500"));
    }

    #[test]
    fn test_non_responder_role_is_rejected() {
        let (mut client, server_side) = StdUnixStream::pair().unwrap();
        let worker = std::thread::spawn(move || {
            let mut events = CollectorStack::new();
            handle_fcgi_connection(server_side, &echo_app, &mut events).unwrap();
        });

        // role 2 = authorizer
        let begin = [0u8, 2, 0, 0, 0, 0, 0, 0];
        write_record(&mut client, FCGI_BEGIN_REQUEST, 1, &begin).unwrap();
        let record = read_record(&mut client).unwrap();
        worker.join().unwrap();
        assert_eq!(record.record_type, FCGI_END_REQUEST);
        // protocol status byte says unknown role
        assert_eq!(record.content[4], protocol::FCGI_UNKNOWN_ROLE);
    }

    #[test]
    fn test_params_spanning_multiple_records() {
        let (mut client, server_side) = StdUnixStream::pair().unwrap();
        let worker = std::thread::spawn(move || {
            let mut events = CollectorStack::new();
            handle_fcgi_connection(server_side, &echo_app, &mut events).unwrap();
        });

        let begin = [0u8, 1, 0, 0, 0, 0, 0, 0];
        write_record(&mut client, FCGI_BEGIN_REQUEST, 1, &begin).unwrap();
        let mut first = Vec::new();
        encode_name_value_pair(&mut first, "REQUEST_METHOD", "GET");
        let mut second = Vec::new();
        encode_name_value_pair(&mut second, "PATH_INFO", "/split");
        write_record(&mut client, FCGI_PARAMS, 1, &first).unwrap();
        write_record(&mut client, FCGI_PARAMS, 1, &second).unwrap();
        write_record(&mut client, FCGI_PARAMS, 1, &[]).unwrap();
        write_record(&mut client, FCGI_STDIN, 1, &[]).unwrap();

        let (stdout, completed) = collect_response(&mut client);
        worker.join().unwrap();
        assert!(completed);
        assert!(String::from_utf8_lossy(&stdout).contains("GET /split"));
    }
}
