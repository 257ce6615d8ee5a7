//! The embedded admin HTTP server: a daemon thread dispatching by
//! exact path over a registered path→handler table. `/` lists the
//! registered paths; `/__quit__` is the self-poke that unblocks the
//! accept loop during shutdown.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Context, Error};
use percent_encoding::percent_decode_str;

use wiseguy_daemon::{activate_listener, bind_listener, BindAddress, Response};

use crate::request::{read_head, CountingReader, HeadOutcome};
use crate::response::write_response;

/// A parsed admin request: decoded path, query parameters and the
/// client's appetite for HTML.
pub struct AdminRequest {
    pub path: String,
    pub form: HashMap<String, String>,
    pub wants_html: bool,
}

impl AdminRequest {
    pub fn get_str(&self, name: &str, default: &str) -> String {
        self.form
            .get(name)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.form
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_float(&self, name: &str, default: f64) -> f64 {
        self.form
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

pub struct AdminResponse {
    pub content_type: String,
    pub body: String,
}

impl AdminResponse {
    pub fn text(body: impl Into<String>) -> AdminResponse {
        AdminResponse {
            content_type: "text/plain; charset=utf-8".to_string(),
            body: body.into(),
        }
    }

    pub fn html(body: impl Into<String>) -> AdminResponse {
        AdminResponse {
            content_type: "text/html; charset=utf-8".to_string(),
            body: body.into(),
        }
    }
}

type AdminHandler = Arc<dyn Fn(&AdminRequest) -> Result<AdminResponse, Error> + Send + Sync>;

struct AdminInner {
    listener: TcpListener,
    local_addr: SocketAddr,
    quit: AtomicBool,
    handlers: Mutex<BTreeMap<String, AdminHandler>>,
}

/// The embedded admin server. Dropping the handle leaves the thread
/// running; call [`stop`](AdminServer::stop) for an orderly exit.
pub struct AdminServer {
    inner: Arc<AdminInner>,
    thread: Option<JoinHandle<()>>,
}

impl AdminServer {
    /// Bind the admin endpoint. Only AF_INET addresses make sense here.
    pub fn bind(address: &BindAddress) -> Result<AdminServer, Error> {
        if address.is_unix() {
            bail!("the embedded admin server requires a host:port address");
        }
        let fd = bind_listener(address)?;
        activate_listener(&fd)?;
        let listener = TcpListener::from(fd);
        let local_addr = listener
            .local_addr()
            .context("failed to read admin server address")?;
        Ok(AdminServer {
            inner: Arc::new(AdminInner {
                listener,
                local_addr,
                quit: AtomicBool::new(false),
                handlers: Mutex::new(BTreeMap::new()),
            }),
            thread: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn register_handler(
        &self,
        path: &str,
        handler: impl Fn(&AdminRequest) -> Result<AdminResponse, Error> + Send + Sync + 'static,
    ) {
        let mut handlers = self.inner.handlers.lock().unwrap();
        handlers.insert(path.to_string(), Arc::new(handler));
    }

    pub fn start(&mut self) -> Result<(), Error> {
        let inner = Arc::clone(&self.inner);
        let thread = std::thread::Builder::new()
            .name("embedded_http_server".to_string())
            .spawn(move || serve(inner))
            .context("failed to spawn admin server thread")?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Set the quit flag, poke ourselves so the accept loop wakes up,
    /// and join the thread.
    pub fn stop(&mut self) {
        self.inner.quit.store(true, Ordering::Release);
        if let Ok(mut stream) = TcpStream::connect(self.inner.local_addr) {
            let _ = stream.write_all(b"GET /__quit__ HTTP/1.1\r\nHost: embedded\r\n\r\n");
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(inner: Arc<AdminInner>) {
    loop {
        if inner.quit.load(Ordering::Acquire) {
            break;
        }
        match inner.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_admin(&stream, &inner) {
                    log::warn!("admin request from {peer} failed: {err:#}");
                }
            }
            Err(err) => {
                log::error!("admin server accept failed: {err}");
            }
        }
    }
}

fn handle_admin(stream: &TcpStream, inner: &AdminInner) -> Result<(), Error> {
    let mut reader = CountingReader::new(stream);
    let head = match read_head(&mut reader).context("failed to read admin request")? {
        HeadOutcome::Eof => return Ok(()),
        HeadOutcome::Malformed(reason) => {
            write_response(stream, &Response::text(400, "Bad Request"), "GET", true)?;
            bail!("bad admin request: {reason}");
        }
        HeadOutcome::Head(head) => head,
    };

    if head.method != "GET" && head.method != "POST" {
        write_response(stream, &Response::text(501, "Not Implemented"), &head.method, true)?;
        return Ok(());
    }

    let (raw_path, query) = match head.path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (head.path.as_str(), ""),
    };
    let request = AdminRequest {
        path: percent_decode_str(raw_path).decode_utf8_lossy().into_owned(),
        form: form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        wants_html: head
            .get_header("accept")
            .is_some_and(|accept| accept.contains("html")),
    };

    let handler = {
        let handlers = inner.handlers.lock().unwrap();
        handlers.get(&request.path).cloned()
    };

    let response = match handler {
        Some(handler) => match handler(&request) {
            Ok(admin_response) => {
                let mut response = Response::new(200);
                response.headers.push((
                    "Cache-Control".to_string(),
                    "no-cache".to_string(),
                ));
                response
                    .headers
                    .push(("Content-Type".to_string(), admin_response.content_type));
                response.body = admin_response.body.into_bytes();
                response
            }
            Err(err) => {
                log::error!("admin handler {} failed: {err:?}", request.path);
                Response::text(500, "Internal Server Error")
            }
        },
        None if request.path == "/" => {
            let admin_response = default_listing(inner, request.wants_html);
            let mut response = Response::new(200);
            response
                .headers
                .push(("Cache-Control".to_string(), "no-cache".to_string()));
            response
                .headers
                .push(("Content-Type".to_string(), admin_response.content_type));
            response.body = admin_response.body.into_bytes();
            response
        }
        None => Response::text(404, "Not Found"),
    };

    write_response(stream, &response, &head.method, true)?;
    Ok(())
}

fn default_listing(inner: &AdminInner, wants_html: bool) -> AdminResponse {
    let handlers = inner.handlers.lock().unwrap();
    let mut paths: Vec<&str> = handlers.keys().map(String::as_str).collect();
    paths.push("/");
    paths.sort_unstable();

    if wants_html {
        let mut body = paths
            .iter()
            .map(|path| format!("<a href=\"{path}\">{path}</a><br>"))
            .collect::<Vec<_>>()
            .join("\n");
        body.push('\n');
        AdminResponse::html(body)
    } else {
        let mut body = paths.join("\n");
        body.push('\n');
        AdminResponse::text(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn fetch(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    fn start_admin() -> AdminServer {
        let mut admin = AdminServer::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        admin.register_handler("/counterz", |_req| Ok(AdminResponse::text("requests:3\n")));
        admin.register_handler("/argz", |req| {
            Ok(AdminResponse::text(format!("n={}\n", req.get_int("n", -1))))
        });
        admin.start().unwrap();
        admin
    }

    #[test]
    fn test_default_page_lists_paths() {
        let mut admin = start_admin();
        let response = fetch(admin.local_addr(), "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Content-Type: text/plain"));
        assert!(response.contains("/counterz"));
        assert!(response.contains("Cache-Control: no-cache"));
        admin.stop();
    }

    #[test]
    fn test_default_page_html_when_accepted() {
        let mut admin = start_admin();
        let response = fetch(
            admin.local_addr(),
            "GET / HTTP/1.1\r\nHost: x\r\nAccept: text/html\r\n\r\n",
        );
        assert!(response.contains("Content-Type: text/html"));
        assert!(response.contains("<a href=\"/counterz\">/counterz</a>"));
        admin.stop();
    }

    #[test]
    fn test_registered_handler_and_query_args() {
        let mut admin = start_admin();
        let response = fetch(admin.local_addr(), "GET /counterz HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.contains("requests:3"));
        let response = fetch(admin.local_addr(), "GET /argz?n=7 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.contains("n=7"));
        let response = fetch(admin.local_addr(), "GET /argz HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.contains("n=-1"));
        admin.stop();
    }

    #[test]
    fn test_unknown_path_is_404() {
        let mut admin = start_admin();
        let response = fetch(admin.local_addr(), "GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
        admin.stop();
    }

    #[test]
    fn test_stop_joins_the_thread() {
        let mut admin = start_admin();
        admin.stop();
        assert!(admin.thread.is_none());
    }
}
