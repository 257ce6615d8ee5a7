//! The application seam: workers hand each parsed request to an
//! [`Application`] and write back the buffered [`Response`] it returns.

use std::collections::HashMap;
use std::io::Read;

use anyhow::Error;

/// CGI-style request environment: `REQUEST_METHOD`, `PATH_INFO`,
/// `HTTP_*` headers and friends.
pub type Environ = HashMap<String, String>;

/// A request handler hosted by an HTTP or FastCGI worker.
///
/// `body` reads the request body from the connection; for a POST with a
/// declared `Content-Length` it never yields bytes past that length, so
/// a handler cannot accidentally consume the next pipelined request.
pub trait Application: Send + Sync {
    fn call(&self, environ: &Environ, body: &mut dyn Read) -> Result<Response, Error>;
}

impl<F> Application for F
where
    F: Fn(&Environ, &mut dyn Read) -> Result<Response, Error> + Send + Sync,
{
    fn call(&self, environ: &Environ, body: &mut dyn Read) -> Result<Response, Error> {
        self(environ, body)
    }
}

/// A fully buffered response. Buffering lets the worker decide the
/// `Connection` header after the handler has run but before any header
/// byte is written.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            reason: status_reason(status).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Response {
        let mut response = Response::new(status);
        response
            .headers
            .push(("Content-Type".to_string(), "text/plain; charset=utf-8".to_string()));
        response.body = body.into().into_bytes();
        response
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Response {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a message body is forbidden for this status (1xx, 204,
    /// 304); HEAD suppression is the worker's job since only it knows
    /// the method.
    pub fn body_forbidden(&self) -> bool {
        matches!(self.status, 100..=199 | 204 | 304)
    }
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_forbidden_statuses() {
        assert!(Response::new(204).body_forbidden());
        assert!(Response::new(304).body_forbidden());
        assert!(Response::new(100).body_forbidden());
        assert!(!Response::new(200).body_forbidden());
        assert!(!Response::new(404).body_forbidden());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = Response::text(200, "ok").header("X-Thing", "1");
        assert_eq!(response.get_header("x-thing"), Some("1"));
        assert_eq!(response.get_header("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(response.get_header("missing"), None);
    }
}
