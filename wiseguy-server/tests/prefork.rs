//! End-to-end tests driving the real server binary: keep-alive over a
//! preforked pool, graceful drain on SIGTERM, the listening-socket
//! handoff between generations, and the SIGHUP rolling restart.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const STARTUP_DEADLINE: Duration = Duration::from_secs(10);
const EXIT_DEADLINE: Duration = Duration::from_secs(15);

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn temp_registry_path(tag: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("wiseguy-e2e-{tag}-{}-{n}.sock", std::process::id()))
}

fn spawn_server(args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_wiseguy-server"))
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn wiseguy-server")
}

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + STARTUP_DEADLINE;
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                return stream;
            }
            Err(err) => {
                if Instant::now() >= deadline {
                    panic!("server on port {port} never came up: {err}");
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Issue one request on an open connection and read exactly one
/// response, leaving the connection usable for the next request.
fn http_get(stream: &mut TcpStream, path: &str) -> String {
    write!(stream, "GET {path} HTTP/1.1\r\nHost: e2e\r\n\r\n").unwrap();
    stream.flush().unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("no response head");
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).expect("short response body");
    head + &String::from_utf8_lossy(&body)
}

fn worker_pid(response: &str) -> String {
    response
        .split("pid=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .expect("response body carries the worker pid")
        .to_string()
}

fn terminate_and_wait(child: &mut Child) {
    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
    let deadline = Instant::now() + EXIT_DEADLINE;
    loop {
        match child.try_wait().unwrap() {
            Some(status) => {
                assert!(status.success(), "server exited with {status}");
                return;
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    panic!("server did not drain within the deadline");
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

#[test]
fn test_keepalive_pool_and_graceful_term() {
    let port = free_port();
    let bind = format!("127.0.0.1:{port}");
    let mut child = spawn_server(&["--bind", &bind, "--workers", "2"]);

    let mut stream = connect(port);
    let first = http_get(&mut stream, "/one");
    assert!(first.starts_with("HTTP/1.1 200 OK"));
    assert!(first.contains("Server: wiseguy/"));
    assert!(first.contains("GET /one"));
    assert!(!first.contains("Connection: close"));

    // same connection, second request: keep-alive reuse
    let second = http_get(&mut stream, "/two");
    assert!(second.contains("GET /two"));
    assert_eq!(worker_pid(&first), worker_pid(&second));

    terminate_and_wait(&mut child);
}

#[test]
fn test_listening_socket_handoff_between_generations() {
    let port = free_port();
    let bind = format!("127.0.0.1:{port}");
    let registry = temp_registry_path("handoff");
    let registry_arg = registry.display().to_string();

    let mut first = spawn_server(&["--bind", &bind, "--workers", "2", "--fd-server", &registry_arg]);
    let mut stream = connect(port);
    let response = http_get(&mut stream, "/gen1");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    drop(stream);

    // second generation adopts the listening socket through the registry
    let mut second =
        spawn_server(&["--bind", &bind, "--workers", "2", "--fd-server", &registry_arg]);
    std::thread::sleep(Duration::from_millis(1500));

    terminate_and_wait(&mut first);

    // the old generation is gone; the socket keeps serving
    let mut stream = connect(port);
    let response = http_get(&mut stream, "/gen2");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("GET /gen2"));

    terminate_and_wait(&mut second);
    let _ = std::fs::remove_file(&registry);
}

#[test]
fn test_direct_worker_term_drains_only_that_worker() {
    let port = free_port();
    let bind = format!("127.0.0.1:{port}");
    let mut child = spawn_server(&["--bind", &bind, "--workers", "2"]);

    let mut stream = connect(port);
    let victim = worker_pid(&http_get(&mut stream, "/victim"));
    drop(stream);
    let victim_pid = Pid::from_raw(victim.parse().unwrap());

    // TERM the worker itself, not the supervisor
    kill(victim_pid, Signal::SIGTERM).unwrap();

    // the worker drains and is reaped
    let deadline = Instant::now() + Duration::from_secs(10);
    while kill(victim_pid, None::<Signal>).is_ok() {
        if Instant::now() >= deadline {
            panic!("worker {victim} did not exit after a direct SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // the supervisor must not mistake the worker's signal for its own
    std::thread::sleep(Duration::from_millis(500));
    assert!(
        child.try_wait().unwrap().is_none(),
        "supervisor exited after a worker-directed SIGTERM"
    );

    // the pool keeps serving, and the replacement is a new process
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut stream = connect(port);
        let response = http_get(&mut stream, "/check");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert_ne!(worker_pid(&response), victim);
        let mut sibling = connect(port);
        let other = worker_pid(&http_get(&mut sibling, "/check"));
        if other != worker_pid(&response) {
            // two distinct live workers: the pool is back at full size
            break;
        }
        if Instant::now() >= deadline {
            panic!("pool never returned to two workers after the victim drained");
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    terminate_and_wait(&mut child);
}

#[test]
fn test_sighup_rolls_the_workers() {
    let port = free_port();
    let bind = format!("127.0.0.1:{port}");
    let mut child = spawn_server(&["--bind", &bind, "--workers", "2"]);

    let mut seen_before = std::collections::HashSet::new();
    for _ in 0..6 {
        let mut stream = connect(port);
        seen_before.insert(worker_pid(&http_get(&mut stream, "/before")));
    }
    assert!(!seen_before.is_empty());

    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGHUP);

    // a new generation of workers must take over
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut stream = connect(port);
        let pid = worker_pid(&http_get(&mut stream, "/after"));
        if !seen_before.contains(&pid) {
            break;
        }
        if Instant::now() >= deadline {
            panic!("no new-generation worker showed up after SIGHUP");
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    terminate_and_wait(&mut child);
}
