//! The registry side: a tiny Unix-socket service doling out listening
//! file descriptors to requesting processes.
//!
//! Protocol per connection (netstring-like frames, one request, then
//! disconnect):
//!
//! ```text
//! CLIENT:
//!   send_str REQ_FD
//!   send_str (canonical bind string)
//!   recv_str OK -> recv fd (SCM_RIGHTS)
//!            ERROR -> recv_str (reason)
//! ```
//!
//! `REQ_PID`, `REQ_ADDRS` and `REQ_UMGMT` follow the same shape without
//! the argument frame. Registry entries live until process exit; client
//! errors never evict them.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context, Error};

use crate::client::FdClient;
use crate::frame::{recv_str, send_str, send_u32};
use crate::passing::{dup_fd, send_fd};

#[derive(Default)]
struct Registry {
    fd_map: HashMap<String, OwnedFd>,
    micro_management_address: Option<String>,
}

/// Handle to the in-process fd registry server.
///
/// [`bind`](FdServer::bind) acquires the registry socket (adopting a
/// live predecessor's descriptor when the path is taken) but does NOT
/// accept yet; [`start`](FdServer::start) launches the accept loop.
/// The gap matters during a generation handoff: the new generation must
/// finish re-acquiring and registering its listening sockets through
/// the old registry before it starts answering registry requests
/// itself, or its own still-empty map could answer them. Cloning the
/// handle shares the registry.
#[derive(Clone)]
pub struct FdServer {
    path: PathBuf,
    registry: Arc<Mutex<Registry>>,
    listener: Arc<Mutex<Option<UnixListener>>>,
}

impl FdServer {
    /// Bind the registry socket.
    ///
    /// On `EADDRINUSE` a live predecessor on the same path is asked for
    /// its listening descriptor first; failing that, the stale path is
    /// unlinked and the bind retried.
    pub fn bind(path: &Path) -> Result<FdServer, Error> {
        let listener = match UnixListener::bind(path) {
            Ok(listener) => listener,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                log::info!("requesting bound fd {}", path.display());
                match FdClient::new(path).get_fd_for_address(&canonical_path(path)) {
                    Ok(fd) => UnixListener::from(fd),
                    Err(_) => {
                        log::warn!("forced teardown on {}", path.display());
                        std::fs::remove_file(path)
                            .with_context(|| format!("failed to unlink {}", path.display()))?;
                        UnixListener::bind(path)
                            .with_context(|| format!("failed to bind {}", path.display()))?
                    }
                }
            }
            Err(err) => {
                return Err(Error::new(err).context(format!("failed to bind {}", path.display())))
            }
        };

        let server = FdServer {
            path: path.to_path_buf(),
            registry: Arc::new(Mutex::new(Registry::default())),
            listener: Arc::new(Mutex::new(Some(listener))),
        };
        // the registry always carries its own listening socket
        {
            let listener = server.listener.lock().unwrap();
            server.register_fd(&canonical_path(path), listener.as_ref().unwrap().as_raw_fd())?;
        }
        log::info!("bound fd_server {}", path.display());
        Ok(server)
    }

    /// Spawn the accept loop. Safe to call more than once; only the
    /// first call starts a thread.
    pub fn start(&self) -> Result<(), Error> {
        let listener = match self.listener.lock().unwrap().take() {
            Some(listener) => listener,
            None => return Ok(()),
        };
        let registry = Arc::clone(&self.registry);
        thread::Builder::new()
            .name("fd_server".to_string())
            .spawn(move || accept_loop(listener, registry))
            .context("failed to spawn fd_server thread")?;
        Ok(())
    }

    pub fn server_address(&self) -> &Path {
        &self.path
    }

    /// Store a duplicate of `fd` under the canonical bind string. The
    /// registry owns its copy; handoffs duplicate it again.
    pub fn register_fd(&self, bind_address: &str, fd: RawFd) -> Result<(), Error> {
        let duped = dup_fd(fd)?;
        let mut registry = self.registry.lock().unwrap();
        registry.fd_map.insert(bind_address.to_string(), duped);
        log::info!("registered fd {bind_address} {fd}");
        Ok(())
    }

    pub fn registered_addresses(&self) -> Vec<String> {
        let registry = self.registry.lock().unwrap();
        let mut addresses: Vec<_> = registry.fd_map.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Record the admin endpoint of the owning supervisor so the next
    /// generation can find it during handoff.
    pub fn set_micro_management_address(&self, address: &str) {
        let mut registry = self.registry.lock().unwrap();
        registry.micro_management_address = Some(address.to_string());
    }
}

fn canonical_path(path: &Path) -> String {
    path.display().to_string()
}

fn accept_loop(listener: UnixListener, registry: Arc<Mutex<Registry>>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("fd_server accept failed: {err}");
                continue;
            }
        };
        let registry = Arc::clone(&registry);
        let spawned = thread::Builder::new()
            .name("fd_server_conn".to_string())
            .spawn(move || {
                if let Err(err) = handle_connection(stream, &registry) {
                    log::warn!("fd_server request failed: {err:#}");
                }
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn fd_server handler: {err}");
        }
    }
}

// One request per connection; any protocol error just drops the
// connection and leaves the registry untouched.
fn handle_connection(mut stream: UnixStream, registry: &Mutex<Registry>) -> Result<(), Error> {
    let tag = recv_str(&mut stream)?;
    match tag.as_str() {
        "REQ_FD" => {
            let bind_address = recv_str(&mut stream)?;
            log::info!("request fd: {bind_address}");
            let registry = registry.lock().unwrap();
            match registry.fd_map.get(&bind_address) {
                Some(fd) => {
                    log::info!("sending fd: {bind_address} {}", fd.as_raw_fd());
                    send_str(&mut stream, "OK")?;
                    send_fd(&stream, fd.as_raw_fd())?;
                }
                None => {
                    let known: Vec<_> = registry.fd_map.keys().cloned().collect();
                    log::info!("no match for requested fd: {bind_address} {known:?}");
                    send_str(&mut stream, "ERROR")?;
                    send_str(
                        &mut stream,
                        &format!(
                            "no fd matching {bind_address:?} on pid {} {known:?}",
                            std::process::id()
                        ),
                    )?;
                }
            }
        }
        "REQ_PID" => {
            send_str(&mut stream, "OK")?;
            send_u32(&mut stream, std::process::id())?;
        }
        "REQ_ADDRS" => {
            let registry = registry.lock().unwrap();
            let mut addresses: Vec<_> = registry.fd_map.keys().cloned().collect();
            addresses.sort();
            send_str(&mut stream, "OK")?;
            send_str(&mut stream, &addresses.join(","))?;
        }
        "REQ_UMGMT" => {
            let registry = registry.lock().unwrap();
            match &registry.micro_management_address {
                Some(address) => {
                    send_str(&mut stream, "OK")?;
                    send_str(&mut stream, address)?;
                }
                None => {
                    send_str(&mut stream, "ERROR")?;
                    send_str(&mut stream, "no micro-management address registered")?;
                }
            }
        }
        _ => bail!("unknown request tag {tag:?}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_socket_path() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("wiseguy-fd-test-{}-{n}.sock", std::process::id()))
    }

    #[test]
    fn test_fd_round_trip_preserves_socket_name() {
        let path = temp_socket_path();
        let server = FdServer::bind(&path).unwrap();
        server.start().unwrap();

        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let bound = tcp.local_addr().unwrap();
        let bind_string = format!("127.0.0.1:{}", bound.port());
        server.register_fd(&bind_string, tcp.as_raw_fd()).unwrap();

        let client = FdClient::new(&path);
        let fd = client.get_fd_for_address(&bind_string).unwrap();
        let adopted = TcpListener::from(fd);
        assert_eq!(adopted.local_addr().unwrap(), bound);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_address_is_an_error() {
        let path = temp_socket_path();
        let server = FdServer::bind(&path).unwrap();
        server.start().unwrap();
        let client = FdClient::new(&path);
        let err = client.get_fd_for_address("10.0.0.1:1").unwrap_err();
        assert!(err.to_string().contains("no fd matching"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_pid_and_addrs() {
        let path = temp_socket_path();
        let server = FdServer::bind(&path).unwrap();
        server.start().unwrap();
        let client = FdClient::new(&path);

        assert_eq!(client.get_pid().unwrap(), std::process::id());
        // the server registers its own socket at startup
        let addrs = client.get_available_addresses().unwrap();
        assert!(addrs.contains(&canonical_path(&path)));

        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        server.register_fd("127.0.0.1:9999", tcp.as_raw_fd()).unwrap();
        let addrs = client.get_available_addresses().unwrap();
        assert!(addrs.contains(&"127.0.0.1:9999".to_string()));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_micro_management_address() {
        let path = temp_socket_path();
        let server = FdServer::bind(&path).unwrap();
        server.start().unwrap();
        let client = FdClient::new(&path);

        assert!(client.get_micro_management_address().is_err());
        server.set_micro_management_address("127.0.0.1:7777");
        assert_eq!(
            client.get_micro_management_address().unwrap(),
            "127.0.0.1:7777"
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_stale_socket_path_is_torn_down() {
        let path = temp_socket_path();
        // leave a dead socket file behind
        let dead = UnixListener::bind(&path).unwrap();
        drop(dead);
        assert!(path.exists());

        let server = FdServer::bind(&path).unwrap();
        server.start().unwrap();
        let client = FdClient::new(&path);
        assert_eq!(client.get_pid().unwrap(), std::process::id());

        let _ = std::fs::remove_file(&path);
    }
}
