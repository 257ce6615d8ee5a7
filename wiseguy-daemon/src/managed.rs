//! Bind/activate lifecycle shared by the HTTP and FastCGI servers,
//! including the `EADDRINUSE` escalation that adopts the previous
//! generation's listening socket through the fd registry.

use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Error};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept, bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag,
    SockType, SockaddrIn, SockaddrIn6, UnixAddr,
};

use wiseguy_fd_server::{dup_fd, FdClient, FdServer};

use crate::address::BindAddress;
use crate::state::QuitFlag;

type DropPrivilegesFn = Arc<dyn Fn() -> Result<(), Error> + Send + Sync>;

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_address: BindAddress,
    pub num_workers: usize,
    /// Idle time after which a keep-alive connection is closed.
    pub keepalive_timeout: Duration,
    /// A worker quits after serving this many requests.
    pub max_requests_per_worker: Option<u64>,
    /// A worker quits once it has been alive this long.
    pub max_worker_lifetime: Option<Duration>,
    /// How long the supervisor waits for workers to drain on shutdown
    /// before sending SIGKILL.
    pub drain_deadline: Duration,
    /// Path of the fd registry socket, if socket handoff is in play.
    pub fd_server_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(bind_address: BindAddress) -> ServerConfig {
        ServerConfig {
            bind_address,
            num_workers: 4,
            keepalive_timeout: Duration::from_secs(5),
            max_requests_per_worker: None,
            max_worker_lifetime: None,
            drain_deadline: Duration::from_secs(10),
            fd_server_path: None,
        }
    }
}

/// Create a listening-ready stream socket bound to `address`.
/// AF_INET sockets get `SO_REUSEADDR`; the caller still has to
/// `listen()`.
pub fn bind_listener(address: &BindAddress) -> Result<OwnedFd, Error> {
    match address {
        BindAddress::Unix(path) => {
            let fd = socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::SOCK_CLOEXEC,
                None,
            )
            .context("failed to create unix socket")?;
            let addr = UnixAddr::new(path.as_path())
                .with_context(|| format!("bad unix socket path {}", path.display()))?;
            bind(fd.as_raw_fd(), &addr)
                .map_err(bind_error(address))?;
            Ok(fd)
        }
        BindAddress::Inet(host, port) => {
            let sockaddr = resolve(host, *port)?;
            let family = match sockaddr {
                SocketAddr::V4(_) => AddressFamily::Inet,
                SocketAddr::V6(_) => AddressFamily::Inet6,
            };
            let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
                .context("failed to create inet socket")?;
            setsockopt(&fd, sockopt::ReuseAddr, &true)
                .context("failed to set SO_REUSEADDR")?;
            match sockaddr {
                SocketAddr::V4(sa) => {
                    bind(fd.as_raw_fd(), &SockaddrIn::from(sa)).map_err(bind_error(address))?
                }
                SocketAddr::V6(sa) => {
                    bind(fd.as_raw_fd(), &SockaddrIn6::from(sa)).map_err(bind_error(address))?
                }
            }
            Ok(fd)
        }
    }
}

fn bind_error(address: &BindAddress) -> impl FnOnce(Errno) -> Error + '_ {
    move |errno| Error::new(errno).context(format!("failed to bind {address}"))
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow::format_err!("no address for {host}:{port}"))
}

/// Start listening on a bound socket with the maximum backlog.
pub fn activate_listener(fd: &OwnedFd) -> Result<(), Error> {
    listen(fd, Backlog::MAXCONN).context("listen failed")?;
    Ok(())
}

/// Block until `fd` is readable or the timeout elapses. A signal
/// arriving during the wait reports "not readable" so callers get to
/// check their quit flag.
pub fn poll_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool, Error> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(Error::new(errno).context("poll failed")),
    }
}

/// The managed server: owns the listening socket, the quit flag and the
/// per-worker served-request accounting. Created in the supervisor;
/// inherited by each worker across the fork.
pub struct ManagedServer {
    config: ServerConfig,
    quit: QuitFlag,
    listener: Option<OwnedFd>,
    bound_here: bool,
    canonical_address: String,
    request_count: u64,
    started_at: Instant,
    drop_privileges: Option<DropPrivilegesFn>,
    fd_server: Option<FdServer>,
    previous_umgmt_address: Option<String>,
    ready_pipe: Option<OwnedFd>,
}

impl ManagedServer {
    pub fn new(config: ServerConfig) -> ManagedServer {
        let canonical_address = config.bind_address.canonical();
        ManagedServer {
            config,
            quit: QuitFlag::new(),
            listener: None,
            bound_here: false,
            canonical_address,
            request_count: 0,
            started_at: Instant::now(),
            drop_privileges: None,
            fd_server: None,
            previous_umgmt_address: None,
            ready_pipe: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn quit_flag(&self) -> QuitFlag {
        self.quit.clone()
    }

    pub fn set_drop_privileges(
        &mut self,
        callback: impl Fn() -> Result<(), Error> + Send + Sync + 'static,
    ) {
        self.drop_privileges = Some(Arc::new(callback));
    }

    /// Attach an in-process fd registry; the bound listener is
    /// registered with it and adoption is attempted on `EADDRINUSE`.
    pub fn set_fd_server(&mut self, fd_server: FdServer) {
        self.config.fd_server_path = Some(fd_server.server_address().to_path_buf());
        self.fd_server = Some(fd_server);
    }

    pub fn fd_server(&self) -> Option<&FdServer> {
        self.fd_server.as_ref()
    }

    /// The admin address of the generation we adopted the socket from,
    /// when a handoff happened.
    pub fn previous_umgmt_address(&self) -> Option<&str> {
        self.previous_umgmt_address.as_deref()
    }

    pub fn canonical_address(&self) -> &str {
        &self.canonical_address
    }

    /// Bind the listening socket, escalating on `EADDRINUSE`:
    /// first adopt the previous generation's descriptor through the fd
    /// registry, then (Unix paths only) unlink the stale path and retry.
    pub fn server_bind(&mut self) -> Result<(), Error> {
        let address = self.config.bind_address.clone();
        match bind_listener(&address) {
            Ok(fd) => {
                self.adopt_listener(fd, true)?;
                self.run_drop_privileges()?;
            }
            Err(err) if is_addr_in_use(&err) => {
                // shed privileges before talking to the registry
                self.run_drop_privileges()?;
                let adopted = self.adopt_from_fd_server(&address);
                match adopted {
                    Ok(fd) => self.adopt_listener(fd, false)?,
                    Err(adopt_err) => {
                        if let BindAddress::Unix(path) = &address {
                            log::warn!("forced teardown on {}", path.display());
                            std::fs::remove_file(path).with_context(|| {
                                format!("failed to unlink stale socket {}", path.display())
                            })?;
                            let fd = bind_listener(&address)?;
                            self.adopt_listener(fd, true)?;
                        } else {
                            log::error!("failed to bind socket {address}");
                            return Err(adopt_err.context(err));
                        }
                    }
                }
            }
            Err(err) => {
                log::error!("failed to bind socket {address}");
                return Err(err);
            }
        }

        if let Some(fd_server) = &self.fd_server {
            let fd = self.listener.as_ref().unwrap().as_raw_fd();
            fd_server.register_fd(&self.canonical_address, fd)?;
            // only now may this generation answer registry requests; any
            // earlier and a handoff could be served from an empty map
            fd_server.start()?;
        }
        log::debug!("bound {}", self.canonical_address);
        Ok(())
    }

    fn adopt_from_fd_server(&mut self, address: &BindAddress) -> Result<OwnedFd, Error> {
        let path = self
            .config
            .fd_server_path
            .clone()
            .ok_or_else(|| anyhow::format_err!("no fd server configured"))?;
        let client = FdClient::new(&path);
        let fd = client.get_fd_for_address(&address.canonical())?;
        self.previous_umgmt_address = client.get_micro_management_address().ok();
        if let Some(previous) = &self.previous_umgmt_address {
            log::info!("previous micro_management address {previous}");
        }
        Ok(fd)
    }

    fn adopt_listener(&mut self, fd: OwnedFd, bound_here: bool) -> Result<(), Error> {
        // an ephemeral port is only known after the local bind
        if let BindAddress::Inet(host, 0) = &self.config.bind_address {
            let copy = dup_fd(fd.as_raw_fd())?;
            let port = TcpListener::from(copy)
                .local_addr()
                .context("failed to read bound address")?
                .port();
            self.config.bind_address = BindAddress::Inet(host.clone(), port);
            self.canonical_address = self.config.bind_address.canonical();
        }
        self.listener = Some(fd);
        self.bound_here = bound_here;
        Ok(())
    }

    fn run_drop_privileges(&mut self) -> Result<(), Error> {
        if let Some(callback) = self.drop_privileges.take() {
            callback().context("drop-privileges callback failed")?;
        }
        Ok(())
    }

    /// Start listening. An adopted descriptor is already listening, so
    /// only a locally bound one gets `listen(SOMAXCONN)`.
    pub fn server_activate(&mut self) -> Result<(), Error> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::format_err!("server_activate before server_bind"))?;
        if self.bound_here {
            activate_listener(listener)?;
        }
        Ok(())
    }

    pub fn listen_fd(&self) -> Result<BorrowedFd<'_>, Error> {
        self.listener
            .as_ref()
            .map(|fd| fd.as_fd())
            .ok_or_else(|| anyhow::format_err!("no listening socket available"))
    }

    /// Wait up to `timeout` for a connection and accept it. Returns
    /// `None` on timeout or signal interruption so the caller can check
    /// the quit flag and loop.
    pub fn accept_pending(&self, timeout: Duration) -> Result<Option<OwnedFd>, Error> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::format_err!("no listening socket available"))?;
        if !poll_readable(listener.as_fd(), timeout)? {
            return Ok(None);
        }
        match accept(listener.as_raw_fd()) {
            Ok(fd) => Ok(Some(unsafe {
                use std::os::unix::io::FromRawFd;
                OwnedFd::from_raw_fd(fd)
            })),
            // the connection went away between poll and accept
            Err(Errno::ECONNABORTED) | Err(Errno::EINTR) | Err(Errno::EAGAIN) => Ok(None),
            Err(errno) => Err(Error::new(errno).context("accept failed")),
        }
    }

    /// Per-request bookkeeping. Trips the quit flag once the worker has
    /// served its request budget or outlived its lifetime budget.
    pub fn close_request(&mut self) {
        self.request_count += 1;
        if let Some(max_requests) = self.config.max_requests_per_worker {
            if self.request_count >= max_requests {
                log::info!("worker served {} requests, quitting", self.request_count);
                self.quit.request_quit();
            }
        }
        if let Some(max_lifetime) = self.config.max_worker_lifetime {
            if self.started_at.elapsed() >= max_lifetime {
                log::info!("worker exceeded lifetime budget, quitting");
                self.quit.request_quit();
            }
        }
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn is_quit_requested(&self) -> bool {
        self.quit.is_quit_requested()
    }

    /// Reset per-process state in a freshly forked worker: restart the
    /// budgets and hook the quit flag up to SIGTERM/SIGINT.
    pub(crate) fn enter_worker(&mut self, ready_pipe: OwnedFd) -> Result<(), Error> {
        self.started_at = Instant::now();
        self.request_count = 0;
        self.ready_pipe = Some(ready_pipe);
        self.quit.register_signals()
    }

    /// Workers call this once their accept loop is running; the
    /// supervisor's rolling restart waits for it before retiring an old
    /// worker.
    pub fn signal_ready(&mut self) {
        if let Some(pipe) = self.ready_pipe.take() {
            if let Err(err) = nix::unistd::write(pipe.as_fd(), b"R") {
                log::warn!("failed to signal readiness: {err}");
            }
        }
    }
}

fn is_addr_in_use(err: &Error) -> bool {
    matches!(err.downcast_ref::<Errno>(), Some(Errno::EADDRINUSE))
}
