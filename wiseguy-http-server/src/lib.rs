//! The HTTP/1.1 worker: a keep-alive aware request loop dispatching to
//! a hosted [`Application`], plus the preforking front that runs one
//! such loop in every worker process.

use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;

use wiseguy_daemon::{
    Application, Environ, ManagedServer, PreForkingSupervisor, ServerConfig,
};
use wiseguy_events::CollectorStack;

mod embedded;
mod handler;
mod request;
mod response;

pub use embedded::{AdminRequest, AdminResponse, AdminServer};
pub use handler::handle_connection;
pub use request::{build_environ, read_head, CountingReader, HeadOutcome, RequestBody, RequestHead};
pub use response::{write_response, SERVER_SOFTWARE};

/// How long a worker blocks in accept before rechecking its quit flag.
const ACCEPT_POLL: Duration = Duration::from_millis(500);

fn base_environ(server: &ManagedServer) -> Environ {
    let mut env = Environ::new();
    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert("SCRIPT_NAME".to_string(), String::new());
    match server.config().bind_address {
        wiseguy_daemon::BindAddress::Inet(ref host, port) => {
            env.insert("SERVER_NAME".to_string(), host.clone());
            env.insert("SERVER_PORT".to_string(), port.to_string());
        }
        wiseguy_daemon::BindAddress::Unix(ref path) => {
            env.insert("SERVER_NAME".to_string(), path.display().to_string());
            env.insert("SERVER_PORT".to_string(), String::new());
        }
    }
    env
}

/// The worker entry point: accept connections on the shared listening
/// socket and run the keep-alive loop on each until the quit flag
/// trips.
pub fn serve_forever(server: &mut ManagedServer, app: &dyn Application) -> Result<(), Error> {
    let base = base_environ(server);
    let is_unix = server.config().bind_address.is_unix();
    let mut events = CollectorStack::new();

    server.signal_ready();
    while !server.is_quit_requested() {
        let Some(fd) = server.accept_pending(ACCEPT_POLL)? else {
            continue;
        };
        if is_unix {
            let stream = UnixStream::from(fd);
            handle_connection(&stream, "unix", server, app, &mut events, &base);
        } else {
            let stream = TcpStream::from(fd);
            let remote = stream
                .peer_addr()
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            handle_connection(&stream, &remote, server, app, &mut events, &base);
        }
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

/// A preforking HTTP server: the supervisor binds (or adopts) the
/// listening socket and each forked worker runs [`serve_forever`].
pub struct PreForkingHttpServer {
    supervisor: PreForkingSupervisor,
}

impl PreForkingHttpServer {
    pub fn new(config: ServerConfig, app: Arc<dyn Application>) -> PreForkingHttpServer {
        Self::with_server(ManagedServer::new(config), app)
    }

    pub fn with_server(server: ManagedServer, app: Arc<dyn Application>) -> PreForkingHttpServer {
        let supervisor =
            PreForkingSupervisor::new(server, move |server| serve_forever(server, app.as_ref()));
        PreForkingHttpServer { supervisor }
    }

    pub fn server(&self) -> &ManagedServer {
        self.supervisor.server()
    }

    pub fn server_mut(&mut self) -> &mut ManagedServer {
        self.supervisor.server_mut()
    }

    /// Bind, activate, fork and supervise. Only returns in the
    /// supervisor process.
    pub fn run(&mut self) -> Result<(), Error> {
        self.supervisor.run()
    }
}
