//! Server lifecycle handling: bind/activate with listening-socket
//! adoption, the per-worker quit flag, and the preforking supervisor.

mod address;
mod handler;
mod managed;
mod prefork;
mod state;

pub use address::BindAddress;
pub use handler::{status_reason, Application, Environ, Response};
pub use managed::{activate_listener, bind_listener, poll_readable, ManagedServer, ServerConfig};
pub use prefork::PreForkingSupervisor;
pub use state::QuitFlag;
