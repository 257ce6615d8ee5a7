//! A tiny server to dole out file descriptors to requesting processes,
//! so a new server generation can adopt its predecessor's listening
//! socket instead of racing it for the bind address.

mod client;
mod frame;
mod passing;
mod server;

pub use client::FdClient;
pub use frame::{recv_str, recv_u32, send_str, send_u32, MAX_FRAME_LEN};
pub use passing::{dup_fd, recv_fd, send_fd};
pub use server::FdServer;
