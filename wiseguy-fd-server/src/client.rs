//! Client counterpart to [`FdServer`](crate::FdServer). Each call opens
//! a fresh connection and disconnects on completion.

use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};

use crate::frame::{recv_str, recv_u32, send_str};
use crate::passing::recv_fd;

pub struct FdClient {
    path: PathBuf,
}

impl FdClient {
    pub fn new(path: &Path) -> FdClient {
        FdClient {
            path: path.to_path_buf(),
        }
    }

    fn connect(&self) -> Result<UnixStream, Error> {
        UnixStream::connect(&self.path)
            .with_context(|| format!("failed to connect to fd server {}", self.path.display()))
    }

    /// Ask the registry for the listening descriptor bound to
    /// `bind_address`. The returned descriptor is this process's own
    /// duplicate; the registry keeps its reference.
    pub fn get_fd_for_address(&self, bind_address: &str) -> Result<OwnedFd, Error> {
        let mut stream = self.connect()?;
        send_str(&mut stream, "REQ_FD")?;
        send_str(&mut stream, bind_address)?;
        match recv_str(&mut stream)?.as_str() {
            "OK" => recv_fd(&stream),
            "ERROR" => bail!("{}", recv_str(&mut stream)?),
            other => bail!("bad response: {other:?}"),
        }
    }

    pub fn get_pid(&self) -> Result<u32, Error> {
        let mut stream = self.connect()?;
        send_str(&mut stream, "REQ_PID")?;
        match recv_str(&mut stream)?.as_str() {
            "OK" => recv_u32(&mut stream),
            other => bail!("bad response: {other:?}"),
        }
    }

    pub fn get_available_addresses(&self) -> Result<Vec<String>, Error> {
        let mut stream = self.connect()?;
        send_str(&mut stream, "REQ_ADDRS")?;
        match recv_str(&mut stream)?.as_str() {
            "OK" => {
                let joined = recv_str(&mut stream)?;
                Ok(joined
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect())
            }
            "ERROR" => bail!("{}", recv_str(&mut stream)?),
            other => bail!("bad response: {other:?}"),
        }
    }

    /// The admin address of the generation currently holding the
    /// registry, if it recorded one.
    pub fn get_micro_management_address(&self) -> Result<String, Error> {
        let mut stream = self.connect()?;
        send_str(&mut stream, "REQ_UMGMT")?;
        match recv_str(&mut stream)?.as_str() {
            "OK" => recv_str(&mut stream),
            "ERROR" => bail!("{}", recv_str(&mut stream)?),
            other => bail!("bad response: {other:?}"),
        }
    }
}
