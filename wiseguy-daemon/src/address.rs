use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};

/// A listening endpoint: a Unix domain path or an AF_INET (host, port)
/// pair. The canonical string form (`/path` or `host:port`) is the key
/// into the fd registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindAddress {
    Unix(PathBuf),
    Inet(String, u16),
}

impl BindAddress {
    pub fn canonical(&self) -> String {
        match self {
            BindAddress::Unix(path) => path.display().to_string(),
            BindAddress::Inet(host, port) => format!("{host}:{port}"),
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, BindAddress::Unix(_))
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for BindAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.starts_with('/') {
            return Ok(BindAddress::Unix(PathBuf::from(s)));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format_err!("bind address {s:?} is neither /path nor host:port"))?;
        if host.is_empty() {
            bail!("bind address {s:?} has an empty host");
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format_err!("bind address {s:?} has an invalid port"))?;
        Ok(BindAddress::Inet(host.to_string(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_path() {
        let addr: BindAddress = "/tmp/fd.sock".parse().unwrap();
        assert_eq!(addr, BindAddress::Unix(PathBuf::from("/tmp/fd.sock")));
        assert!(addr.is_unix());
        assert_eq!(addr.canonical(), "/tmp/fd.sock");
    }

    #[test]
    fn test_parse_inet_pair() {
        let addr: BindAddress = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(addr, BindAddress::Inet("127.0.0.1".to_string(), 8080));
        assert_eq!(addr.canonical(), "127.0.0.1:8080");
    }

    #[test]
    fn test_reject_malformed() {
        assert!("localhost".parse::<BindAddress>().is_err());
        assert!(":8080".parse::<BindAddress>().is_err());
        assert!("localhost:http".parse::<BindAddress>().is_err());
    }
}
