//! Reachability of the network service the game authenticates against.
//! Only the address and a connect check live here; the protocol itself is
//! the game's business.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("empty host in {0:?}")]
    EmptyHost(String),

    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for ServerAddr {
    type Err = AddrError;

    /// Accepts `host:port`, `host`, or a URL such as
    /// `http://host:port/path`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, default_port) = if let Some(rest) = s.strip_prefix("http://") {
            (rest, 80)
        } else if let Some(rest) = s.strip_prefix("https://") {
            (rest, 443)
        } else {
            (s, 80)
        };
        let authority = rest.split('/').next().unwrap_or_default();

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| AddrError::InvalidPort(s.to_string()))?,
            ),
            None => (authority, default_port),
        };

        if host.is_empty() {
            return Err(AddrError::EmptyHost(s.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Default)]
pub struct Eamuse {
    addr: Mutex<Option<ServerAddr>>,
}

impl Eamuse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_addr(&self, addr: ServerAddr) {
        info!("eAmusement server: {}", addr);
        *self.addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
    }

    pub fn addr(&self) -> Option<ServerAddr> {
        self.addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Try a TCP connection to the configured server. Failures are logged,
    /// never fatal.
    pub fn check_connection(&self) -> bool {
        let Some(addr) = self.addr() else {
            warn!("eAmusement: no server address set");
            return false;
        };

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("eAmusement: cannot start runtime: {}", e);
                return false;
            }
        };

        let result = runtime.block_on(async {
            tokio::time::timeout(
                CONNECT_TIMEOUT,
                tokio::net::TcpStream::connect((addr.host.as_str(), addr.port)),
            )
            .await
        });

        match result {
            Ok(Ok(_)) => {
                info!("eAmusement: {} is reachable", addr);
                true
            }
            Ok(Err(e)) => {
                warn!("eAmusement: cannot reach {}: {}", addr, e);
                false
            }
            Err(_) => {
                warn!("eAmusement: connecting to {} timed out", addr);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn parses_addresses() {
        assert_eq!(
            "localhost:8083".parse::<ServerAddr>(),
            Ok(ServerAddr {
                host: "localhost".into(),
                port: 8083
            })
        );
        assert_eq!(
            "http://eamuse.example/core".parse::<ServerAddr>().unwrap().port,
            80
        );
        assert_eq!(
            "https://10.0.0.1:8443/".parse::<ServerAddr>().unwrap(),
            ServerAddr {
                host: "10.0.0.1".into(),
                port: 8443
            }
        );
        assert!(matches!(":80".parse::<ServerAddr>(), Err(AddrError::EmptyHost(_))));
        assert!(matches!("host:99999".parse::<ServerAddr>(), Err(AddrError::InvalidPort(_))));
    }

    #[test]
    fn reports_reachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let eamuse = Eamuse::new();
        assert!(!eamuse.check_connection());

        eamuse.set_addr(ServerAddr {
            host: "127.0.0.1".into(),
            port,
        });
        assert!(eamuse.check_connection());
    }

    #[test]
    fn unreachable_server_is_not_fatal() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let eamuse = Eamuse::new();
        eamuse.set_addr(ServerAddr {
            host: "127.0.0.1".into(),
            port,
        });
        assert!(!eamuse.check_connection());
    }
}
