//! Worker endpoints: TCP sockets and Unix domain sockets.
//!
//! Endpoints are written as
//! - `host:port` or `tcp://host:port` for TCP
//! - `unix:/path/to/socket` for a Unix domain socket (Unix only)
//!
//! # Example
//!
//! ```ignore
//! use gatewire::transport::{Endpoint, EndpointListener};
//!
//! let endpoint: Endpoint = "127.0.0.1:3001".parse()?;
//! let listener = EndpointListener::bind(&endpoint).await?;
//! let (reader, writer) = listener.accept().await?;
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{GatewayError, Result};

/// Boxed future returned by object-safe async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read half of a connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens connections to one worker.
///
/// The router holds one factory per service and calls it at startup and on
/// every reconnect attempt.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Open a fresh connection.
    fn connect(&self) -> BoxFuture<'_, Result<(BoxReader, BoxWriter)>>;

    /// Human readable target, for logs.
    fn describe(&self) -> String;
}

/// Address of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Tcp(String),
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

impl Endpoint {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Tcp(addr.into())
    }

    /// Connect and split the stream into owned halves.
    pub async fn connect(&self) -> Result<(BoxReader, BoxWriter)> {
        match self {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

impl ConnectionFactory for Endpoint {
    fn connect(&self) -> BoxFuture<'_, Result<(BoxReader, BoxWriter)>> {
        Box::pin(Endpoint::connect(self))
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl FromStr for Endpoint {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(GatewayError::InvalidRequest(
                        "unix endpoint needs a socket path".to_string(),
                    ));
                }
                return Ok(Endpoint::Unix(path.into()));
            }
            #[cfg(not(unix))]
            {
                return Err(GatewayError::InvalidRequest(format!(
                    "unix sockets are not supported on this platform: {path}"
                )));
            }
        }

        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(addr.to_string()))
            }
            _ => Err(GatewayError::InvalidRequest(format!(
                "invalid endpoint {s:?}, expected host:port or unix:/path"
            ))),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Listener accepting gateway connections on the worker side.
pub enum EndpointListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(unix_impl::UnixSocketListener),
}

impl EndpointListener {
    /// Bind to an endpoint.
    ///
    /// A stale Unix socket file at the path is removed first.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(EndpointListener::Tcp(TcpListener::bind(addr.as_str()).await?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(EndpointListener::Unix(
                unix_impl::UnixSocketListener::bind(path)?,
            )),
        }
    }

    /// Accept one connection, split into owned halves.
    pub async fn accept(&self) -> Result<(BoxReader, BoxWriter)> {
        match self {
            EndpointListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::debug!(%peer, "Accepted TCP connection");
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(unix)]
            EndpointListener::Unix(listener) => listener.accept().await,
        }
    }

    /// Address actually bound (resolves port 0 for TCP).
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            EndpointListener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            EndpointListener::Unix(listener) => Ok(Endpoint::Unix(listener.path().to_path_buf())),
        }
    }
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::{Path, PathBuf};
    use tokio::net::UnixListener;

    /// Unix domain socket listener that removes its socket file on drop.
    pub struct UnixSocketListener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl UnixSocketListener {
        pub fn bind(path: &Path) -> Result<Self> {
            if path.exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            Ok(Self {
                listener,
                path: path.to_path_buf(),
            })
        }

        pub async fn accept(&self) -> Result<(BoxReader, BoxWriter)> {
            let (stream, _addr) = self.listener.accept().await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for UnixSocketListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
