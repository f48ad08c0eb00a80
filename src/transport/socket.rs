//! Stream sockets behind transport URIs.
//!
//! - `tcp://host:port` - TCP (Nagle disabled)
//! - `unix:///path` - Unix Domain Socket (Unix only)
//!
//! # Example
//!
//! ```no_run
//! use remotewire::transport::{connect, Listener, TransportUri};
//!
//! # async fn run() -> remotewire::Result<()> {
//! let listener = Listener::bind(&"tcp://127.0.0.1:0".parse()?).await?;
//! let uri = listener.local_uri()?;
//!
//! let (_reader, _writer) = connect(&uri).await?;
//! let accepted = listener.accept().await?;
//! println!("accepted {}", accepted.peer);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::{Error, Result};

/// Boxed read half of a socket.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a socket.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where a transport listens or dials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportUri {
    /// `tcp://host:port`
    Tcp(String),
    /// `unix:///path`
    Unix(PathBuf),
}

impl FromStr for TransportUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(address) = s.strip_prefix("tcp://") {
            if address.rsplit_once(':').map_or(true, |(host, port)| host.is_empty() || port.parse::<u16>().is_err()) {
                return Err(Error::InvalidEndpoint(format!("Bad TCP address in {}", s)));
            }
            return Ok(TransportUri::Tcp(address.to_string()));
        }
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::InvalidEndpoint(format!("Missing socket path in {}", s)));
            }
            return Ok(TransportUri::Unix(PathBuf::from(path)));
        }
        Err(Error::InvalidEndpoint(format!("Unsupported transport URI: {}", s)))
    }
}

impl fmt::Display for TransportUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportUri::Tcp(address) => write!(f, "tcp://{}", address),
            TransportUri::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A connection accepted by a [`Listener`].
pub struct Accepted {
    /// Read half.
    pub reader: BoxReader,
    /// Write half.
    pub writer: BoxWriter,
    /// Peer address, for logs.
    pub peer: String,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted").field("peer", &self.peer).finish()
    }
}

/// Listening socket.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix Domain Socket listener; the socket file is removed on drop.
    #[cfg(unix)]
    Unix {
        /// Bound listener.
        listener: tokio::net::UnixListener,
        /// Socket path.
        path: PathBuf,
    },
}

impl Listener {
    /// Bind to `uri`.
    ///
    /// For Unix sockets any existing socket file at the path is removed
    /// first.
    pub async fn bind(uri: &TransportUri) -> Result<Self> {
        match uri {
            TransportUri::Tcp(address) => Ok(Listener::Tcp(TcpListener::bind(address.as_str()).await?)),
            #[cfg(unix)]
            TransportUri::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            TransportUri::Unix(_) => Err(Error::InvalidEndpoint(
                "Unix sockets are not supported on this platform".to_string(),
            )),
        }
    }

    /// URI peers should dial. A TCP port of 0 is resolved to the bound port.
    pub fn local_uri(&self) -> Result<TransportUri> {
        match self {
            Listener::Tcp(listener) => Ok(TransportUri::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(TransportUri::Unix(path.clone())),
        }
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<Accepted> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok(Accepted {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    peer: addr.to_string(),
                })
            }
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                let (stream, _addr) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok(Accepted {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    peer: format!("unix://{}", path.display()),
                })
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Dial `uri`.
pub async fn connect(uri: &TransportUri) -> Result<(BoxReader, BoxWriter)> {
    debug!(%uri, "Connecting");
    match uri {
        TransportUri::Tcp(address) => {
            let stream = TcpStream::connect(address.as_str()).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(unix)]
        TransportUri::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(not(unix))]
        TransportUri::Unix(_) => Err(Error::InvalidEndpoint(
            "Unix sockets are not supported on this platform".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_uris() {
        assert_eq!(
            "tcp://127.0.0.1:9000".parse::<TransportUri>().unwrap(),
            TransportUri::Tcp("127.0.0.1:9000".into())
        );
        assert_eq!(
            "unix:///tmp/rw.sock".parse::<TransportUri>().unwrap(),
            TransportUri::Unix("/tmp/rw.sock".into())
        );
        assert_eq!(
            "unix:///tmp/rw.sock".parse::<TransportUri>().unwrap().to_string(),
            "unix:///tmp/rw.sock"
        );
        assert!("tcp://nohost".parse::<TransportUri>().is_err());
        assert!("tcp://host:notaport".parse::<TransportUri>().is_err());
        assert!("http://x:1".parse::<TransportUri>().is_err());
        assert!("unix://".parse::<TransportUri>().is_err());
    }

    #[tokio::test]
    async fn test_tcp_port_zero_resolves() {
        let listener = Listener::bind(&"tcp://127.0.0.1:0".parse().unwrap()).await.unwrap();
        let uri = listener.local_uri().unwrap();
        assert!(!uri.to_string().ends_with(":0"));

        let (_reader, mut writer) = connect(&uri).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();
        writer.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_cleanup() {
        let path = std::env::temp_dir().join(format!("remotewire-test-{}.sock", std::process::id()));
        let uri = TransportUri::Unix(path.clone());
        {
            let listener = Listener::bind(&uri).await.unwrap();
            assert!(path.exists());
            let _conn = connect(&uri).await.unwrap();
            let accepted = listener.accept().await.unwrap();
            assert!(accepted.peer.starts_with("unix://"));
        }
        assert!(!path.exists());
    }
}
