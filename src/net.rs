// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Listen address parsing and the TCP / Unix domain socket listener.

use crate::error::{ServerError, ServerResult};
use std::{
    fmt::{self, Display},
    path::PathBuf,
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
};

/// A listen address: `host:port` or an absolute filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP address resolved by standard rules
    Tcp(String),
    /// Unix domain socket path
    Unix(PathBuf),
}

impl Default for ListenAddr {
    fn default() -> Self {
        ListenAddr::Tcp("127.0.0.1:9000".to_owned())
    }
}

impl FromStr for ListenAddr {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ServerError::ConfigInvalid {
                reason: "empty listen address".to_owned(),
            });
        }
        if s.starts_with('/') {
            Ok(ListenAddr::Unix(PathBuf::from(s)))
        } else {
            Ok(ListenAddr::Tcp(s.to_owned()))
        }
    }
}

impl Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => Display::fmt(addr, f),
            ListenAddr::Unix(path) => Display::fmt(&path.display(), f),
        }
    }
}

/// The bound listener behind the accept loop.
pub enum Listener {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix domain socket listener; the path is unlinked on drop
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Binds the configured address. A stale Unix socket file is removed
    /// before binding.
    pub async fn bind(addr: &ListenAddr) -> ServerResult<Self> {
        match addr {
            ListenAddr::Tcp(tcp) => TcpListener::bind(tcp).await.map(Listener::Tcp).map_err(
                |source| ServerError::BindFail {
                    addr: tcp.clone(),
                    source,
                },
            ),
            ListenAddr::Unix(path) => {
                let _ = std::fs::remove_file(path);
                UnixListener::bind(path)
                    .map(|listener| Listener::Unix(listener, path.clone()))
                    .map_err(|source| ServerError::BindFail {
                        addr: path.display().to_string(),
                        source,
                    })
            }
        }
    }

    /// A printable form of the bound address; for TCP this reflects the
    /// actual port when the configuration asked for port 0.
    pub fn local_desc(&self) -> String {
        match self {
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            Listener::Unix(_, path) => path.display().to_string(),
        }
    }

    /// Accepts one connection, returning the stream and a printable peer
    /// description.
    pub async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Stream::Tcp(stream), peer.to_string()))
            }
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok((Stream::Unix(stream), "unix".to_owned()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// One accepted connection stream.
pub enum Stream {
    /// TCP connection
    Tcp(TcpStream),
    /// Unix domain socket connection
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_unix_addresses() {
        assert_eq!(
            "127.0.0.1:9000".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("127.0.0.1:9000".to_owned())
        );
        assert_eq!(
            "/run/fpm.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/run/fpm.sock"))
        );
        assert!("".parse::<ListenAddr>().is_err());
    }

    #[tokio::test]
    async fn tcp_bind_and_accept() {
        let listener = Listener::bind(&ListenAddr::Tcp("127.0.0.1:0".to_owned()))
            .await
            .unwrap();
        let addr = match &listener {
            Listener::Tcp(l) => l.local_addr().unwrap(),
            _ => unreachable!(),
        };

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, peer) = listener.accept().await.unwrap();
        assert!(peer.contains("127.0.0.1"));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn unix_socket_removed_on_drop() {
        let path = std::env::temp_dir().join(format!("fpm-net-test-{}.sock", std::process::id()));
        let listener = Listener::bind(&ListenAddr::Unix(path.clone())).await.unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
