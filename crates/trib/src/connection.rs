//! Node transport.
//!
//! Everything above this module talks to nodes through two small traits:
//! a [`Connector`] opens a [`Link`] to an address, and a link carries one
//! command at a time. [`TcpConnector`] is the real implementation; tests
//! substitute an in-memory cluster.

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use trib_protocol::{encode_command, parse_reply, Frame};

use crate::addr::NodeAddr;
use crate::error::ConnectionError;

/// One open session with a node.
///
/// `call` returns the node's reply as-is, error replies included; turning
/// `Frame::Error` into a failure is left to the caller.
pub trait Link: Send {
    fn call(
        &mut self,
        args: &[String],
    ) -> impl Future<Output = Result<Frame, ConnectionError>> + Send;
}

/// Opens links to nodes.
pub trait Connector: Sync {
    type Link: Link;

    fn connect(
        &self,
        addr: &NodeAddr,
    ) -> impl Future<Output = Result<Self::Link, ConnectionError>> + Send;
}

/// Credentials and timeouts applied to every connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            password: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Opens authenticated TCP connections.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    opts: ConnectOptions,
}

impl TcpConnector {
    pub fn new(opts: ConnectOptions) -> Self {
        Self { opts }
    }
}

impl Connector for TcpConnector {
    type Link = Connection;

    async fn connect(&self, addr: &NodeAddr) -> Result<Connection, ConnectionError> {
        Connection::connect(addr, &self.opts).await
    }
}

/// A buffered TCP connection to one node.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    command_timeout: Duration,
    /// Set while a round trip is in flight. A round trip that never
    /// finished leaves its reply unread, so the stream can't be trusted.
    broken: bool,
}

impl Connection {
    /// Connects, authenticates when a password is configured, and checks
    /// the node answers `PING`.
    pub async fn connect(addr: &NodeAddr, opts: &ConnectOptions) -> Result<Self, ConnectionError> {
        let stream = tokio::time::timeout(
            opts.connect_timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(opts.connect_timeout))??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(16 * 1024),
            write_buf: BytesMut::with_capacity(1024),
            command_timeout: opts.command_timeout,
            broken: false,
        };

        if let Some(password) = &opts.password {
            conn.authenticate(password).await?;
        }
        conn.ping().await?;

        debug!(%addr, "connected");
        Ok(conn)
    }

    /// Sends one command and waits for its reply, bounded by the command
    /// timeout.
    ///
    /// After a timeout, an I/O or protocol error, or a dropped call, every
    /// later command fails with [`ConnectionError::Disconnected`].
    pub async fn send_command(&mut self, args: &[String]) -> Result<Frame, ConnectionError> {
        if self.broken {
            return Err(ConnectionError::Disconnected);
        }
        let limit = self.command_timeout;
        tokio::time::timeout(limit, self.round_trip(args))
            .await
            .map_err(|_| ConnectionError::Timeout(limit))?
    }

    /// Closes the write half. Errors are ignored; the peer may already be
    /// gone.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn authenticate(&mut self, password: &str) -> Result<(), ConnectionError> {
        let reply = self
            .send_command(&["AUTH".to_string(), password.to_string()])
            .await?;
        match reply {
            Frame::Simple(s) if s == "OK" => Ok(()),
            Frame::Error(e) => Err(ConnectionError::AuthFailed(e)),
            other => Err(ConnectionError::AuthFailed(format!(
                "unexpected response to AUTH: {other:?}"
            ))),
        }
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        match self.send_command(&["PING".to_string()]).await? {
            Frame::Simple(s) if s == "PONG" => Ok(()),
            Frame::Error(e) => Err(ConnectionError::Reply(e)),
            other => Err(ConnectionError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    async fn round_trip(&mut self, args: &[String]) -> Result<Frame, ConnectionError> {
        self.broken = true;
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        loop {
            if let Some((frame, used)) = parse_reply(&self.read_buf)? {
                let _ = self.read_buf.split_to(used);
                self.broken = false;
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ConnectionError::Disconnected);
            }
        }
    }
}

impl Link for Connection {
    async fn call(&mut self, args: &[String]) -> Result<Frame, ConnectionError> {
        self.send_command(args).await
    }
}
