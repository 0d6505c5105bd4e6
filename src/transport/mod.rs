//! Transport layer for device telemetry
//!
//! The MQTT client never opens sockets itself; it asks a [`Connector`] for a
//! byte stream. Production code uses [`TcpConnector`], tests plug in an
//! in-memory duplex pipe.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub mod mqtt;

/// Opens the raw byte stream an MQTT connection runs over
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to `host:port`, failing with `TimedOut` after `timeout`
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<Self::Stream>;
}

/// Plain TCP, no TLS
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {timeout:?}"),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

pub use mqtt::{ClientOptions, ConnectionState, MqttClient, MqttCredentials, MqttError};
