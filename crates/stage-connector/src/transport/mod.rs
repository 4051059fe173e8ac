//! Framed byte transport to the collaboration server
//!
//! A [`Transport`] owns one connection: TCP, the secure channel on top of it,
//! and the frame codec. It only moves [`Frame`]s; interpreting them is the
//! session's job.

mod channel;

pub use channel::{
    channel_from_config, AsyncStream, BoxedStream, PlainChannel, RustlsChannel, SecureChannel,
};
#[cfg(feature = "native-tls")]
pub use channel::NativeTlsChannel;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use stage_core::{ConnectError, Endpoint, TransportError};
use stage_protocol::{Frame, FrameCodec};

/// An established, framed connection
pub struct Transport {
    reader: TransportReader,
    writer: TransportWriter,
}

impl Transport {
    /// Resolve `endpoint`, dial it and run the channel handshake, all within
    /// `timeout`.
    pub async fn connect(
        endpoint: &Endpoint,
        server_name: &str,
        channel: &dyn SecureChannel,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let dial = async {
            let addrs: Vec<_> = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
                .await
                .map_err(|source| ConnectError::Resolve {
                    endpoint: endpoint.to_string(),
                    source,
                })?
                .collect();
            if addrs.is_empty() {
                return Err(ConnectError::Resolve {
                    endpoint: endpoint.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no addresses found",
                    ),
                });
            }

            let tcp = TcpStream::connect(&addrs[..]).await?;
            tcp.set_nodelay(true)?;
            tracing::debug!(
                "TCP connected to {} ({}), starting {} handshake",
                endpoint,
                tcp.peer_addr()?,
                channel.name()
            );
            channel.handshake(tcp, server_name).await
        };

        let stream = tokio::time::timeout(timeout, dial)
            .await
            .map_err(|_| ConnectError::Timeout {
                endpoint: endpoint.to_string(),
            })??;

        Ok(Self::from_stream(stream))
    }

    /// Wrap an already established stream
    pub fn from_stream(stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: TransportReader {
                inner: FramedRead::new(read_half, FrameCodec::new()),
            },
            writer: TransportWriter {
                inner: FramedWrite::new(write_half, FrameCodec::new()),
                closed: false,
            },
        }
    }

    /// Wait for the next complete frame
    pub async fn read(&mut self) -> Result<Frame, TransportError> {
        self.reader.read().await
    }

    /// Send one frame and flush it
    pub async fn write(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.writer.write(frame).await
    }

    /// Shut the connection down. Safe to call more than once.
    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    /// Separate the read and write directions so they can be driven
    /// concurrently
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a [`Transport`]
pub struct TransportReader {
    inner: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
}

impl TransportReader {
    /// Wait for the next complete frame. A clean end of stream is
    /// [`TransportError::Closed`].
    pub async fn read(&mut self) -> Result<Frame, TransportError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Closed),
        }
    }
}

/// Sending half of a [`Transport`]
pub struct TransportWriter {
    inner: FramedWrite<WriteHalf<BoxedStream>, FrameCodec>,
    closed: bool,
}

impl TransportWriter {
    /// Send one frame and flush it
    pub async fn write(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.inner.send(frame).await.map_err(TransportError::from)
    }

    /// Flush and shut down the write direction. Safe to call more than once.
    pub async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Err(e) = self.inner.get_mut().shutdown().await {
            tracing::debug!("Error shutting down transport: {}", e);
        }
    }
}
