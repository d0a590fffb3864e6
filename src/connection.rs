use crate::error::{HeosError, Result};
use crate::protocol::Command;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const READ_BUFFER: usize = 16 * 1024;

/// Inbound traffic of one control connection
///
/// Every event carries the generation of the connection that produced it,
/// so events still queued from a torn-down socket can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes as read; framing is the session's job
    Data { generation: u64, bytes: Vec<u8> },
    /// The peer closed the socket or a read failed
    Closed {
        generation: u64,
        error: Option<String>,
    },
}

/// TCP control connection with a background read task
pub struct Connection {
    address: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Connect and start forwarding inbound bytes to `tx`
    pub async fn open<E: From<TransportEvent> + Send + 'static>(
        address: SocketAddr,
        connect_timeout: Duration,
        generation: u64,
        tx: mpsc::UnboundedSender<E>,
    ) -> Result<Self> {
        tracing::info!("Connecting to {}", address);

        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| HeosError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let (mut read, writer) = stream.into_split();
        let reader = tokio::spawn(async move {
            let mut buffer = vec![0u8; READ_BUFFER];
            loop {
                let event = match read.read(&mut buffer).await {
                    Ok(0) => {
                        tracing::debug!("Connection closed by player");
                        TransportEvent::Closed {
                            generation,
                            error: None,
                        }
                    }
                    Ok(n) => TransportEvent::Data {
                        generation,
                        bytes: buffer[..n].to_vec(),
                    },
                    Err(e) => {
                        tracing::debug!("Read error: {}", e);
                        TransportEvent::Closed {
                            generation,
                            error: Some(e.to_string()),
                        }
                    }
                };

                let closed = matches!(event, TransportEvent::Closed { .. });
                if tx.send(event.into()).is_err() || closed {
                    break;
                }
            }
        });

        Ok(Self {
            address,
            writer,
            reader,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Write one command line
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        if command.has_credentials() {
            tracing::debug!("Sending: {}", command.redacted());
            tracing::trace!("Sending: {}", command);
        } else {
            tracing::debug!("Sending: {}", command);
        }

        let line = format!("{}\r\n", command);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Stop reading and shut down the write side
    pub async fn close(mut self) {
        self.reader.abort();
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("Shutdown of {} failed: {}", self.address, e);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_send_writes_crlf_terminated_lines() {
        let (listener, addr) = listener().await;
        let (tx, _rx) = mpsc::unbounded_channel::<TransportEvent>();

        let mut connection = Connection::open(addr, Duration::from_secs(1), 1, tx).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        connection.send(&Command::heart_beat()).await.unwrap();
        connection.send(&Command::get_players()).await.unwrap();

        let expected = b"heos://system/heart_beat\r\nheos://player/get_players\r\n";
        let mut received = vec![0u8; expected.len()];
        let mut stream = stream;
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_reader_posts_data_then_close() {
        let (listener, addr) = listener().await;
        let (tx, mut rx) = mpsc::unbounded_channel::<TransportEvent>();

        let _connection = Connection::open(addr, Duration::from_secs(1), 7, tx).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        stream.write_all(b"{\"heos\":{}}").await.unwrap();
        drop(stream);

        let mut data = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                TransportEvent::Data { generation, bytes } => {
                    assert_eq!(generation, 7);
                    data.extend(bytes);
                }
                TransportEvent::Closed { generation, error } => {
                    assert_eq!(generation, 7);
                    assert!(error.is_none());
                    break;
                }
            }
        }
        assert_eq!(data, b"{\"heos\":{}}");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, addr) = listener().await;
        drop(listener);
        let (tx, _rx) = mpsc::unbounded_channel::<TransportEvent>();

        assert!(Connection::open(addr, Duration::from_secs(1), 1, tx).await.is_err());
    }
}
