//! Buffered message stream over a TCP socket.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufStream, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use super::{Error, Message, ToBytes, MAX_MESSAGE_SIZE};

/// A connection carrying framed messages.
#[derive(Debug)]
pub struct Stream {
    inner: BufStream<TcpStream>,
}

impl Stream {
    /// Wrap a TCP stream.
    pub fn plain(stream: TcpStream) -> Self {
        Self {
            inner: BufStream::with_capacity(8192, 8192, stream),
        }
    }

    /// Dial a peer.
    pub async fn connect(addr: &str) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::plain(stream))
    }

    /// Get peer address, if available.
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.get_ref().peer_addr().ok()
    }

    /// Read one message.
    pub async fn read_message(&mut self) -> Result<Message, Error> {
        read_frame(&mut self.inner).await
    }

    /// Queue a message for sending.
    pub async fn send(&mut self, message: &impl ToBytes) -> Result<(), Error> {
        write_frame(&mut self.inner, message).await
    }

    /// Send a message and flush the socket.
    pub async fn send_flush(&mut self, message: &impl ToBytes) -> Result<(), Error> {
        self.send(message).await?;
        self.flush().await
    }

    /// Flush buffered writes.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Split into independently owned read and write halves, for
    /// connections where both directions run concurrently.
    pub async fn into_split(mut self) -> Result<(MessageReader, MessageWriter), Error> {
        self.flush().await?;
        let (read, write) = self.inner.into_inner().into_split();
        Ok((
            MessageReader {
                inner: BufReader::new(read),
            },
            MessageWriter {
                inner: BufWriter::new(write),
            },
        ))
    }
}

/// Read half of a split stream.
#[derive(Debug)]
pub struct MessageReader {
    inner: BufReader<OwnedReadHalf>,
}

impl MessageReader {
    pub async fn read_message(&mut self) -> Result<Message, Error> {
        read_frame(&mut self.inner).await
    }
}

/// Write half of a split stream.
#[derive(Debug)]
pub struct MessageWriter {
    inner: BufWriter<OwnedWriteHalf>,
}

impl MessageWriter {
    pub async fn send_flush(&mut self, message: &impl ToBytes) -> Result<(), Error> {
        write_frame(&mut self.inner, message).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Message, Error> {
    let len = match stream.read_i32_le().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Err(Error::Eof),
        Err(err) => return Err(err.into()),
    };

    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(Error::Oversized(len));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    let message = Message::new(Bytes::from(payload));
    trace!("recv '{}' ({} bytes)", message.code(), len);

    Ok(message)
}

async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    message: &impl ToBytes,
) -> Result<(), Error> {
    let payload = message.to_bytes()?;

    if payload.is_empty() || payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Oversized(payload.len()));
    }

    stream.write_i32_le(payload.len() as i32).await?;
    stream.write_all(&payload).await?;
    trace!("send '{}' ({} bytes)", payload[0] as char, payload.len());

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn roundtrip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = Stream::plain(socket);
            let message = stream.read_message().await.unwrap();
            stream.send_flush(&message).await.unwrap();
        });

        let mut client = Stream::connect(&addr.to_string()).await.unwrap();
        let message = Message::new(Bytes::from_static(b"xhello"));
        client.send_flush(&message).await.unwrap();

        let echoed = client.read_message().await.unwrap();
        assert_eq!(echoed.code(), 'x');
        assert_eq!(echoed.payload(), Bytes::from_static(b"xhello"));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn eof_reported_as_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut client = Stream::connect(&addr.to_string()).await.unwrap();
        server.await.unwrap();

        let err = client.read_message().await.unwrap_err();
        assert!(err.disconnect());
    }
}
