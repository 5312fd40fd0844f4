use crate::error::PipelineError;
use crate::protocol::Decode;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

/// A decoded request plus the exact bytes it was framed from.
#[derive(Debug)]
pub struct Framed<T> {
    pub item: T,
    pub raw: Bytes,
}

/// Reads complete requests off a byte stream and writes replies back.
///
/// The framer owns the receive buffer; decoders only inspect it. Bytes past
/// the end of one request stay buffered for the next call to [`next`].
///
/// [`next`]: RequestFramer::next
pub struct RequestFramer<S> {
    stream: S,
    buffer: BytesMut,
    read_timeout: Option<Duration>,
}

impl<S> RequestFramer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            read_timeout: None,
        }
    }

    /// Bound every read by `timeout`. `None` waits forever.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Next complete request.
    ///
    /// End of stream with nothing buffered is `ConnectionClosed`; end of
    /// stream with a partial request buffered is a `ProtocolViolation`.
    pub async fn next<D: Decode>(&mut self, decoder: &mut D) -> Result<Framed<D::Item>, PipelineError> {
        loop {
            if !self.buffer.is_empty() {
                if let Some((item, used)) = decoder.decode(&self.buffer)? {
                    let raw = self.buffer.split_to(used).freeze();
                    return Ok(Framed { item, raw });
                }
            }

            if self.fill().await? == 0 {
                return if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    Err(PipelineError::ConnectionClosed)
                } else {
                    Err(PipelineError::violation(format!(
                        "stream closed with {} bytes of incomplete request",
                        self.buffer.len()
                    )))
                };
            }
        }
    }

    async fn fill(&mut self) -> Result<usize, PipelineError> {
        self.buffer.reserve(READ_CHUNK);
        let read = self.stream.read_buf(&mut self.buffer);
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| PipelineError::Timeout)?
                .map_err(PipelineError::from),
            None => read.await.map_err(PipelineError::from),
        }
    }

    pub async fn write_response(&mut self, bytes: &[u8]) -> Result<(), PipelineError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Number of bytes received but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HttpParser, RespParser, WireParser};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let mock = Builder::new()
            .read(b"*2\r\n$4\r\nECHO\r\n")
            .read(b"$2\r\nhi\r\n")
            .build();
        let mut framer = RequestFramer::new(mock);
        let mut parser = RespParser::new();

        let framed = framer.next(&mut parser).await.unwrap();
        assert_eq!(framed.item.name, "ECHO");
        assert_eq!(&framed.raw[..], b"*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n");
        assert_eq!(framer.buffered(), 0);
    }

    #[tokio::test]
    async fn test_pipelined_requests_in_one_read() {
        let mock = Builder::new().read(b"PING\r\nPING\r\n").build();
        let mut framer = RequestFramer::new(mock);
        let mut parser = RespParser::new();

        assert_eq!(framer.next(&mut parser).await.unwrap().item.name, "PING");
        assert_eq!(framer.next(&mut parser).await.unwrap().item.name, "PING");
        assert!(matches!(
            framer.next(&mut parser).await,
            Err(PipelineError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_clean_close_before_request() {
        let mock = Builder::new().build();
        let mut framer = RequestFramer::new(mock);
        assert!(matches!(
            framer.next(&mut HttpParser::default()).await,
            Err(PipelineError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_mid_frame_is_violation() {
        let mock = Builder::new().read(b"GET / HTTP/1.1\r\nHost: x\r\n").build();
        let mut framer = RequestFramer::new(mock);
        assert!(matches!(
            framer.next(&mut HttpParser::default()).await,
            Err(PipelineError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_header_is_violation() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&4i32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 12]);
        let mock = Builder::new().read(&raw).build();
        let mut framer = RequestFramer::new(mock);
        assert!(matches!(
            framer.next(&mut WireParser::default()).await,
            Err(PipelineError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (client, server) = tokio::io::duplex(64);
        let mut framer = RequestFramer::new(server).with_read_timeout(Some(Duration::from_millis(20)));
        let result = framer.next(&mut RespParser::new()).await;
        assert!(matches!(result, Err(PipelineError::Timeout)));
        drop(client);
    }

    #[tokio::test]
    async fn test_write_response() {
        let mock = Builder::new().write(b"+OK\r\n").build();
        let mut framer = RequestFramer::new(mock);
        framer.write_response(b"+OK\r\n").await.unwrap();
    }
}
