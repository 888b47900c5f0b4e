use hyper::body::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::{task, time};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::debug;

/// Converts an MPSC Receiver of byte chunks into an `AsyncRead`.
pub struct ChannelReader {
    inner: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        let stream = ReceiverStream::new(rx);
        Self {
            inner: StreamReader::new(stream),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TeeConfig {
    /// The size of the temporary read buffer.
    pub buffer_size: usize,
    /// The maximum number of chunks buffered for each consumer.
    pub channel_capacity: usize,
    /// Maximum idle time between two chunks of the source.
    pub read_timeout: Duration,
}

fn copy_error(error: &io::Error) -> io::Error {
    io::Error::new(error.kind(), error.to_string())
}

/// Tee the given `AsyncRead` into a primary and a secondary `AsyncRead` handle.
///
/// A background task reads from the source and sends each chunk to both
/// bounded channels, so the slowest consumer applies backpressure.
///
/// The two sides are not symmetric:
/// - if the primary consumer goes away, reading stops and the secondary
///   consumer receives an error instead of a clean end of stream;
/// - if the secondary consumer goes away, the primary consumer keeps being fed;
/// - a source error or an idle timeout is forwarded to both consumers.
pub fn tee_reader<R>(mut reader: R, config: TeeConfig) -> (ChannelReader, ChannelReader)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let capacity = config.channel_capacity.max(1);
    let (primary, primary_rx) = mpsc::channel::<io::Result<Bytes>>(capacity);
    let (secondary_tx, secondary_rx) = mpsc::channel::<io::Result<Bytes>>(capacity);

    task::spawn(async move {
        let mut secondary = Some(secondary_tx);
        let mut buf = vec![0u8; config.buffer_size.max(1)];

        loop {
            let n = match time::timeout(config.read_timeout, reader.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(error)) => {
                    debug!("Error reading from source: {error}");
                    if let Some(secondary) = secondary.take() {
                        let _ = secondary.send(Err(copy_error(&error))).await;
                    }
                    let _ = primary.send(Err(error)).await;
                    break;
                }
                Err(_) => {
                    debug!("Timed out reading from source");
                    let error = io::Error::new(io::ErrorKind::TimedOut, "source read timed out");
                    if let Some(secondary) = secondary.take() {
                        let _ = secondary.send(Err(copy_error(&error))).await;
                    }
                    let _ = primary.send(Err(error)).await;
                    break;
                }
            };

            let chunk = Bytes::copy_from_slice(&buf[..n]);
            let (primary_sent, secondary_sent) = match &secondary {
                Some(secondary) => {
                    let (p, s) = tokio::join!(
                        primary.send(Ok(chunk.clone())),
                        secondary.send(Ok(chunk))
                    );
                    (p.is_ok(), s.is_ok())
                }
                None => (primary.send(Ok(chunk)).await.is_ok(), false),
            };

            if !primary_sent {
                debug!("Primary consumer went away, aborting");
                if let Some(secondary) = secondary.take() {
                    let error = io::Error::new(io::ErrorKind::BrokenPipe, "primary consumer aborted");
                    let _ = secondary.send(Err(error)).await;
                }
                break;
            }

            if !secondary_sent && secondary.take().is_some() {
                debug!("Secondary consumer went away, continuing with primary only");
            }
        }
        // Dropping the senders signals EOF to the receivers.
    });

    (ChannelReader::new(primary_rx), ChannelReader::new(secondary_rx))
}
