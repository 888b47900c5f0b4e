use sha2::{Digest as _, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::oci::Digest;

/// A wrapper around an `AsyncRead` that computes a SHA256 hash and counts bytes on the fly.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    size: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            size: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Note that if the stream has not been fully read, the returned digest
    /// only covers the bytes that have been seen so far.
    pub fn digest(self) -> Digest {
        Digest::from_hasher(self.hasher)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let pre_len = buf.filled().len();

        let inner = Pin::new(&mut self.inner);
        match inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let post_len = buf.filled().len();
                if post_len > pre_len {
                    let new_data = &buf.filled()[pre_len..post_len];
                    self.hasher.update(new_data);
                    self.size += (post_len - pre_len) as u64;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
