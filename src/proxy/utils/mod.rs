mod hashing_reader;
mod tee_reader;

use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

pub use hashing_reader::HashingReader;
pub use tee_reader::{tee_reader, ChannelReader, TeeConfig};

pub trait Reader: AsyncRead + Unpin + Send {}

impl<T> Reader for T where T: AsyncRead + Unpin + Send {}

pub fn body_reader(incoming: Incoming) -> impl Reader {
    let stream = incoming.into_data_stream().map_err(io::Error::other);
    StreamReader::new(stream)
}
