use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Transport, TransportKind};
use crate::error::ConnError;
use crate::option::ConnOption;

const READ_CHUNK: usize = 8 * 1024;

/// Raw byte stream; framing is entirely up to the codec.
pub struct TcpTransport {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl Transport for TcpTransport {
    const KIND: TransportKind = TransportKind::Tcp;

    async fn open(option: &ConnOption) -> Result<Self, ConnError> {
        let addr = option.addr();
        let stream = TcpStream::connect(addr.as_str())
            .await
            .map_err(|source| ConnError::Connect { addr, source })?;

        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Failed to set TCP_NODELAY: {}", e);
        }

        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
        })
    }

    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.stream.write_all(&frame).await
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        self.read_buf.reserve(READ_CHUNK);
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_buf.split().freeze()))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
