use std::io;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Transport, TransportKind};
use crate::error::ConnError;
use crate::option::ConnOption;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Message-oriented channel; every data frame becomes one inbound chunk.
pub struct WsTransport {
    ws: WsStream,
}

fn into_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl Transport for WsTransport {
    const KIND: TransportKind = TransportKind::WebSocket;

    async fn open(option: &ConnOption) -> Result<Self, ConnError> {
        let url = option.ws_url();
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnError::Connect {
                addr: url,
                source: into_io(e),
            })?;
        Ok(Self { ws })
    }

    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.ws.send(Message::Binary(frame)).await.map_err(into_io)
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            let msg = match self.ws.next().await {
                None => return Ok(None),
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(into_io(e)),
                Some(Ok(msg)) => msg,
            };

            match msg {
                Message::Binary(data) => return Ok(Some(data)),
                Message::Text(text) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_str().as_bytes())));
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(into_io(e)),
        }
    }
}
