use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

#[cfg(unix)]
use deck_core::protocol::{FrameError, LineFramer};
#[cfg(unix)]
use std::{collections::VecDeque, path::PathBuf};
#[cfg(unix)]
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{unix::OwnedReadHalf, UnixStream},
};
#[cfg(unix)]
use tracing::warn;

/// Outbound text frames, one envelope or batch per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = io::Error> + Send>>;
/// Inbound raw frames; the stream ends when the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>>;

pub struct Socket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("unsupported address scheme in '{0}'")]
    UnsupportedAddress(String),
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("connect failed: {0}")]
    Io(#[from] io::Error),
    #[error("websocket handshake failed: {0}")]
    WebSocket(String),
}

/// Opens sockets to the agent endpoint.
///
/// Injected into the transport at construction so the channel never searches
/// its environment for a native bridge.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Socket, ConnectError>;
}

/// Picks a connector from the address scheme (`ws`, `wss`, `unix`).
pub fn connector_for(address: &str, max_frame_bytes: usize) -> Result<Arc<dyn Connector>, ConnectError> {
    let url = Url::parse(address).map_err(|err| ConnectError::InvalidAddress {
        address: address.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(Arc::new(WsConnector)),
        #[cfg(unix)]
        "unix" => Ok(Arc::new(UnixConnector::new(max_frame_bytes))),
        _ => {
            let _ = max_frame_bytes;
            Err(ConnectError::UnsupportedAddress(address.to_string()))
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, address: &str) -> Result<Socket, ConnectError> {
        let (ws, _) = connect_async(address)
            .await
            .map_err(|err| ConnectError::WebSocket(err.to_string()))?;
        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(|err| io::Error::new(io::ErrorKind::Other, err))
            .with(|text: String| future::ready(Ok::<_, io::Error>(Message::Text(text))));
        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
                Ok(Message::Binary(bytes)) => Some(Ok(bytes)),
                Ok(_) => None,
                Err(err) => Some(Err(io::Error::new(io::ErrorKind::Other, err))),
            })
        });

        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// NDJSON over a local Unix socket.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct UnixConnector {
    max_frame_bytes: usize,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self, address: &str) -> Result<Socket, ConnectError> {
        let path = unix_socket_path(address)?;
        let stream = UnixStream::connect(&path).await?;
        let (reader, writer) = stream.into_split();

        let sink = futures_util::sink::unfold(writer, |mut writer, text: String| async move {
            writer.write_all(text.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<_, io::Error>(writer)
        });

        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(ndjson_frames(reader, self.max_frame_bytes)),
        })
    }
}

#[cfg(unix)]
fn unix_socket_path(address: &str) -> Result<PathBuf, ConnectError> {
    let url = Url::parse(address).map_err(|err| ConnectError::InvalidAddress {
        address: address.to_string(),
        reason: err.to_string(),
    })?;
    if url.scheme() != "unix" {
        return Err(ConnectError::UnsupportedAddress(address.to_string()));
    }
    if url.path().is_empty() {
        return Err(ConnectError::InvalidAddress {
            address: address.to_string(),
            reason: "missing socket path".to_string(),
        });
    }
    Ok(PathBuf::from(url.path()))
}

#[cfg(unix)]
struct FrameReader {
    reader: OwnedReadHalf,
    framer: LineFramer,
    ready: VecDeque<Vec<u8>>,
    done: bool,
}

#[cfg(unix)]
impl FrameReader {
    fn accept(&mut self, lines: impl IntoIterator<Item = Result<Vec<u8>, FrameError>>) {
        for line in lines {
            match line {
                Ok(line) => self.ready.push_back(line),
                Err(err) => warn!(event = "deck_frame_error", error = %err),
            }
        }
    }
}

#[cfg(unix)]
fn ndjson_frames(
    reader: OwnedReadHalf,
    max_frame_bytes: usize,
) -> impl Stream<Item = io::Result<Vec<u8>>> + Send {
    let state = FrameReader {
        reader,
        framer: LineFramer::new(max_frame_bytes),
        ready: VecDeque::new(),
        done: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(frame) = state.ready.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.done {
                return None;
            }
            match state.reader.read(&mut buf).await {
                Ok(0) => {
                    state.done = true;
                    let tail = state.framer.flush();
                    state.accept(tail);
                }
                Ok(read) => {
                    let lines = state.framer.feed(&buf[..read]);
                    state.accept(lines);
                }
                Err(err) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
            }
        }
    })
}
