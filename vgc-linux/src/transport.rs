//! TCP transport: every link is two TCP connections (small and large stream), each opened with
//! a preamble naming its channel kind and the link's session token. Reader and writer tasks run
//! per stream; everything they observe is reported to the event loop as a `NetEvent`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vgc_core::{
    Channel, ChannelError, ChannelKind, ConnectError, Connector, Endpoint, Preamble, StreamId,
    StreamPair, PREAMBLE_LEN,
};

/// Frames queued per stream before writes report no space.
const QUEUE_DEPTH: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUF: usize = 16 * 1024;

/// What the network side saw, in the order it saw it per stream.
#[derive(Debug)]
pub enum NetEvent {
    /// A peer connected and sent its preamble.
    Inbound {
        stream: StreamId,
        preamble: Preamble,
        channel: TcpChannel,
    },
    /// Outbound stream connected and preamble written.
    Opened(StreamId),
    Bytes(StreamId, Vec<u8>),
    /// `error` is `None` on a clean end of stream.
    Closed {
        stream: StreamId,
        error: Option<String>,
    },
}

/// Stream id allocator shared by the listener and the connector.
#[derive(Debug, Clone, Default)]
pub struct StreamIds(Arc<AtomicU64>);

impl StreamIds {
    pub fn next(&self) -> StreamId {
        StreamId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Write side of one TCP stream: a bounded queue drained by the stream's writer task.
#[derive(Debug)]
pub struct TcpChannel {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl TcpChannel {
    fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx: Some(tx) }
    }
}

impl Channel for TcpChannel {
    fn has_space_available(&self) -> bool {
        self.tx.as_ref().map_or(false, |tx| tx.capacity() > 0)
    }

    fn write(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    /// Dropping the sender ends the writer task, which tears the connection down.
    fn close(&mut self) {
        self.tx = None;
    }
}

pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "listening for peripheral streams");
    Ok(listener)
}

/// Accept streams forever; each one reports `Inbound` once its preamble is read.
pub async fn accept_loop(
    listener: TcpListener,
    ids: StreamIds,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let id = ids.next();
                let events = events.clone();
                tokio::spawn(async move {
                    match read_preamble(stream).await {
                        Ok((stream, preamble)) => {
                            debug!(?id, %from, kind = ?preamble.kind, "inbound stream");
                            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                            let channel = TcpChannel::new(tx);
                            let inbound = NetEvent::Inbound {
                                stream: id,
                                preamble,
                                channel,
                            };
                            if events.send(inbound).is_ok() {
                                run_stream(id, stream, rx, events).await;
                            }
                        }
                        Err(e) => warn!(%from, "bad stream preamble: {}", e),
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                break;
            }
        }
    }
}

async fn read_preamble(mut stream: TcpStream) -> std::io::Result<(TcpStream, Preamble)> {
    let mut buf = [0u8; PREAMBLE_LEN];
    tokio::time::timeout(PREAMBLE_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no preamble"))??;
    let preamble = Preamble::decode(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.set_nodelay(true)?;
    Ok((stream, preamble))
}

/// Pump one connected stream until either side ends it.
async fn run_stream(
    id: StreamId,
    stream: TcpStream,
    mut rx: mpsc::Receiver<Vec<u8>>,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let write = async {
        while let Some(bytes) = rx.recv().await {
            writer.write_all(&bytes).await?;
        }
        writer.shutdown().await
    };

    let read_events = events.clone();
    let read = async move {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), std::io::Error>(());
            }
            if read_events.send(NetEvent::Bytes(id, buf[..n].to_vec())).is_err() {
                return Ok(());
            }
        }
    };

    let outcome = tokio::select! {
        r = write => r,
        r = read => r,
    };
    let error = outcome.err().map(|e| e.to_string());
    debug!(?id, ?error, "stream ended");
    let _ = events.send(NetEvent::Closed { stream: id, error });
}

async fn connect(addr: SocketAddr, preamble: Preamble) -> std::io::Result<TcpStream> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    stream.write_all(&preamble.encode()).await?;
    Ok(stream)
}

/// Opens the two outbound connections of a link.
pub struct TcpConnector {
    ids: StreamIds,
    events: mpsc::UnboundedSender<NetEvent>,
}

impl TcpConnector {
    pub fn new(ids: StreamIds, events: mpsc::UnboundedSender<NetEvent>) -> Self {
        Self { ids, events }
    }

    fn spawn_outbound(&self, addr: SocketAddr, preamble: Preamble) -> (StreamId, TcpChannel) {
        let id = self.ids.next();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let events = self.events.clone();
        tokio::spawn(async move {
            match connect(addr, preamble).await {
                Ok(stream) => {
                    debug!(?id, %addr, kind = ?preamble.kind, "outbound stream open");
                    if events.send(NetEvent::Opened(id)).is_ok() {
                        run_stream(id, stream, rx, events).await;
                    }
                }
                Err(e) => {
                    let _ = events.send(NetEvent::Closed {
                        stream: id,
                        error: Some(e.to_string()),
                    });
                }
            }
        });
        (id, TcpChannel::new(tx))
    }
}

impl Connector for TcpConnector {
    type Channel = TcpChannel;

    fn open_streams(
        &mut self,
        endpoint: &Endpoint,
        token: Uuid,
    ) -> Result<StreamPair<TcpChannel>, ConnectError> {
        let addr = *endpoint.addresses.first().ok_or_else(|| {
            ConnectError::Transport(format!("{} has no address", endpoint.full_name))
        })?;
        let (small_id, small) = self.spawn_outbound(
            addr,
            Preamble {
                kind: ChannelKind::Small,
                token,
            },
        );
        let (large_id, large) = self.spawn_outbound(
            addr,
            Preamble {
                kind: ChannelKind::Large,
                token,
            },
        );
        Ok(StreamPair {
            small_id,
            small,
            large_id,
            large,
        })
    }
}
