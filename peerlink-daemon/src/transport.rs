//! TCP channels: outbound connections carry length-prefixed message frames one way; inbound
//! connections are decoded and pushed into the session's event queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink_core::wire::{decode_frame, frame_len, LEN_SIZE};
use peerlink_core::{encode_frame, Channel, Message, TransportError, TransportEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames queued per channel before `send` waits.
const WRITE_QUEUE_DEPTH: usize = 256;

pub const LOCATOR_SCHEME: &str = "tcp://";

pub fn locator(addr: SocketAddr) -> String {
    format!("{LOCATOR_SCHEME}{addr}")
}

pub fn parse_locator(locator: &str) -> Result<SocketAddr, TransportError> {
    locator
        .strip_prefix(LOCATOR_SCHEME)
        .and_then(|a| a.parse().ok())
        .ok_or_else(|| TransportError::Unreachable(format!("bad locator {locator:?}")))
}

/// Outbound half of a TCP connection. A writer task drains the queue into the socket; a watcher
/// on the read half marks the channel closed when the peer hangs up.
pub struct TcpChannel {
    peer: SocketAddr,
    frames: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl TcpChannel {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        stream.set_nodelay(true)?;
        info!(peer = %addr, "channel connected");
        Ok(Self::spawn(stream, addr))
    }

    fn spawn(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        let (frames, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        tokio::spawn(write_loop(writer, rx, peer, closed.clone(), cancel.clone()));
        tokio::spawn(watch_hangup(reader, peer, closed.clone(), cancel.clone()));
        Self {
            peer,
            frames,
            closed,
            cancel,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(message)?;
        self.frames
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// Frames already queued when the channel is closed are still written.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    peer: SocketAddr,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        if let Err(e) = writer.write_all(&frame).await {
            warn!(peer = %peer, error = %e, "channel write failed");
            closed.store(true, Ordering::SeqCst);
            cancel.cancel();
            return;
        }
    }
    rx.close();
    while let Some(frame) = rx.recv().await {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
    closed.store(true, Ordering::SeqCst);
    debug!(peer = %peer, "channel writer finished");
}

/// The remote end never writes on an outbound channel, so any read completing means hang-up.
async fn watch_hangup(
    mut reader: OwnedReadHalf,
    peer: SocketAddr,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            r = reader.read(&mut buf) => match r {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
        }
    }
    debug!(peer = %peer, "peer hung up");
    closed.store(true, Ordering::SeqCst);
    cancel.cancel();
}

/// Accept inbound channels until cancelled.
pub async fn run_listener(
    listener: TcpListener,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            a = listener.accept() => a,
        };
        match accepted {
            Ok((stream, from)) => {
                debug!(peer = %from, "inbound channel");
                tokio::spawn(read_frames(stream, from, events.clone(), cancel.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("channel listener stopped");
}

/// Decode frames off one inbound connection. A bad frame ends the connection.
async fn read_frames(
    mut stream: TcpStream,
    from: SocketAddr,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            f = read_frame(&mut stream) => f,
        };
        let bytes = match frame {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping inbound channel");
                break;
            }
        };
        match decode_frame::<Message>(&bytes) {
            Ok((msg, _)) => {
                if events.send(TransportEvent::Message(msg)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "undecodable frame");
                break;
            }
        }
    }
    debug!(peer = %from, "inbound channel closed");
}

/// One whole frame, prefix included. `None` on clean EOF at a frame boundary.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, TransportError> {
    let mut len_buf = [0u8; LEN_SIZE];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(&len_buf)?;
    let mut bytes = vec![0u8; LEN_SIZE + len];
    bytes[..LEN_SIZE].copy_from_slice(&len_buf);
    stream.read_exact(&mut bytes[LEN_SIZE..]).await?;
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use peerlink_core::{PeerIdentity, TextMessage};

    use super::*;

    async fn listener() -> (SocketAddr, mpsc::Receiver<TransportEvent>, CancellationToken) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_listener(l, tx, cancel.clone()));
        (addr, rx, cancel)
    }

    #[test]
    fn locators_parse_back() {
        let addr: SocketAddr = "192.168.1.7:45681".parse().unwrap();
        assert_eq!(locator(addr), "tcp://192.168.1.7:45681");
        assert_eq!(parse_locator(&locator(addr)).unwrap(), addr);
        assert!(matches!(
            parse_locator("udp://1.2.3.4:1"),
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (addr, mut rx, cancel) = listener().await;
        let ch = TcpChannel::connect(addr, Duration::from_secs(5)).await.unwrap();
        let alice = PeerIdentity::generate("alice");
        for text in ["one", "two", "three"] {
            ch.send(&TextMessage::new(alice.clone(), text).to_message())
                .await
                .unwrap();
        }
        for text in ["one", "two", "three"] {
            let Some(TransportEvent::Message(msg)) = rx.recv().await else {
                panic!("expected a message");
            };
            assert_eq!(TextMessage::from_message(&msg).unwrap().text, text);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn frames_queued_before_close_are_flushed() {
        let (addr, mut rx, cancel) = listener().await;
        let ch = TcpChannel::connect(addr, Duration::from_secs(5)).await.unwrap();
        let alice = PeerIdentity::generate("alice");
        ch.send(&TextMessage::new(alice, "last").to_message())
            .await
            .unwrap();
        ch.close().await;
        assert!(ch.is_closed());
        assert!(matches!(
            ch.send(&Message::empty()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Message(_))));
        cancel.cancel();
    }

    #[tokio::test]
    async fn hangup_marks_channel_closed() {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        let accept = tokio::spawn(async move { l.accept().await.unwrap() });
        let ch = TcpChannel::connect(addr, Duration::from_secs(5)).await.unwrap();
        let (server_side, _) = accept.await.unwrap();
        drop(server_side);
        for _ in 0..200 {
            if ch.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn refused_connect_is_an_error() {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        drop(l);
        assert!(TcpChannel::connect(addr, Duration::from_secs(5)).await.is_err());
    }
}
