//! Chunked file transfer: split a file into fixed-size packets on send, write each packet at its
//! absolute offset on receive. Arrival order does not matter.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::identity::{PeerId, PeerIdentity};
use crate::protocol::{field, Message, MessageError, MessageType};
use crate::transport::{Channel, TransportError};

/// Default packet payload size in bytes.
pub const DEFAULT_PACKET_SIZE: usize = 100_000;

/// `PacketPayloadSize` of the final, empty packet.
pub const TERMINATOR_PAYLOAD_SIZE: i64 = -1;

/// Prefix of every received file name, so a transfer never lands on the original path.
pub const RECEIVED_PREFIX: &str = "received_";

/// Packet count announced in `TotalPackets`. Over-approximates the real count (it is computed
/// once, before reading) and is only meant for display.
pub fn total_packets(file_size: u64, packet_size: usize) -> u64 {
    file_size / packet_size.max(1) as u64 + 2
}

fn effective_packet_size(packet_size: usize) -> usize {
    if packet_size == 0 {
        DEFAULT_PACKET_SIZE
    } else {
        packet_size
    }
}

/// One fragment of a file: a `FILE` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePacket {
    pub from: PeerIdentity,
    pub filename: String,
    pub total_packets: u64,
    /// Bytes of `content` that belong to the file, or `TERMINATOR_PAYLOAD_SIZE`.
    pub payload_size: i64,
    /// 1-based.
    pub sequence: u64,
    pub content: Vec<u8>,
}

impl FilePacket {
    pub fn is_terminator(&self) -> bool {
        self.payload_size == TERMINATOR_PAYLOAD_SIZE
    }

    pub fn to_message(&self) -> Message {
        let mut msg = Message::new(MessageType::File, &self.from);
        msg.push_text(field::FILENAME, self.filename.as_str());
        msg.push_text(field::TOTAL_PACKETS, self.total_packets.to_string());
        msg.push_text(field::PACKET_PAYLOAD_SIZE, self.payload_size.to_string());
        msg.push_text(field::PACKET_SEQUENCE_NUMBER, self.sequence.to_string());
        msg.push_bytes(field::CONTENT, self.content.clone());
        msg
    }

    pub fn from_message(msg: &Message) -> Result<Self, MessageError> {
        let from = msg.sender()?;
        let filename = msg.require_text(field::FILENAME)?.to_string();
        let total_packets: u64 = msg.require_number(field::TOTAL_PACKETS)?;
        let payload_size: i64 = msg.require_number(field::PACKET_PAYLOAD_SIZE)?;
        let sequence: u64 = msg.require_number(field::PACKET_SEQUENCE_NUMBER)?;
        let content = msg.require_bytes(field::CONTENT)?.to_vec();

        if sequence == 0 {
            return Err(MessageError::InvalidField {
                field: field::PACKET_SEQUENCE_NUMBER,
                value: sequence.to_string(),
            });
        }
        let size_ok = payload_size == TERMINATOR_PAYLOAD_SIZE
            || (payload_size >= 0 && payload_size as u64 <= content.len() as u64);
        if !size_ok {
            return Err(MessageError::InvalidField {
                field: field::PACKET_PAYLOAD_SIZE,
                value: payload_size.to_string(),
            });
        }
        Ok(Self {
            from,
            filename,
            total_packets,
            payload_size,
            sequence,
            content,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no usable file name in {0:?}")]
    InvalidName(String),
    #[error("malformed file packet: {0}")]
    Malformed(#[from] MessageError),
    #[error("channel error: {0}")]
    Channel(#[source] TransportError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TransferError + '_ {
    move |source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Final path component of `name`, or `None` if it has none.
fn base_name(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Where a file called `filename` (as named by the sender) is written inside `dir`.
pub fn destination_path(dir: &Path, filename: &str) -> Result<PathBuf, TransferError> {
    let base = base_name(filename).ok_or_else(|| TransferError::InvalidName(filename.into()))?;
    Ok(dir.join(format!("{RECEIVED_PREFIX}{base}")))
}

/// Fill `buf` as far as the reader allows. Returns the number of bytes read; less than
/// `buf.len()` only at end of file.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    /// Packets sent, terminator included.
    pub packets: u64,
    pub bytes: u64,
}

/// Send `path` over `channel` as a sequence of `FILE` packets, ending with the terminator.
/// Stops at the first read or send error; packets already sent are not recalled.
pub async fn send_file(
    channel: &dyn Channel,
    sender: &PeerIdentity,
    path: &Path,
    packet_size: usize,
) -> Result<SendSummary, TransferError> {
    let packet_size = effective_packet_size(packet_size);
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?;
    let mut file = File::open(path).await.map_err(io_err(path))?;
    let size = file.metadata().await.map_err(io_err(path))?.len();
    let total = total_packets(size, packet_size);
    info!(file = %filename, size, total, "sending file");

    let mut buf = vec![0u8; packet_size];
    let mut sequence = 0u64;
    let mut bytes = 0u64;
    loop {
        let n = read_full(&mut file, &mut buf).await.map_err(io_err(path))?;
        sequence += 1;
        let (payload_size, content) = if n == 0 {
            (TERMINATOR_PAYLOAD_SIZE, Vec::new())
        } else {
            (n as i64, buf[..n].to_vec())
        };
        let packet = FilePacket {
            from: sender.clone(),
            filename: filename.clone(),
            total_packets: total,
            payload_size,
            sequence,
            content,
        };
        channel
            .send(&packet.to_message())
            .await
            .map_err(TransferError::Channel)?;
        debug!(file = %filename, sequence, payload_size, "packet sent");
        if n == 0 {
            break;
        }
        bytes += n as u64;
    }
    Ok(SendSummary {
        packets: sequence,
        bytes,
    })
}

/// A completely received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub from: PeerIdentity,
    /// Name as given by the sender.
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
    /// Packets written, terminator included.
    pub packets: u64,
}

struct Incoming {
    sender_id: PeerId,
    file: File,
    path: PathBuf,
    /// End offset of each data packet written, by sequence number.
    ends: BTreeMap<u64, u64>,
    terminator: Option<u64>,
    last_activity: Instant,
}

impl Incoming {
    /// Terminator seen at `t` and every sequence before it written.
    fn is_complete(&self) -> bool {
        match self.terminator {
            Some(t) => (1..t).all(|s| self.ends.contains_key(&s)),
            None => false,
        }
    }

    /// Exact file length for terminator `t`. Sequences at or past `t` belong to an older
    /// transfer under the same name and are ignored.
    fn length(&self, t: u64) -> u64 {
        if t <= 1 {
            return 0;
        }
        self.ends.get(&(t - 1)).copied().unwrap_or(0)
    }
}

/// Transfers with no packet for this long are abandoned.
pub const DEFAULT_TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Incomplete transfers kept at once; the least recently active is abandoned beyond this.
pub const DEFAULT_MAX_PENDING_TRANSFERS: usize = 64;

/// Reassembles incoming transfers, one per (sender name, file name).
pub struct FileReceiver {
    dir: PathBuf,
    packet_size: usize,
    idle_timeout: Duration,
    max_pending: usize,
    transfers: HashMap<(String, String), Incoming>,
}

impl FileReceiver {
    pub fn new(dir: impl Into<PathBuf>, packet_size: usize) -> Self {
        Self {
            dir: dir.into(),
            packet_size: effective_packet_size(packet_size),
            idle_timeout: DEFAULT_TRANSFER_IDLE_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING_TRANSFERS,
            transfers: HashMap::new(),
        }
    }

    /// Override how long an idle transfer is kept and how many may be pending.
    pub fn with_limits(mut self, idle_timeout: Duration, max_pending: usize) -> Self {
        self.idle_timeout = idle_timeout;
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Transfers that have started but not completed.
    pub fn in_progress(&self) -> usize {
        self.transfers.len()
    }

    /// Drop idle transfers, then make room for one more if at capacity. Dropping an entry
    /// closes its file; whatever was written stays on disk.
    fn evict(&mut self, incoming_key: &(String, String)) {
        let idle = self.idle_timeout;
        self.transfers.retain(|(from, name), t| {
            let keep = t.last_activity.elapsed() < idle;
            if !keep {
                warn!(file = %name, from = %from, "abandoning idle transfer");
            }
            keep
        });
        if self.transfers.contains_key(incoming_key) || self.transfers.len() < self.max_pending {
            return;
        }
        let oldest = self
            .transfers
            .iter()
            .min_by_key(|(_, t)| t.last_activity)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            warn!(file = %key.1, from = %key.0, "too many pending transfers; abandoning oldest");
            self.transfers.remove(&key);
        }
    }

    /// Write one packet. Returns the finished file once the terminator and every data packet
    /// before it have arrived, in whatever order.
    pub async fn receive(
        &mut self,
        packet: FilePacket,
    ) -> Result<Option<ReceivedFile>, TransferError> {
        let key = (packet.from.name.clone(), packet.filename.clone());
        let path = destination_path(&self.dir, &packet.filename)?;
        if packet.sequence == 0 {
            return Err(TransferError::Malformed(MessageError::InvalidField {
                field: field::PACKET_SEQUENCE_NUMBER,
                value: "0".into(),
            }));
        }
        let span = if packet.is_terminator() {
            None
        } else {
            Some(packet_span(&packet, self.packet_size)?)
        };
        self.evict(&key);
        let incoming = match self.transfers.entry(key.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .await
                    .map_err(io_err(&path))?;
                debug!(file = %packet.filename, path = %path.display(), "receiving file");
                v.insert(Incoming {
                    sender_id: packet.from.id.clone(),
                    file,
                    path,
                    ends: BTreeMap::new(),
                    terminator: None,
                    last_activity: Instant::now(),
                })
            }
        };
        incoming.last_activity = Instant::now();

        debug!(
            file = %packet.filename,
            sequence = packet.sequence,
            total = packet.total_packets,
            from = %packet.from.name,
            "file packet"
        );
        match span {
            None => incoming.terminator = Some(packet.sequence),
            Some((offset, end)) => {
                let size = (end - offset) as usize;
                incoming
                    .file
                    .seek(SeekFrom::Start(offset))
                    .await
                    .map_err(io_err(&incoming.path))?;
                incoming
                    .file
                    .write_all(&packet.content[..size])
                    .await
                    .map_err(io_err(&incoming.path))?;
                incoming.ends.insert(packet.sequence, end);
            }
        }

        if !incoming.is_complete() {
            return Ok(None);
        }
        let Some(mut done) = self.transfers.remove(&key) else {
            return Ok(None);
        };
        let t = done.terminator.unwrap_or(1);
        let length = done.length(t);
        // Drop whatever an older, longer file with the same name left past the end.
        done.file
            .set_len(length)
            .await
            .map_err(io_err(&done.path))?;
        done.file.flush().await.map_err(io_err(&done.path))?;
        let received = ReceivedFile {
            from: PeerIdentity::new(done.sender_id, key.0),
            filename: key.1,
            path: done.path,
            bytes: length,
            packets: t,
        };
        info!(
            file = %received.filename,
            bytes = received.bytes,
            from = %received.from.name,
            "file received"
        );
        Ok(Some(received))
    }
}

/// Byte range `[offset, end)` a data packet covers. A range that does not fit in a file offset,
/// or a size the content cannot back, is malformed.
fn packet_span(packet: &FilePacket, packet_size: usize) -> Result<(u64, u64), TransferError> {
    let invalid = |field: &'static str, value: String| {
        TransferError::Malformed(MessageError::InvalidField { field, value })
    };
    let size = u64::try_from(packet.payload_size)
        .ok()
        .filter(|&size| size <= packet.content.len() as u64)
        .ok_or_else(|| invalid(field::PACKET_PAYLOAD_SIZE, packet.payload_size.to_string()))?;
    packet
        .sequence
        .checked_sub(1)
        .and_then(|index| index.checked_mul(packet_size as u64))
        .and_then(|offset| Some((offset, offset.checked_add(size)?)))
        .filter(|&(_, end)| end <= i64::MAX as u64)
        .ok_or_else(|| invalid(field::PACKET_SEQUENCE_NUMBER, packet.sequence.to_string()))
}
