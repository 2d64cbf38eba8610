//! Inbound message routing by `Type`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::observer::Observer;
use crate::protocol::{Message, MessageError, MessageType, TextMessage};
use crate::registry::{HistoryEntry, PeerRegistry};
use crate::transfer::{FilePacket, FileReceiver};

/// Depth of the queue between the router and the file-receive worker.
pub const FILE_QUEUE_DEPTH: usize = 64;

/// What the router did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Text(TextMessage),
    File { filename: String, sequence: u64 },
    Dropped(MessageError),
}

/// Dispatches each inbound message to the text handler or the file-receive worker. Unknown or
/// malformed messages are logged and dropped; nothing is ever reported back to the sender.
pub struct Router {
    registry: Arc<PeerRegistry>,
    files: mpsc::Sender<FilePacket>,
}

impl Router {
    pub fn new(registry: Arc<PeerRegistry>, files: mpsc::Sender<FilePacket>) -> Self {
        Self { registry, files }
    }

    pub async fn route(&self, msg: Message) -> Routed {
        let kind = match msg.kind() {
            Ok(kind) => kind,
            Err(e) => return dropped(e),
        };
        match kind {
            MessageType::Text => match TextMessage::from_message(&msg) {
                Ok(text) => {
                    self.on_text(&text);
                    Routed::Text(text)
                }
                Err(e) => dropped(e),
            },
            MessageType::File => match FilePacket::from_message(&msg) {
                Ok(packet) => {
                    let routed = Routed::File {
                        filename: packet.filename.clone(),
                        sequence: packet.sequence,
                    };
                    if self.files.send(packet).await.is_err() {
                        warn!("file worker gone; packet dropped");
                    }
                    routed
                }
                Err(e) => dropped(e),
            },
        }
    }

    fn on_text(&self, text: &TextMessage) {
        debug!(from = %text.from.name, id = %text.from.id, "text message");
        let entry = HistoryEntry::incoming(text.from.name.as_str(), text.text.as_str());
        if !self.registry.add_history(&text.from.name, entry) {
            warn!(from = %text.from.name, "text from a peer not in the registry; not kept");
        }
    }
}

fn dropped(e: MessageError) -> Routed {
    warn!(error = %e, "dropping inbound message");
    Routed::Dropped(e)
}

/// Drain file packets off the receiving context. Write errors drop the packet and leave the
/// destination partially written; the worker carries on with the next packet.
pub async fn run_file_worker(
    mut receiver: FileReceiver,
    mut packets: mpsc::Receiver<FilePacket>,
    registry: Arc<PeerRegistry>,
    observer: Arc<dyn Observer>,
) {
    while let Some(packet) = packets.recv().await {
        let filename = packet.filename.clone();
        let sequence = packet.sequence;
        match receiver.receive(packet).await {
            Ok(Some(done)) => {
                let entry = HistoryEntry::incoming(
                    done.from.name.as_str(),
                    format!("Receive file {}", done.filename),
                );
                registry.add_history(&done.from.name, entry);
                observer.transfer_completed(&done);
            }
            Ok(None) => {}
            Err(e) => warn!(file = %filename, sequence, error = %e, "file packet dropped"),
        }
    }
    debug!(pending = receiver.in_progress(), "file worker stopped");
}
