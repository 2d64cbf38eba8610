//! Line-oriented console front-end on stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;

use peerlink_core::{Direction, HistoryEntry, Observer, PeerRecord, ReceivedFile, Session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const HELP: &str = "commands: peers | send <name> <text> | file <name> <path> | history <name> | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    Send { peer: String, text: String },
    File { peer: String, path: PathBuf },
    History { peer: String },
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };
    let (peer, arg) = match rest.split_once(char::is_whitespace) {
        Some((p, a)) => (p.to_string(), a.trim().to_string()),
        None => (rest.to_string(), String::new()),
    };
    let cmd = match verb {
        "peers" => Command::Peers,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "history" if !peer.is_empty() => Command::History { peer },
        "send" if !peer.is_empty() && !arg.is_empty() => Command::Send { peer, text: arg },
        "file" if !peer.is_empty() && !arg.is_empty() => Command::File {
            peer,
            path: PathBuf::from(arg),
        },
        "history" | "send" | "file" => return Err(format!("missing arguments; {HELP}")),
        other => return Err(format!("unknown command {other:?}; {HELP}")),
    };
    Ok(Some(cmd))
}

fn format_entry(e: &HistoryEntry) -> String {
    let arrow = match e.direction {
        Direction::Incoming => "<-",
        Direction::Outgoing => "->",
    };
    format!("{} {arrow} {}: {}", e.timestamp_ms, e.author, e.text)
}

/// Run console commands until `quit` or `cancel`. End of input leaves the session running.
pub async fn run(session: Arc<Session>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{} ready; {HELP}", session.identity().name);
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            l = lines.next_line() => match l {
                Ok(Some(l)) => l,
                Ok(None) | Err(_) => {
                    debug!("console input closed");
                    break;
                }
            },
        };
        let cmd = match parse(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(msg) => {
                println!("{msg}");
                continue;
            }
        };
        match cmd {
            Command::Peers => {
                let peers = session.peers();
                if peers.is_empty() {
                    println!("no peers yet");
                }
                for p in peers {
                    let endpoint = &p.endpoint.locator;
                    match &p.description {
                        Some(d) => println!("{} ({d}) at {endpoint}", p.name()),
                        None => println!("{} at {endpoint}", p.name()),
                    }
                }
            }
            Command::Send { peer, text } => {
                if !session.send_text_to_peer(&peer, &text).await {
                    println!("could not send to {peer}");
                }
            }
            Command::File { peer, path } => {
                let session = session.clone();
                // Transfers run off the prompt.
                tokio::spawn(async move {
                    if session.send_file_to_peer(&peer, &path).await {
                        println!("sent {} to {peer}", path.display());
                    } else {
                        println!("could not send {} to {peer}", path.display());
                    }
                });
            }
            Command::History { peer } => match session.registry().history(&peer) {
                Some(h) => h.iter().for_each(|e| println!("{}", format_entry(e))),
                None => println!("unknown peer {peer}"),
            },
            Command::Help => println!("{HELP}"),
            Command::Quit => {
                cancel.cancel();
                break;
            }
        }
    }
}

/// Prints what arrives.
pub struct ConsoleObserver;

impl Observer for ConsoleObserver {
    fn registry_changed(&self, peers: &[PeerRecord]) {
        let names: Vec<&str> = peers.iter().map(PeerRecord::name).collect();
        println!("peers: {}", names.join(", "));
    }

    fn history_changed(&self, _peer: &str, history: &[HistoryEntry]) {
        if let Some(last) = history.last().filter(|e| e.direction == Direction::Incoming) {
            println!("{}", format_entry(last));
        }
    }

    fn transfer_completed(&self, file: &ReceivedFile) {
        println!(
            "received {} from {} ({} bytes) -> {}",
            file.filename,
            file.from.name,
            file.bytes,
            file.path.display()
        );
    }
}
