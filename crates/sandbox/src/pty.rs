//! PTY allocation for non-sandbox PTY execs (spec §4.F step 9): a 120x30
//! pseudo-terminal with DSR (`ESC [ 6 n`, cursor-position-request)
//! interception that replies with a synthesized position rather than
//! hanging on a real terminal that isn't there.
//!
//! Grounded on `portable_pty`'s native-pty-system + blocking-reader-thread
//! pattern, the same shape the pack's own host-terminal code uses (e.g.
//! `moltis::gateway::server::spawn_host_terminal_runtime` /
//! `spawn_host_terminal_reader`). The teacher has no PTY path of its own
//! (see DESIGN.md), so this is learned from the wider pack rather than
//! generalized from teacher code.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use tokio::sync::mpsc;

pub const PTY_ROWS: u16 = 30;
pub const PTY_COLS: u16 = 120;

const DSR_REQUEST: &[u8] = b"\x1b[6n";
/// Synthesized cursor position reported back for a DSR request — there is
/// no real terminal behind this pty to query, so row/col are fixed.
const DSR_REPLY_ROW: u16 = 1;
const DSR_REPLY_COL: u16 = 1;

pub struct PtyHandle {
    pub child: Box<dyn Child + Send + Sync>,
    /// Stdin bytes and synthesized DSR replies are serialized through a
    /// single writer-owning thread, so both share this channel.
    pub input_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// DSR-filtered output bytes, ready to append to the session's
    /// aggregated/tail buffer.
    pub output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Allocate a pty and spawn `sh -c <command>` inside it (spec §4.F step
/// 9). Returns `Err` with a user-visible reason on allocation/spawn
/// failure; callers fall back to the plain-pipe path.
pub fn spawn(command: &str, cwd: Option<&Path>, env: &HashMap<String, String>) -> Result<PtyHandle, String> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: PTY_ROWS,
            cols: PTY_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| format!("failed to allocate pty: {e}"))?;

    let mut builder = CommandBuilder::new("sh");
    builder.arg("-c");
    builder.arg(command);
    if let Some(dir) = cwd {
        builder.cwd(dir);
    }
    for (k, v) in env {
        builder.env(k, v);
    }
    if !env.contains_key("TERM") {
        builder.env("TERM", "xterm-256color");
    }

    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| format!("failed to spawn in pty: {e}"))?;
    drop(pair.slave);

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| format!("failed to open pty writer: {e}"))?;
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| format!("failed to open pty reader: {e}"))?;

    let (input_tx, input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    spawn_writer_thread(writer, input_rx);

    let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    spawn_reader_thread(reader, output_tx, input_tx.clone());

    Ok(PtyHandle {
        child,
        input_tx,
        output_rx,
    })
}

fn spawn_writer_thread(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    std::thread::spawn(move || {
        while let Some(bytes) = input_rx.blocking_recv() {
            if writer.write_all(&bytes).is_err() {
                break;
            }
            if writer.flush().is_err() {
                break;
            }
        }
    });
}

fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    dsr_reply_tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        let mut pending = Vec::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    if !pending.is_empty() {
                        let _ = output_tx.send(std::mem::take(&mut pending));
                    }
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let filtered = filter_dsr(&mut pending, &dsr_reply_tx);
                    if !filtered.is_empty() && output_tx.send(filtered).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

/// Scans `pending` for DSR requests, replying to each via `reply_tx` and
/// stripping them from the stream. Bytes that could be the start of a
/// split DSR sequence are held back in `pending` until more data (or EOF)
/// resolves them.
fn filter_dsr(pending: &mut Vec<u8>, reply_tx: &mpsc::UnboundedSender<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::with_capacity(pending.len());
    let mut i = 0;
    while i < pending.len() {
        if pending[i..].starts_with(DSR_REQUEST) {
            let reply = format!("\x1b[{DSR_REPLY_ROW};{DSR_REPLY_COL}R");
            let _ = reply_tx.send(reply.into_bytes());
            i += DSR_REQUEST.len();
            continue;
        }
        let remaining = &pending[i..];
        if remaining.len() < DSR_REQUEST.len() && DSR_REQUEST.starts_with(remaining) {
            break;
        }
        out.push(pending[i]);
        i += 1;
    }
    pending.drain(..i);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_dsr_strips_complete_request_and_replies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = b"hello\x1b[6nworld".to_vec();
        let out = filter_dsr(&mut pending, &tx);
        assert_eq!(out, b"helloworld");
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply, format!("\x1b[{DSR_REPLY_ROW};{DSR_REPLY_COL}R").into_bytes());
    }

    #[test]
    fn filter_dsr_holds_back_split_sequence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = b"abc\x1b[6".to_vec();
        let out = filter_dsr(&mut pending, &tx);
        assert_eq!(out, b"abc");
        assert_eq!(pending, b"\x1b[6");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn filter_dsr_passes_through_plain_text() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pending = b"no escapes here".to_vec();
        let out = filter_dsr(&mut pending, &tx);
        assert_eq!(out, b"no escapes here");
        assert!(pending.is_empty());
    }
}
