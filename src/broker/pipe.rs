//! Streaming pipe adapter.
//!
//! Forwards a running execution's output to the event stream. Streamed
//! handles are forwarded chunk by chunk through an incremental UTF-8
//! decoder; buffered handles produce at most one `Stdout` and one `Stderr`
//! at completion. The terminal event is never emitted from here: the pump
//! reports how the execution ended and its caller (the scheduler, on the
//! same task) claims the registry entry and emits it, so no output for the
//! id can land after the terminal.

use tokio::sync::mpsc;

use crate::protocol::Event;
use crate::sandbox::ExecOutput;

/// How an execution's output pump ended.
#[derive(Debug, PartialEq)]
pub enum PumpEnd {
    /// All output forwarded, process exited with this code.
    Complete(i32),
    /// The producer vanished without reporting an exit code.
    Broken(String),
}

/// Incremental UTF-8 decoder. Multi-byte sequences split across chunk
/// boundaries are buffered until complete; invalid bytes decode to U+FFFD.
#[derive(Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `carry + chunk` as possible, keeping at most an
    /// incomplete trailing sequence for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.carry.extend_from_slice(chunk);
        let mut decoded = String::new();
        let mut rest = self.carry.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid_len = e.valid_up_to();
                    // Safe: from_utf8 just validated this prefix.
                    decoded.push_str(std::str::from_utf8(&rest[..valid_len]).unwrap_or(""));
                    match e.error_len() {
                        Some(bad) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_len + bad..];
                        }
                        None => {
                            // Incomplete trailing sequence: keep for later.
                            rest = &rest[valid_len..];
                            break;
                        }
                    }
                }
            }
        }

        self.carry = rest.to_vec();
        decoded
    }

    /// Flushes whatever is still buffered (end of stream); an incomplete
    /// sequence at that point is malformed by definition.
    pub fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            return String::new();
        }
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        text
    }
}

/// Decodes a whole buffer at once (buffered handles).
pub fn decode_all(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Forwards all output for `id`, then reports how the execution ended.
pub async fn pump(id: &str, output: ExecOutput, events: &mpsc::Sender<Event>) -> PumpEnd {
    match output {
        ExecOutput::Streamed {
            mut stdout,
            mut stderr,
            exit,
        } => {
            let mut out_decoder = Utf8Decoder::new();
            let mut err_decoder = Utf8Decoder::new();
            let mut out_open = true;
            let mut err_open = true;

            while out_open || err_open {
                tokio::select! {
                    chunk = stdout.recv(), if out_open => match chunk {
                        Some(bytes) => {
                            let data = out_decoder.push(&bytes);
                            emit_output(id, data, false, events).await;
                        }
                        None => out_open = false,
                    },
                    chunk = stderr.recv(), if err_open => match chunk {
                        Some(bytes) => {
                            let data = err_decoder.push(&bytes);
                            emit_output(id, data, true, events).await;
                        }
                        None => err_open = false,
                    },
                }
            }

            // Flush split sequences left at end of stream.
            emit_output(id, out_decoder.finish(), false, events).await;
            emit_output(id, err_decoder.finish(), true, events).await;

            match exit.await {
                Ok(code) => PumpEnd::Complete(code),
                Err(_) => PumpEnd::Broken("execution ended without an exit code".to_string()),
            }
        }
        ExecOutput::Buffered(done) => match done.await {
            Ok(result) => {
                if !result.stdout.is_empty() {
                    emit_output(id, decode_all(&result.stdout), false, events).await;
                }
                if !result.stderr.is_empty() {
                    emit_output(id, decode_all(&result.stderr), true, events).await;
                }
                PumpEnd::Complete(result.exit_code)
            }
            Err(_) => PumpEnd::Broken("execution ended without a result".to_string()),
        },
    }
}

async fn emit_output(id: &str, data: String, is_stderr: bool, events: &mpsc::Sender<Event>) {
    if data.is_empty() {
        return;
    }
    let event = if is_stderr {
        Event::Stderr {
            id: id.to_string(),
            data,
        }
    } else {
        Event::Stdout {
            id: id.to_string(),
            data,
        }
    };
    let _ = events.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::BufferedResult;
    use tokio::sync::oneshot;

    // ── Utf8Decoder ─────────────────────────────────────

    #[test]
    fn test_decoder_passes_ascii_through() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.push(b"hello"), "hello");
        assert_eq!(d.finish(), "");
    }

    #[test]
    fn test_decoder_buffers_split_multibyte_sequence() {
        // "é" = 0xC3 0xA9, split across two chunks
        let mut d = Utf8Decoder::new();
        assert_eq!(d.push(&[0x63, 0x61, 0x66, 0xC3]), "caf");
        assert_eq!(d.push(&[0xA9]), "é");
    }

    #[test]
    fn test_decoder_buffers_split_four_byte_sequence() {
        // U+1F600 = F0 9F 98 80, one byte per chunk
        let mut d = Utf8Decoder::new();
        assert_eq!(d.push(&[0xF0]), "");
        assert_eq!(d.push(&[0x9F]), "");
        assert_eq!(d.push(&[0x98]), "");
        assert_eq!(d.push(&[0x80]), "😀");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut d = Utf8Decoder::new();
        let out = d.push(&[b'a', 0xFF, b'b']);
        assert_eq!(out, "a\u{FFFD}b");
    }

    #[test]
    fn test_decoder_finish_flushes_truncated_sequence() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.push(&[0xC3]), "");
        assert_eq!(d.finish(), "\u{FFFD}");
    }

    // ── pump ────────────────────────────────────────────

    #[tokio::test]
    async fn test_pump_streams_in_order_then_reports_exit() {
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        out_tx.send(b"first ".to_vec()).unwrap();
        out_tx.send(b"second".to_vec()).unwrap();
        drop(out_tx);
        drop(err_tx);
        exit_tx.send(0).unwrap();

        let end = pump(
            "x",
            ExecOutput::Streamed {
                stdout: out_rx,
                stderr: err_rx,
                exit: exit_rx,
            },
            &events_tx,
        )
        .await;
        assert_eq!(end, PumpEnd::Complete(0));

        let first = events_rx.recv().await.unwrap();
        let second = events_rx.recv().await.unwrap();
        assert_eq!(
            first,
            Event::Stdout {
                id: "x".into(),
                data: "first ".into()
            }
        );
        assert_eq!(
            second,
            Event::Stdout {
                id: "x".into(),
                data: "second".into()
            }
        );
    }

    #[tokio::test]
    async fn test_pump_buffered_emits_at_most_one_event_per_stream() {
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let (done_tx, done_rx) = oneshot::channel();
        done_tx
            .send(BufferedResult {
                stdout: b"all of it".to_vec(),
                stderr: Vec::new(),
                exit_code: 3,
            })
            .unwrap();

        let end = pump("x", ExecOutput::Buffered(done_rx), &events_tx).await;
        assert_eq!(end, PumpEnd::Complete(3));

        let only = events_rx.recv().await.unwrap();
        assert_eq!(
            only,
            Event::Stdout {
                id: "x".into(),
                data: "all of it".into()
            }
        );
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pump_forwards_everything_before_reporting_end() {
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        // Exit code is already resolved while output is still in flight;
        // the pump must drain the channels first.
        exit_tx.send(7).unwrap();
        out_tx.send(b"late chunk".to_vec()).unwrap();
        err_tx.send(b"late err".to_vec()).unwrap();
        drop(out_tx);
        drop(err_tx);

        let end = pump(
            "x",
            ExecOutput::Streamed {
                stdout: out_rx,
                stderr: err_rx,
                exit: exit_rx,
            },
            &events_tx,
        )
        .await;
        assert_eq!(end, PumpEnd::Complete(7));

        let mut saw_stdout = false;
        let mut saw_stderr = false;
        while let Ok(event) = events_rx.try_recv() {
            match event {
                Event::Stdout { data, .. } => {
                    assert_eq!(data, "late chunk");
                    saw_stdout = true;
                }
                Event::Stderr { data, .. } => {
                    assert_eq!(data, "late err");
                    saw_stderr = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_stdout && saw_stderr);
    }

    #[tokio::test]
    async fn test_pump_reports_broken_producer() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel::<BufferedResult>();
        drop(done_tx);

        let end = pump("x", ExecOutput::Buffered(done_rx), &events_tx).await;
        assert!(matches!(end, PumpEnd::Broken(_)));
    }
}
