use ahash::AHashMap;
use parking_lot::Mutex;
use service::{SessionContext, SessionHandler, SessionId, Stream, ring::CAN};

/// Longest command line, longer input is cut off.
pub const MAX_LINE_SIZE: usize = 256;

/// Realtime status query, answered ahead of any queued line.
pub const STATUS_REPORT: u8 = b'?';

struct Line {
    stream: Stream,
    buffer: Vec<u8>,
}

/// A line oriented command console on top of the session streams.
///
/// Complete lines are acknowledged with `ok`, a `?` is answered with a
/// status report as soon as it arrives and a cancel character drops
/// whatever input is still queued.
#[derive(Default)]
pub struct Console {
    lines: Mutex<AHashMap<SessionId, Line>>,
}

impl Console {
    /// Number of attached sessions.
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Consume the input of every attached session and answer each complete
    /// line.
    pub fn poll(&self) {
        for (id, line) in self.lines.lock().iter_mut() {
            while let Some(byte) = line.stream.read_byte() {
                match byte {
                    b'\r' | b'\n' => {
                        if line.buffer.is_empty() {
                            continue;
                        }

                        log::debug!(
                            "console line: id={id}, line={}",
                            String::from_utf8_lossy(&line.buffer)
                        );

                        line.buffer.clear();
                        line.stream.write_str("ok\r\n");
                    }
                    CAN => line.buffer.clear(),
                    byte => {
                        if line.buffer.len() < MAX_LINE_SIZE {
                            line.buffer.push(byte);
                        }
                    }
                }
            }
        }
    }
}

impl SessionHandler for Console {
    fn on_client_connect(&self, ctx: &mut SessionContext<'_>) {
        let stream = ctx.stream().clone();

        let realtime = stream.clone();
        stream.set_realtime_handler(Some(Box::new(move |byte| match byte {
            STATUS_REPORT => {
                realtime.write_str("<Idle>\r\n");
                true
            }
            CAN => {
                realtime.cancel_read_buffer();
                true
            }
            _ => false,
        })));

        log::info!(
            "console attach: id={}, protocol={:?}, binary={}",
            ctx.id,
            ctx.protocol,
            ctx.binary
        );

        self.lines.lock().insert(
            ctx.id,
            Line {
                buffer: Vec::with_capacity(MAX_LINE_SIZE),
                stream,
            },
        );
    }

    fn on_client_disconnect(&self, id: SessionId) {
        if self.lines.lock().remove(&id).is_some() {
            log::info!("console detach: id={id}");
        }
    }
}
