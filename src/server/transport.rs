use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use service::{SessionId, Transport, TransportError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{
        Semaphore,
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    },
    task::JoinHandle,
};

use super::Event;

/// Size of a single socket read.
pub const READ_BUFFER_SIZE: usize = 1460;

/// Bytes handed to the driver but not yet processed by it. The socket is
/// not read while the window is used up.
pub const RECEIVE_WINDOW: usize = READ_BUFFER_SIZE * 4;

/// Bytes queued for writing but not yet written to the socket.
pub const SEND_WINDOW: usize = 16 * 1024;

enum Command {
    Data(Bytes),
    Close,
    Abort,
}

/// The tokio side of a session transport.
///
/// The driver owns this half and never waits on it: data is handed to a
/// writer task through a channel, and the send window is the part of
/// [`SEND_WINDOW`] not taken by writes still in flight.
pub struct TcpTransport {
    commands: UnboundedSender<Command>,
    inflight: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
}

impl Transport for TcpTransport {
    fn send_capacity(&self) -> usize {
        SEND_WINDOW.saturating_sub(self.inflight.load(Ordering::Relaxed))
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > self.send_capacity() {
            return Err(TransportError::WouldBlock);
        }

        self.inflight.fetch_add(bytes.len(), Ordering::Relaxed);
        self.commands
            .send(Command::Data(Bytes::copy_from_slice(bytes)))
            .map_err(|_| TransportError::Closed)
    }

    fn received(&mut self, len: usize) {
        self.permits.add_permits(len);
    }

    fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
    }

    fn abort(&mut self) {
        let _ = self.commands.send(Command::Abort);
    }
}

/// The task side of a [`TcpTransport`], waiting for its session id.
pub struct Connection {
    socket: TcpStream,
    commands: UnboundedReceiver<Command>,
    inflight: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
}

pub fn pair(socket: TcpStream) -> (TcpTransport, Connection) {
    let (sender, receiver) = unbounded_channel();
    let inflight = Arc::new(AtomicUsize::new(0));
    let permits = Arc::new(Semaphore::new(RECEIVE_WINDOW));

    (
        TcpTransport {
            inflight: inflight.clone(),
            permits: permits.clone(),
            commands: sender,
        },
        Connection {
            commands: receiver,
            inflight,
            permits,
            socket,
        },
    )
}

impl Connection {
    /// Spawn the reader and writer tasks of an accepted session.
    pub fn spawn(self, id: SessionId, events: UnboundedSender<Event>) {
        let (reader, writer) = self.socket.into_split();

        let reader = tokio::spawn(read_loop(id, reader, self.permits, events.clone()));
        tokio::spawn(write_loop(
            id,
            writer,
            self.commands,
            self.inflight,
            events,
            reader,
        ));
    }
}

async fn read_loop(
    id: SessionId,
    mut reader: OwnedReadHalf,
    permits: Arc<Semaphore>,
    events: UnboundedSender<Event>,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        // Wait until the driver has made room for a full read.
        let Ok(permit) = permits.acquire_many(READ_BUFFER_SIZE as u32).await else {
            break;
        };

        permit.forget();

        let size = match reader.read(&mut buffer).await {
            Ok(size) => size,
            Err(e) => {
                log::debug!("tcp socket read failed: id={id}, err={e}");

                0
            }
        };

        permits.add_permits(READ_BUFFER_SIZE - size);

        // When the received message is 0, it means that the socket has been
        // closed.
        if size == 0 {
            let _ = events.send(Event::Received(id, None));
            break;
        }

        let chunk = Bytes::copy_from_slice(&buffer[..size]);
        if events.send(Event::Received(id, Some(chunk))).is_err() {
            break;
        }
    }
}

async fn write_loop(
    id: SessionId,
    mut writer: OwnedWriteHalf,
    mut commands: UnboundedReceiver<Command>,
    inflight: Arc<AtomicUsize>,
    events: UnboundedSender<Event>,
    reader: JoinHandle<()>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Data(bytes) => {
                let result = writer.write_all(&bytes).await;
                inflight.fetch_sub(bytes.len(), Ordering::Relaxed);

                if let Err(e) = result {
                    log::debug!("tcp socket write failed: id={id}, err={e}");

                    let _ = events.send(Event::Received(id, None));
                    break;
                }

                let _ = events.send(Event::Sent(id));
            }
            Command::Close => {
                let _ = writer.shutdown().await;
                break;
            }
            Command::Abort => break,
        }
    }

    reader.abort();
}
