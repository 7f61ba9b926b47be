pub mod transport;

use self::transport::{TcpTransport, pair};
use crate::{config::Config, console::Console};

use std::{future::Future, sync::Arc, time::Instant};

use anyhow::Result;
use bytes::Bytes;
use service::{Server, SessionId};
use tokio::{
    net::TcpListener,
    sync::mpsc::{UnboundedSender, unbounded_channel},
    time::{MissedTickBehavior, interval},
};

/// What the connection tasks report to the driver.
pub enum Event {
    /// Bytes from the peer, `None` when the connection is gone.
    Received(SessionId, Option<Bytes>),
    /// A queued write reached the socket.
    Sent(SessionId),
}

pub type WebSocketServer = Server<TcpTransport, Console>;

/// Run the websocket server on an already bound listener until `shutdown`
/// completes, then abort every session.
///
/// All sessions live in a single driver task: socket reads and write
/// completions arrive as [`Event`]s, and a ticker calls [`Server::poll`]
/// and lets the console answer its sessions.
pub async fn run<F>(listener: TcpListener, config: Arc<Config>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let local_addr = listener.local_addr()?;
    let (sender, mut receiver) = unbounded_channel::<Event>();

    let mut server: WebSocketServer = Server::new(config.options(), Console::default());

    let mut ticker = interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    log::info!(
        "websocket server listening: listen={local_addr}, sessions={}",
        config.server.max_sessions
    );

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, address) = accepted?;
                accept(&mut server, &sender, socket, address);
            }
            Some(event) = receiver.recv() => {
                match event {
                    Event::Received(id, chunk) => {
                        if let Err(e) = server.on_receive(id, chunk) {
                            log::debug!("receive dropped: id={id}, err={e}");
                        }
                    }
                    Event::Sent(id) => server.on_sent(id),
                }
            }
            _ = ticker.tick() => {
                server.poll(Instant::now());
                server.handler().poll();
            }
            _ = &mut shutdown => {
                log::info!("websocket server stopping: listen={local_addr}");

                server.stop();
                break;
            }
        }
    }

    Ok(())
}

fn accept(
    server: &mut WebSocketServer,
    events: &UnboundedSender<Event>,
    socket: tokio::net::TcpStream,
    address: std::net::SocketAddr,
) {
    // Disable the Nagle algorithm, single status lines should go out as
    // soon as they are framed.
    if let Err(e) = socket.set_nodelay(true) {
        log::error!("tcp socket set nodelay failed!: addr={address}, err={e}");
    }

    let (transport, connection) = pair(socket);
    match server.accept(transport) {
        Ok(id) => {
            log::info!("tcp socket accept: id={id}, addr={address:?}");

            connection.spawn(id, events.clone());
        }
        Err(e) => {
            log::warn!("tcp socket refused: addr={address:?}, err={e}");
        }
    }
}

/// Bind the configured address and serve until ctrl-c.
pub async fn start_server(config: Arc<Config>) -> Result<()> {
    let listener = TcpListener::bind(config.server.listen).await?;

    run(listener, config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for shutdown signal: err={e}");
        }
    })
    .await
}
