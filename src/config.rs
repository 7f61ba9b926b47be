use std::{fs::read_to_string, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use service::Options;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// websocket server listen
    ///
    /// The address and port the websocket server is bound to, ipv4 and ipv6
    /// are both supported.
    ///
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
    ///
    /// Maximum number of concurrent sessions.
    ///
    /// Connections beyond this are refused, unless the network link was
    /// reported lost, in which case the oldest session is dropped.
    ///
    #[serde(default = "Server::max_sessions")]
    pub max_sessions: usize,
    ///
    /// Poll interval in milliseconds
    ///
    /// How often every session gets its outbound buffer drained and its
    /// liveness checked.
    ///
    #[serde(default = "Server::poll_interval")]
    pub poll_interval: u64,
}

impl Server {
    fn listen() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 81))
    }

    fn max_sessions() -> usize {
        4
    }

    fn poll_interval() -> u64 {
        10
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            max_sessions: Self::max_sessions(),
            poll_interval: Self::poll_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Session {
    ///
    /// Inbound character buffer size, rounded up to a power of two.
    ///
    #[serde(default = "Session::rx_buffer_size")]
    pub rx_buffer_size: usize,
    ///
    /// Outbound character buffer size, rounded up to a power of two.
    ///
    #[serde(default = "Session::tx_buffer_size")]
    pub tx_buffer_size: usize,
    ///
    /// Largest payload of a frame built from the outbound buffer.
    ///
    #[serde(default = "Session::max_frame_size")]
    pub max_frame_size: usize,
    ///
    /// Largest accepted upgrade request head in bytes.
    ///
    #[serde(default = "Session::max_request_size")]
    pub max_request_size: usize,
    ///
    /// Largest message handed to a frame handler, over all of its
    /// fragments.
    ///
    #[serde(default = "Session::max_message_size")]
    pub max_message_size: usize,
    ///
    /// Ping interval in milliseconds
    ///
    /// A ping is sent after this much time without outgoing traffic.
    ///
    #[serde(default = "Session::ping_interval")]
    pub ping_interval: u64,
    ///
    /// Unanswered pings after which the session is closed.
    ///
    #[serde(default = "Session::max_unanswered_pings")]
    pub max_unanswered_pings: u32,
    ///
    /// Idle poll ticks
    ///
    /// If nothing is received or acknowledged for this many polls the
    /// connection is aborted. 0 disables the check.
    ///
    #[serde(default)]
    pub max_idle_ticks: u32,
}

impl Session {
    fn rx_buffer_size() -> usize {
        1024
    }

    fn tx_buffer_size() -> usize {
        1024
    }

    fn max_frame_size() -> usize {
        1460
    }

    fn max_request_size() -> usize {
        codec::handshake::MAX_REQUEST_SIZE
    }

    fn max_message_size() -> usize {
        codec::frame::MAX_PAYLOAD_SIZE * 4
    }

    fn ping_interval() -> u64 {
        3000
    }

    fn max_unanswered_pings() -> u32 {
        4
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            rx_buffer_size: Self::rx_buffer_size(),
            tx_buffer_size: Self::tx_buffer_size(),
            max_frame_size: Self::max_frame_size(),
            max_request_size: Self::max_request_size(),
            max_message_size: Self::max_message_size(),
            ping_interval: Self::ping_interval(),
            max_unanswered_pings: Self::max_unanswered_pings(),
            max_idle_ticks: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: websocketd --config /etc/websocketd/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is specified,
    /// the configuration is read from the configuration file, otherwise the
    /// default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        match Cli::parse().config {
            Some(path) => Self::from_toml(&read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str::<Self>(text)?)
    }

    /// Session pool options for the service crate.
    pub fn options(&self) -> Options {
        Options {
            max_sessions: self.server.max_sessions,
            rx_buffer_size: self.session.rx_buffer_size,
            tx_buffer_size: self.session.tx_buffer_size,
            max_frame_size: self.session.max_frame_size.clamp(1, codec::frame::MAX_PAYLOAD_SIZE),
            max_request_size: self.session.max_request_size,
            max_message_size: self.session.max_message_size,
            ping_interval: Duration::from_millis(self.session.ping_interval),
            max_unanswered_pings: self.session.max_unanswered_pings,
            max_idle_ticks: self.session.max_idle_ticks,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.server.poll_interval.max(1))
    }
}
