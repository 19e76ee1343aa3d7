//! Resilient control channel between a UI process and a remote
//! browser-automation agent.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod connection;
pub mod connector;
pub mod dispatch;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bridge::{AgentBridge, BridgeError, TransportBridge};
pub use channel::{ControlChannel, LinkStatus, OverlaySink};
pub use config::{ChannelConfig, ConfigError};
pub use connection::{BackoffPolicy, Connection, ConnectionState, Recovery};
pub use connector::{connector_for, ConnectError, Connector, Socket, WsConnector};
#[cfg(unix)]
pub use connector::UnixConnector;
pub use dispatch::{DispatchReport, Dispatcher, SubscriptionId, Topic};
pub use session::{SessionController, SessionSnapshot, SessionState, StopOutcome};
pub use transport::{Transport, TransportEvent, TransportOptions};
