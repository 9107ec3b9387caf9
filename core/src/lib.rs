pub mod auth;
pub mod channel;
pub mod chat;
pub mod client;
pub mod config;
pub mod connector;
pub mod models;
pub mod protocol;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use auth::{AuthCoordinator, AuthStatus, Session, SignOutReason};
pub use channel::{
    ChannelError, ChannelStatus, ConnectionId, ConnectionState, RealtimeChannel, WeakChannel,
};
pub use chat::ChatStore;
pub use client::{CampusClient, ClientError};
pub use config::{ClientConfig, ConfigError};
pub use connector::{Connector, MemoryConnector, MemoryPeer, WsConnector};
pub use models::{AvailableUser, ChatUser, ConversationSummary, Message, UserProfile};
pub use store::SessionStore;
pub use transport::{ApiRequest, ApiResponse, SessionTransport, TransportError};
