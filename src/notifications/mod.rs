mod backoff;
mod connector;
mod events;
mod feed;
mod protocol;
mod socket;

pub use backoff::ReconnectPolicy;
pub use connector::{SocketConnection, SocketConnector, SocketError, SocketFrame, TungsteniteConnector};
pub use events::{EventKind, EventRegistry, Listener, SocketEvent, Subscription};
pub use feed::NotificationFeed;
pub use protocol::{parse_server_message, ClientMessage, ProtocolError, ServerMessage};
pub use socket::{NotificationSocketClient, SocketSettings};
