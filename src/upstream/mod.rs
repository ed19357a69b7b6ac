pub mod backoff;
pub mod connector;
pub mod session;

pub use backoff::ReconnectBackoff;
pub use connector::{UpstreamConnector, UpstreamFrame, UpstreamLink, WebSocketConnector};
pub use session::{SessionState, UpstreamSession};
