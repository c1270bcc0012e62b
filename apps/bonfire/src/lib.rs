pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::ChatConfig;
pub use protocol::{ChatMessage, MessageKind, Participant};
pub use session::observers::ObserverHandle;
pub use session::{ChatSession, SessionError, SessionState};
pub use transport::{LoopbackBackend, TransportBackend, TransportError, WebSocketBackend};
