pub mod coordinator;
pub mod error;
pub mod reader;
pub mod session;
pub mod state;
pub mod writer;

pub use error::SessionError;
pub use session::{ConnectOptions, Session, SessionConfig, SharedSession};
pub use state::StateMirror;
