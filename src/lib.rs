pub mod audio;
pub mod catalog;
pub mod config;
pub mod error;
pub mod instructions;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod tools;
pub mod transport;

pub use error::{Result, SessionError};
pub use session::{SessionComponents, SessionManager, SessionState};
