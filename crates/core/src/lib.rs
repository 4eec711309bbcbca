pub mod accounting;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod negotiator;
pub mod protocol;
pub mod reconnect;
pub mod stability;
pub mod status;

pub use config::{ConfigError, ControllerConfig};
pub use controller::{SessionHandle, VoiceSessionController};
pub use error::{DeviceError, SessionError};
pub use model::{ConnectionState, EndReason, SessionContext, UsageRecord};
pub use protocol::SessionUpdate;
