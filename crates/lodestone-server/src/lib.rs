pub mod auth;
pub mod config;
pub mod driver;
pub mod event_loop;
pub mod listener;
pub mod login;
pub mod manager;
pub mod player;
pub mod session;
pub mod status;

pub use config::{OnlineMode, ServerConfig, TransportBackend};
pub use listener::{NoopListener, SessionListener};
pub use manager::{ConnectionManager, ServerContext};
pub use session::{broadcast, CloseReason, Session, SessionId};
