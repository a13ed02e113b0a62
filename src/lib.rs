//! # MUSCLE reactor
//!
//! A single-threaded cooperative reactor, a self-describing typed
//! message codec, and the session/factory/policy framework needed to
//! build publish/subscribe and request/response servers over TCP, UDP,
//! and Unix sockets.
//!
//! The hierarchical message-store reflector, TLS cryptography, and any
//! CLI/demo binary are explicitly out of scope for this crate (it ships
//! as a library with no binary target); this crate provides the
//! reactor/session-orchestration engine those higher layers are built
//! on top of.

pub mod config;
pub mod dataio;
pub mod factory;
pub mod gateway;
pub mod logging;
pub mod message;
pub mod mux;
pub mod policy;
pub mod pool;
pub mod reactor;
pub mod session;
pub mod status;
pub mod sync_driver;

pub use gateway::IoGateway;
pub use message::micro::{MicroMessageBuilder, MicroMessageView};
pub use message::Message;
pub use mux::{MultiplexerBackendKind, SocketMultiplexer};
pub use policy::{IoPolicy, RateLimitPolicy};
pub use pool::{ObjectPool, PoolRef, PoolWeak};
pub use reactor::ReflectServer;
pub use session::{OutgoingMessages, Session, SessionCallbacks, SessionId, SessionState};
pub use status::{ErrorKind, IoResult, Status, StatusResult};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
