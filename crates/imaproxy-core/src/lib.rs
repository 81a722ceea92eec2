//! IMAProxy Core - Transparent intercepting IMAP proxy
//!
//! This crate provides the proxy engine: per-connection mediation between a
//! mail client and an upstream IMAP server, command/response framing, the
//! event buses plugins subscribe to, and the built-in plugins that rewrite
//! capability advertisements and filter groupware folders out of mailbox
//! listings.

pub mod bus;
pub mod mediator;
pub mod plugins;
pub mod proto;
pub mod proxy;
pub mod session;
pub mod tls;
pub mod upstream;

pub use bus::{Event, EventBus, ListenerId};
pub use mediator::{Mediator, MediatorSettings};
pub use plugins::{PluginContext, PluginRegistry, ProxyPlugin};
pub use proxy::ProxyServer;
pub use session::Session;
pub use upstream::UpstreamAddr;
