//! peerlink node: tokio sockets around the peerlink-core engine.

pub mod command;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod download;
pub mod handshake;
pub mod lister;
pub mod node;
pub mod upload;

pub use config::Config;
pub use node::Node;
