//! # vellum-client
//!
//! Client library for vellum.
//!
//! This crate provides:
//! - Async TCP client with request/reply correlation
//! - Command execution and batched cursor iteration
//! - Handshake with version and compression negotiation
//! - Optional TLS support

pub mod client;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod handshake;
pub mod stream;
pub mod tls;

pub use client::Client;
pub use connection::{
    Connection, ConnectionConfig, TlsConfig, DEFAULT_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE,
    MIN_READ_BUFFER_SIZE,
};
pub use cursor::Cursor;
pub use error::ClientError;
pub use handshake::{
    ServerDescription, MAX_SUPPORTED_WIRE_VERSION, MIN_SUPPORTED_WIRE_VERSION,
};
pub use stream::ClientStream;
