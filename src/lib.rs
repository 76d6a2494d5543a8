//! vellum - Async client driver for the vellum document store
//!
//! Umbrella crate re-exporting the driver stack:
//! - [`bson`]: document model, codec, and object ids
//! - [`wire`]: message framing, compression, and checksums
//! - [`client`]: connections, commands, and cursors
//!
//! The most common entry points are lifted to the crate root, so simple
//! programs can get by with `use vellum::{Client, ConnectionConfig}` and
//! the [`doc!`] macro.

pub use vellum_bson as bson;
pub use vellum_client as client;
pub use vellum_wire as wire;

pub use vellum_bson::{doc, Document, ObjectId, Value};
pub use vellum_client::{Client, ClientError, ConnectionConfig, Cursor, TlsConfig};
pub use vellum_wire::{Compressor, Message, OpMsg};
