//! Connection handshake.
//!
//! The first command on every connection is `hello`: it introduces the
//! client, offers its compressor names, and yields the server's limits and
//! supported wire versions. Compression for the rest of the connection is
//! the first compressor the client offered that the server also accepts;
//! the hello exchange itself always travels uncompressed.

use crate::connection::ConnectionConfig;
use crate::error::ClientError;
use vellum_bson::{doc, Document, Value};
use vellum_wire::Compressor;

/// Oldest wire version this client can speak.
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;

/// Newest wire version this client knows about.
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 21;

/// What the server told us about itself in the hello reply.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    /// Largest single document the server accepts.
    pub max_document_size: i32,
    /// Largest message, header included.
    pub max_message_size: i32,
    /// Most documents accepted in one write batch.
    pub max_write_batch_size: i32,
    /// Compressor names the server accepts, in server preference order.
    pub compression: Vec<String>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
}

impl ServerDescription {
    /// Extracts the description from a hello reply. Absent size fields
    /// fall back to the protocol defaults.
    pub fn from_hello(reply: &Document) -> ServerDescription {
        let compression = reply
            .get_array("compression")
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        ServerDescription {
            max_document_size: reply
                .get_integer("maxBsonObjectSize")
                .unwrap_or(vellum_bson::MAX_DOCUMENT_SIZE as i64)
                as i32,
            max_message_size: reply
                .get_integer("maxMessageSizeBytes")
                .unwrap_or(vellum_wire::MAX_MESSAGE_SIZE as i64) as i32,
            max_write_batch_size: reply.get_integer("maxWriteBatchSize").unwrap_or(100_000) as i32,
            compression,
            min_wire_version: reply.get_integer("minWireVersion").unwrap_or(0) as i32,
            max_wire_version: reply.get_integer("maxWireVersion").unwrap_or(0) as i32,
        }
    }

    /// Checks that the server's wire version range overlaps ours.
    pub fn check_wire_version(&self) -> Result<(), ClientError> {
        if self.min_wire_version > MAX_SUPPORTED_WIRE_VERSION
            || self.max_wire_version < MIN_SUPPORTED_WIRE_VERSION
        {
            return Err(ClientError::IncompatibleServer(format!(
                "server speaks wire versions {}..={}, client speaks {}..={}",
                self.min_wire_version,
                self.max_wire_version,
                MIN_SUPPORTED_WIRE_VERSION,
                MAX_SUPPORTED_WIRE_VERSION,
            )));
        }
        Ok(())
    }
}

/// Builds the hello command for this configuration.
pub fn build_hello(config: &ConnectionConfig) -> Document {
    let mut client = Document::new();
    if let Some(ref name) = config.app_name {
        client.insert("application", doc! { "name" => name.clone() });
    }
    client.insert(
        "driver",
        doc! {
            "name" => "vellum",
            "version" => env!("CARGO_PKG_VERSION"),
        },
    );
    client.insert(
        "os",
        doc! {
            "type" => std::env::consts::OS,
            "architecture" => std::env::consts::ARCH,
        },
    );

    let mut hello = doc! {
        "hello" => 1,
        "$db" => "admin",
        "client" => client,
    };
    if !config.compressors.is_empty() {
        let names: Vec<&str> = config.compressors.iter().map(Compressor::name).collect();
        hello.insert("compression", names);
    }
    hello
}

/// Picks the first offered compressor the server also accepts.
pub fn negotiate_compressor(
    offered: &[Compressor],
    server_names: &[String],
) -> Option<Compressor> {
    offered
        .iter()
        .copied()
        .find(|compressor| server_names.iter().any(|name| name == compressor.name()))
}

/// Returns whether a command reply reports success. Servers answer with a
/// double, but an integer 1 is accepted too.
pub(crate) fn command_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Value::Double(value)) => *value == 1.0,
        Some(Value::Int32(value)) => *value == 1,
        Some(Value::Int64(value)) => *value == 1,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1:7501".parse().unwrap())
    }

    #[test]
    fn test_hello_shape() {
        let hello = build_hello(&config().with_app_name("report-builder"));
        assert_eq!(hello.get_i32("hello"), Some(1));
        assert_eq!(hello.get_str("$db"), Some("admin"));

        let client = hello.get_document("client").unwrap();
        assert_eq!(
            client.get_document("application").unwrap().get_str("name"),
            Some("report-builder")
        );
        let driver = client.get_document("driver").unwrap();
        assert_eq!(driver.get_str("name"), Some("vellum"));
        assert!(driver.get_str("version").is_some());

        let names: Vec<&str> = hello
            .get_array("compression")
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(names, ["zstd", "snappy", "zlib"]);
    }

    #[test]
    fn test_hello_without_app_or_compression() {
        let hello = build_hello(&config().with_compressors(vec![]));
        assert!(hello.get("compression").is_none());
        assert!(hello
            .get_document("client")
            .unwrap()
            .get("application")
            .is_none());
    }

    #[test]
    fn test_description_from_hello() {
        let reply = doc! {
            "ok" => 1.0,
            "maxBsonObjectSize" => 16 * 1024 * 1024,
            "maxMessageSizeBytes" => 48_000_000,
            "maxWriteBatchSize" => 100_000,
            "compression" => vec!["snappy", "zlib"],
            "minWireVersion" => 0,
            "maxWireVersion" => 17,
        };
        let description = ServerDescription::from_hello(&reply);
        assert_eq!(description.max_document_size, 16 * 1024 * 1024);
        assert_eq!(description.max_message_size, 48_000_000);
        assert_eq!(description.compression, ["snappy", "zlib"]);
        assert!(description.check_wire_version().is_ok());
    }

    #[test]
    fn test_description_defaults() {
        let description = ServerDescription::from_hello(&doc! { "ok" => 1.0, "maxWireVersion" => 8 });
        assert_eq!(
            description.max_document_size,
            vellum_bson::MAX_DOCUMENT_SIZE as i32
        );
        assert_eq!(
            description.max_message_size,
            vellum_wire::MAX_MESSAGE_SIZE as i32
        );
        assert!(description.compression.is_empty());
        assert!(description.check_wire_version().is_ok());
    }

    #[test]
    fn test_wire_version_rejection() {
        let ancient = ServerDescription::from_hello(&doc! { "maxWireVersion" => 4 });
        assert!(matches!(
            ancient.check_wire_version(),
            Err(ClientError::IncompatibleServer(_))
        ));

        let futuristic =
            ServerDescription::from_hello(&doc! { "minWireVersion" => 40, "maxWireVersion" => 44 });
        assert!(futuristic.check_wire_version().is_err());
    }

    #[test]
    fn test_negotiation_prefers_client_order() {
        let offered = [Compressor::Zstd, Compressor::Snappy, Compressor::Zlib];
        // The server prefers zlib, but snappy sits earlier in the offer.
        let server = vec!["zlib".to_string(), "snappy".to_string()];
        assert_eq!(
            negotiate_compressor(&offered, &server),
            Some(Compressor::Snappy)
        );

        assert_eq!(negotiate_compressor(&offered, &[]), None);
        assert_eq!(
            negotiate_compressor(&[], &["zstd".to_string()]),
            None
        );
    }

    #[test]
    fn test_command_ok_forms() {
        assert!(command_ok(&doc! { "ok" => 1.0 }));
        assert!(command_ok(&doc! { "ok" => 1 }));
        assert!(command_ok(&doc! { "ok" => 1i64 }));
        assert!(!command_ok(&doc! { "ok" => 0.0 }));
        assert!(!command_ok(&doc! { "status" => "fine" }));
    }
}
