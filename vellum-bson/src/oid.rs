//! 12-byte object identifiers.
//!
//! ```text
//! +-----------+--------------+---------+-----------+
//! | timestamp | machine id   | pid     | counter   |
//! | 4 bytes   | 3 bytes      | 2 bytes | 3 bytes   |
//! +-----------+--------------+---------+-----------+
//! ```
//!
//! All fields are big-endian within the array, so the derived byte-wise
//! ordering equals lexicographic ordering of the hex rendering. That is
//! the ordering existing deployments sort by, and it is kept even though
//! it diverges from creation order once the timestamp's high byte wraps.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const COUNTER_MASK: u32 = 0x00FF_FFFF;

/// Errors from parsing the hex rendering of an [`ObjectId`].
#[derive(Debug, Error)]
pub enum ObjectIdError {
    #[error("expected 24 hex characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A 12-byte globally distinguishing identifier.
///
/// Equality and ordering are byte-wise over the full 12 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    bytes: [u8; 12],
}

impl ObjectId {
    pub const LEN: usize = 12;

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId { bytes }
    }

    pub const fn bytes(&self) -> [u8; 12] {
        self.bytes
    }

    /// Parses the 24-character lowercase or uppercase hex rendering.
    pub fn parse_str(s: &str) -> Result<Self, ObjectIdError> {
        if s.len() != 24 {
            return Err(ObjectIdError::InvalidLength(s.len()));
        }
        let decoded = hex::decode(s)?;
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(&decoded);
        Ok(ObjectId { bytes })
    }

    /// Creation time, seconds since the Unix epoch.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    /// The 3-byte machine discriminator.
    pub fn machine_id(&self) -> u32 {
        u32::from_be_bytes([0, self.bytes[4], self.bytes[5], self.bytes[6]])
    }

    pub fn process_id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[7], self.bytes[8]])
    }

    /// The 3-byte per-process counter value.
    pub fn counter(&self) -> u32 {
        u32::from_be_bytes([0, self.bytes[9], self.bytes[10], self.bytes[11]])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::parse_str(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::parse_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Where the generator's machine discriminator came from.
///
/// Callers that care about collision odds across hosts can log a warning
/// when initialization had to fall back to a random value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineIdSource {
    /// Derived from the host's network interface hardware addresses.
    HardwareAddress,
    /// No usable hardware address was found; a random value was drawn.
    Random,
}

/// Process-wide identifier generator.
///
/// The machine discriminator and pid are computed once at construction and
/// are immutable afterwards; the counter is a single atomic shared by all
/// threads. Construct one per process and hand out references.
#[derive(Debug)]
pub struct ObjectIdGenerator {
    machine_id: [u8; 3],
    source: MachineIdSource,
    pid: u16,
    counter: AtomicU32,
}

impl ObjectIdGenerator {
    pub fn new() -> Self {
        let (machine_id, source) = match hardware_machine_id() {
            Some(id) => (id, MachineIdSource::HardwareAddress),
            None => (rand::thread_rng().gen(), MachineIdSource::Random),
        };
        ObjectIdGenerator {
            machine_id,
            source,
            pid: std::process::id() as u16,
            counter: AtomicU32::new(rand::thread_rng().gen::<u32>() & COUNTER_MASK),
        }
    }

    pub fn machine_id(&self) -> [u8; 3] {
        self.machine_id
    }

    pub fn machine_id_source(&self) -> MachineIdSource {
        self.source
    }

    /// Produces the next identifier. Safe to call concurrently from any
    /// number of threads; the counter wraps at 2^24.
    pub fn generate(&self) -> ObjectId {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let count = self.counter.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..7].copy_from_slice(&self.machine_id);
        bytes[7..9].copy_from_slice(&self.pid.to_be_bytes());
        bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);
        ObjectId { bytes }
    }
}

impl Default for ObjectIdGenerator {
    fn default() -> Self {
        ObjectIdGenerator::new()
    }
}

/// First three bytes of a SHA-256 over the sorted non-zero hardware
/// addresses under `/sys/class/net`.
#[cfg(target_os = "linux")]
fn hardware_machine_id() -> Option<[u8; 3]> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    let mut addresses = Vec::new();
    for entry in entries.flatten() {
        if let Ok(address) = std::fs::read_to_string(entry.path().join("address")) {
            let address = address.trim();
            // Loopback and some virtual interfaces report all zeros.
            if !address.is_empty() && address.bytes().any(|b| b != b'0' && b != b':') {
                addresses.push(address.to_string());
            }
        }
    }
    if addresses.is_empty() {
        return None;
    }
    addresses.sort();
    let mut hasher = Sha256::new();
    for address in &addresses {
        hasher.update(address.as_bytes());
    }
    let digest = hasher.finalize();
    Some([digest[0], digest[1], digest[2]])
}

#[cfg(not(target_os = "linux"))]
fn hardware_machine_id() -> Option<[u8; 3]> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_field_extraction() {
        let id = ObjectId::from_bytes([
            0x65, 0x43, 0x21, 0x10, 0xAA, 0xBB, 0xCC, 0x12, 0x34, 0x01, 0x02, 0x03,
        ]);
        assert_eq!(id.timestamp(), 0x6543_2110);
        assert_eq!(id.machine_id(), 0x00AA_BBCC);
        assert_eq!(id.process_id(), 0x1234);
        assert_eq!(id.counter(), 0x0001_0203);
    }

    #[test]
    fn test_hex_round_trip() {
        let id = ObjectId::from_bytes([
            0x65, 0x43, 0x21, 0x10, 0xAA, 0xBB, 0xCC, 0x12, 0x34, 0x01, 0x02, 0x03,
        ]);
        let hex = id.to_hex();
        assert_eq!(hex, "65432110aabbcc1234010203");
        assert_eq!(hex.parse::<ObjectId>().unwrap(), id);
        assert_eq!(ObjectId::parse_str(&hex.to_uppercase()).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            ObjectId::parse_str("abc"),
            Err(ObjectIdError::InvalidLength(3))
        ));
        assert!(matches!(
            ObjectId::parse_str("zz432110aabbcc1234010203"),
            Err(ObjectIdError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_ordering_matches_hex_ordering() {
        let mut ids = vec![
            ObjectId::from_bytes([0xFF; 12]),
            ObjectId::from_bytes([0x00; 12]),
            ObjectId::from_bytes([
                0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
            ]),
            ObjectId::from_bytes([
                0x7F, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ]),
        ];
        let mut by_hex = ids.clone();
        ids.sort();
        by_hex.sort_by_key(|id| id.to_hex());
        assert_eq!(ids, by_hex);
    }

    #[test]
    fn test_generated_layout() {
        let generator = ObjectIdGenerator::new();
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        let id = generator.generate();
        assert!(id.timestamp() >= before && id.timestamp() <= before + 2);
        let machine = generator.machine_id();
        assert_eq!(
            id.machine_id(),
            u32::from_be_bytes([0, machine[0], machine[1], machine[2]])
        );
        assert_eq!(id.process_id(), std::process::id() as u16);
    }

    #[test]
    fn test_counter_increments_and_masks() {
        let generator = ObjectIdGenerator::new();
        let a = generator.generate().counter();
        let b = generator.generate().counter();
        assert_eq!(b, (a + 1) & COUNTER_MASK);
        assert!(a <= COUNTER_MASK);
    }

    #[test]
    fn test_uniqueness_single_thread() {
        let generator = ObjectIdGenerator::new();
        let mut seen = HashSet::with_capacity(100_000);
        for _ in 0..100_000 {
            let id = generator.generate();
            assert!(seen.insert(id.bytes()), "duplicate id {id}");
            assert_eq!(ObjectId::from_bytes(id.bytes()), id);
        }
    }

    #[test]
    fn test_uniqueness_across_threads() {
        let generator = ObjectIdGenerator::new();
        let per_thread = 12_500;
        let threads = 8;
        let mut all = Vec::with_capacity(per_thread * threads);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| {
                        (0..per_thread)
                            .map(|_| generator.generate())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                all.extend(handle.join().unwrap());
            }
        });
        let unique: HashSet<[u8; 12]> = all.iter().map(ObjectId::bytes).collect();
        assert_eq!(unique.len(), per_thread * threads);
    }

    #[test]
    fn test_machine_id_source_is_stable() {
        let generator = ObjectIdGenerator::new();
        let source = generator.machine_id_source();
        assert!(matches!(
            source,
            MachineIdSource::HardwareAddress | MachineIdSource::Random
        ));
        let a = generator.generate();
        let b = generator.generate();
        assert_eq!(a.machine_id(), b.machine_id());
    }
}
