//! Payload compression algorithms.
//!
//! A compressed message wraps the body of an ordinary message; the wrapper
//! records which algorithm was used and the body's uncompressed size. The
//! declared size bounds every allocation here, so a hostile peer cannot
//! make decompression balloon past what the wrapper admits to.

use crate::error::WireError;
use std::io::Read;

/// A negotiated compression algorithm. Ids are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compressor {
    /// Passes bytes through unchanged (id 0).
    Noop,
    Snappy,
    Zlib,
    Zstd,
}

impl Compressor {
    /// Every algorithm this build can negotiate, in preference order.
    pub const ALL: [Compressor; 4] = [
        Compressor::Zstd,
        Compressor::Snappy,
        Compressor::Zlib,
        Compressor::Noop,
    ];

    pub fn id(&self) -> u8 {
        match self {
            Compressor::Noop => 0,
            Compressor::Snappy => 1,
            Compressor::Zlib => 2,
            Compressor::Zstd => 3,
        }
    }

    /// Name used during connection handshake negotiation.
    pub fn name(&self) -> &'static str {
        match self {
            Compressor::Noop => "noop",
            Compressor::Snappy => "snappy",
            Compressor::Zlib => "zlib",
            Compressor::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Compressor> {
        match name {
            "noop" => Some(Compressor::Noop),
            "snappy" => Some(Compressor::Snappy),
            "zlib" => Some(Compressor::Zlib),
            "zstd" => Some(Compressor::Zstd),
            _ => None,
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, WireError> {
        match self {
            Compressor::Noop => Ok(data.to_vec()),
            Compressor::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(snappy_error),
            Compressor::Zlib => {
                let mut out = Vec::new();
                flate2::read::ZlibEncoder::new(data, flate2::Compression::default())
                    .read_to_end(&mut out)
                    .map_err(|source| WireError::Compression {
                        algorithm: "zlib",
                        source,
                    })?;
                Ok(out)
            }
            Compressor::Zstd => zstd::stream::encode_all(data, zstd::DEFAULT_COMPRESSION_LEVEL)
                .map_err(|source| WireError::Compression {
                    algorithm: "zstd",
                    source,
                }),
        }
    }

    /// Decompresses `data`, which must expand to exactly `expected_len`
    /// bytes. Output is never allowed to grow past `expected_len` even
    /// when the compressed stream holds more.
    pub fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, WireError> {
        let out = match self {
            Compressor::Noop => data.to_vec(),
            Compressor::Snappy => {
                let declared = snap::raw::decompress_len(data).map_err(snappy_error)?;
                if declared != expected_len {
                    return Err(WireError::DecompressedSizeMismatch {
                        declared: expected_len,
                        actual: declared,
                    });
                }
                let mut out = vec![0u8; expected_len];
                let written = snap::raw::Decoder::new()
                    .decompress(data, &mut out)
                    .map_err(snappy_error)?;
                out.truncate(written);
                out
            }
            Compressor::Zlib => {
                let mut out = Vec::with_capacity(expected_len);
                flate2::read::ZlibDecoder::new(data)
                    .take(expected_len as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|source| WireError::Compression {
                        algorithm: "zlib",
                        source,
                    })?;
                out
            }
            Compressor::Zstd => {
                let decoder =
                    zstd::stream::read::Decoder::new(data).map_err(|source| {
                        WireError::Compression {
                            algorithm: "zstd",
                            source,
                        }
                    })?;
                let mut out = Vec::with_capacity(expected_len);
                decoder
                    .take(expected_len as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|source| WireError::Compression {
                        algorithm: "zstd",
                        source,
                    })?;
                out
            }
        };
        if out.len() != expected_len {
            return Err(WireError::DecompressedSizeMismatch {
                declared: expected_len,
                actual: out.len(),
            });
        }
        Ok(out)
    }
}

impl TryFrom<u8> for Compressor {
    type Error = WireError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(Compressor::Noop),
            1 => Ok(Compressor::Snappy),
            2 => Ok(Compressor::Zlib),
            3 => Ok(Compressor::Zstd),
            other => Err(WireError::UnknownCompressor(other)),
        }
    }
}

fn snappy_error(source: snap::Error) -> WireError {
    WireError::Compression {
        algorithm: "snappy",
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, source),
    }
}
