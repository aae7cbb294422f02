//! Per-message body compression selected by the [`keys::COMPRESSION`] header.
//!
//! Accepted header values are `none` (or empty), `gzip` and `zstd`. Producers
//! that write `s2` are not understood: such messages fail to decode and are
//! dropped, so services sharing a topic must agree on one of the values above.

use crate::envelope::{keys, Message};
use crate::error::CompressionError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

const ZSTD_LEVEL: i32 = 3;

/// Supported body compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    /// Algorithm declared by `message`, `None` when the header is absent.
    pub fn of(message: &Message) -> Result<Self, CompressionError> {
        if !message.headers.contains(keys::COMPRESSION) {
            return Ok(Compression::None);
        }
        message.headers.get(keys::COMPRESSION).parse()
    }

    pub fn encode(&self, body: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Compression::None => Ok(body.to_vec()),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
                encoder
                    .write_all(body)
                    .map_err(|source| self.corrupt("compress", source))?;
                encoder
                    .finish()
                    .map_err(|source| self.corrupt("compress", source))
            }
            Compression::Zstd => zstd::stream::encode_all(body, ZSTD_LEVEL)
                .map_err(|source| self.corrupt("compress", source)),
        }
    }

    pub fn decode(&self, body: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Compression::None => Ok(body.to_vec()),
            Compression::Gzip => {
                let mut decoded = Vec::new();
                GzDecoder::new(body)
                    .read_to_end(&mut decoded)
                    .map_err(|source| self.corrupt("decompress", source))?;
                Ok(decoded)
            }
            Compression::Zstd => zstd::stream::decode_all(body)
                .map_err(|source| self.corrupt("decompress", source)),
        }
    }

    fn corrupt(&self, operation: &'static str, source: std::io::Error) -> CompressionError {
        CompressionError::Corrupt {
            algorithm: self.as_str(),
            operation,
            source,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            other => Err(CompressionError::Unsupported(other.to_string())),
        }
    }
}

/// Compress `message.body` in place according to its header.
pub fn compress(message: &mut Message) -> Result<(), CompressionError> {
    let algorithm = Compression::of(message)?;
    if algorithm != Compression::None {
        message.body = algorithm.encode(&message.body)?;
    }
    Ok(())
}

/// Decompress `message.body` in place according to its header.
pub fn decompress(message: &mut Message) -> Result<(), CompressionError> {
    let algorithm = Compression::of(message)?;
    if algorithm != Compression::None {
        message.body = algorithm.decode(&message.body)?;
    }
    Ok(())
}
