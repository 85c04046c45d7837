//! Wire format for published events
//!
//! Subscribers receive length-prefixed frames:
//!
//! ```text
//! +------------------+--------------------------+
//! | Length (4 bytes) | Payload (variable)       |
//! | Big-endian u32   | JSON or Postcard binary  |
//! +------------------+--------------------------+
//! ```
//!
//! JSON is the default (debuggable, cross-language); Postcard is the
//! compact binary option for bandwidth-constrained deployments.

use crate::error::{Error, Result};
use crate::events::Event;

/// Supported wire formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Human-readable JSON (default)
    #[default]
    Json,
    /// Compact binary via postcard
    Postcard,
}

impl WireFormat {
    /// Parse the config string ("json" | "postcard"); unknown values fall
    /// back to JSON with a warning
    pub fn from_config(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "json" => WireFormat::Json,
            "postcard" => WireFormat::Postcard,
            other => {
                log::warn!("Unknown wire format {:?}, using json", other);
                WireFormat::Json
            }
        }
    }
}

/// Serializer handling both formats
#[derive(Debug, Clone, Copy)]
pub struct Serializer {
    format: WireFormat,
}

impl Serializer {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// Serialize an event payload (no length prefix)
    pub fn serialize(&self, event: &Event) -> Result<Vec<u8>> {
        match self.format {
            WireFormat::Json => {
                serde_json::to_vec(event).map_err(|e| Error::Serialization(e.to_string()))
            }
            WireFormat::Postcard => {
                postcard::to_allocvec(event).map_err(|e| Error::Serialization(e.to_string()))
            }
        }
    }

    /// Deserialize an event payload (subscriber side, used in tests)
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Event> {
        match self.format {
            WireFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
            }
            WireFormat::Postcard => {
                postcard::from_bytes(bytes).map_err(|e| Error::Serialization(e.to_string()))
            }
        }
    }

    /// Build a length-prefixed frame into `buffer` (reused across calls)
    pub fn encode_frame(&self, event: &Event, buffer: &mut Vec<u8>) -> Result<()> {
        let payload = self.serialize(event)?;
        buffer.clear();
        buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buffer.extend_from_slice(&payload);
        Ok(())
    }
}
