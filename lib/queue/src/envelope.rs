//! Versioned wire envelope for queued jobs.
//!
//! Everything a transport puts on the wire is wrapped so that workers from an
//! older or newer deployment can recognise payloads they do not understand
//! and leave them for someone who does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The envelope version written by this build.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned wrapper around a serialized payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    /// When the payload was handed to the transport.
    pub emitted_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            emitted_at: Utc::now(),
            payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

impl<T: Serialize> Envelope<T> {
    /// Encodes the envelope as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    /// Decodes an envelope, refusing versions newer than this build knows.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope, the payload
    /// does not match `T`, or the version is unsupported.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: Envelope<serde_json::Value> = serde_json::from_slice(bytes)?;
        if raw.version > CURRENT_VERSION {
            return Err(serde::de::Error::custom(format!(
                "unsupported envelope version {}",
                raw.version
            )));
        }
        let payload = serde_json::from_value(raw.payload)?;
        Ok(Self {
            version: raw.version,
            emitted_at: raw.emitted_at,
            payload,
        })
    }
}
