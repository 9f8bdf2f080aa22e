// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! The canonical attestation artifact handed to the registration layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tcb::TcbBundle;

/// Current version of the attestation envelope.
pub const ATTESTATION_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode attestation: {0}")]
    Encode(String),

    #[error("failed to decode attestation: {0}")]
    Decode(String),
}

/// Version envelope. Readers ignore fields they do not know, so the
/// structure can grow without breaking old consumers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub v: u16,
}

impl Default for Versioned {
    fn default() -> Self {
        Self {
            v: ATTESTATION_VERSION,
        }
    }
}

/// An attestation quote together with the TCB bundle required for its
/// verification.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QuoteBundle {
    pub quote: Vec<u8>,
    pub tcb: TcbBundle,
}

/// The attestation artifact: the verified quote bundle bound by the
/// enclave to a consensus height.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    #[serde(flatten)]
    pub versioned: Versioned,

    pub quote: QuoteBundle,

    /// Consensus height the enclave observed when signing.
    pub height: u64,

    /// Enclave signature over the attestation, 64 bytes.
    pub signature: Vec<u8>,
}

impl Attestation {
    pub fn to_cbor(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out)
            .map_err(|err| EnvelopeError::Encode(err.to_string()))?;
        Ok(out)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        ciborium::de::from_reader(bytes).map_err(|err: ciborium::de::Error<std::io::Error>| {
            EnvelopeError::Decode(err.to_string())
        })
    }
}
