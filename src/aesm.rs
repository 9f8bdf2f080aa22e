// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! The platform quoting service.
//!
//! The host-side Intel daemon (aesmd) owns the platform attestation keys
//! and signs quotes over enclave reports. Wiring to the actual daemon
//! socket belongs to the embedding process; the driver only consumes
//! this interface.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotingError {
    #[error("quoting service: {0}")]
    Service(String),

    #[error("quoting service call timed out")]
    Timeout,
}

/// Attestation key algorithms a platform may support.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyAlgorithm {
    EcdsaP256,
    Epid,
}

/// An attestation key offered by the quoting service. Selected once per
/// runtime at initialization time and immutable thereafter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttestationKey {
    pub id: Vec<u8>,
    pub algorithm: KeyAlgorithm,
}

#[async_trait]
pub trait QuotingService: Send + Sync {
    /// The attestation keys supported by the platform.
    async fn attestation_keys(&self) -> Result<Vec<AttestationKey>, QuotingError>;

    /// QE target info for the given key, 512 bytes.
    async fn target_info(&self, key: &AttestationKey) -> Result<Vec<u8>, QuotingError>;

    /// Sign a quote over the given REPORT.
    async fn quote(&self, key: &AttestationKey, report: &[u8]) -> Result<Vec<u8>, QuotingError>;
}
