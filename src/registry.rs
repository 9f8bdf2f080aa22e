// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! Consensus registry reads consumed by the attestation driver.

use async_trait::async_trait;
use attestation::QuotePolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry: {0}")]
    Transport(String),

    #[error("registry read timed out")]
    Timeout,
}

/// Consensus height selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Height {
    /// The latest finalized height.
    Latest,
    At(u64),
}

/// TEE-related feature flags from the consensus parameters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TeeFeatures {
    pub sgx: SgxFeatures,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SgxFeatures {
    /// Whether the registry accepts PCS (ECDSA) attestations.
    pub pcs: bool,
}

/// The subset of consensus parameters the driver needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusParameters {
    pub tee_features: TeeFeatures,
    pub quote_policy: QuotePolicy,
}

/// Read access to the consensus registry. The quote policy is never
/// cached; the driver takes a fresh read before every verification.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn consensus_parameters(
        &self,
        height: Height,
    ) -> Result<ConsensusParameters, RegistryError>;
}
