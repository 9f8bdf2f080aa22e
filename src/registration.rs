// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

use async_trait::async_trait;
use attestation::Attestation;
use thiserror::Error;

use crate::runtime::RuntimeId;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("registration transport: {0}")]
    Transport(String),
}

/// Consumer of produced attestations, typically the node registration
/// layer that publishes them on chain.
#[async_trait]
pub trait Registration: Send + Sync {
    async fn submit(
        &self,
        runtime_id: &RuntimeId,
        attestation: &Attestation,
    ) -> Result<(), RegistrationError>;
}
