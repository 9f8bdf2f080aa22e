// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;
use std::time::Duration;

use attestation::PckVerifier;
use chrono::{DateTime, Utc};

/// Interval for periodic runtime re-attestation, if not configured.
pub const DEFAULT_ATTEST_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Deadline for each enclave, quoting-service, PCS and registry call.
///
/// Enclave calls can take a long time in deployments that run multiple
/// nodes on a single machine, all sharing the same EPC.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// How the attestation backend is selected.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AttestationMode {
    /// Prefer ECDSA, fall back to EPID if the registry disallows PCS.
    #[default]
    Auto,
    /// Deterministic mock evidence; for development nodes only.
    Mock,
}

/// Time source used for every verification decision. Production wires in
/// the system clock; tests inject a controlled one.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Provisioner configuration. Collaborator handles are passed to
/// [`crate::driver::Provisioner::new`] separately.
#[derive(Clone)]
pub struct Config {
    /// Interval for periodic runtime re-attestation.
    pub runtime_attest_interval: Duration,

    /// PCK chain verifier, pinned to the Intel root in production.
    pub pck: PckVerifier,

    pub mode: AttestationMode,

    pub clock: Clock,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_attest_interval: DEFAULT_ATTEST_INTERVAL,
            pck: PckVerifier::intel(),
            mode: AttestationMode::Auto,
            clock: Arc::new(Utc::now),
        }
    }
}
