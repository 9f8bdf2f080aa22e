// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

use core::fmt;

use serde::{Deserialize, Serialize};

/// TCB status as reported by Intel for a platform or enclave TCB level.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TcbStatus {
    UpToDate,
    SWHardeningNeeded,
    ConfigurationNeeded,
    ConfigurationAndSWHardeningNeeded,
    OutOfDate,
    OutOfDateConfigurationNeeded,
    Revoked,
    #[serde(other)]
    Invalid,
}

impl Default for TcbStatus {
    fn default() -> Self {
        Self::Invalid
    }
}

impl fmt::Display for TcbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UpToDate => "UpToDate",
            Self::SWHardeningNeeded => "SWHardeningNeeded",
            Self::ConfigurationNeeded => "ConfigurationNeeded",
            Self::ConfigurationAndSWHardeningNeeded => "ConfigurationAndSWHardeningNeeded",
            Self::OutOfDate => "OutOfDate",
            Self::OutOfDateConfigurationNeeded => "OutOfDateConfigurationNeeded",
            Self::Revoked => "Revoked",
            Self::Invalid => "Invalid",
        };
        f.write_str(name)
    }
}

/// Quote validity policy, supplied by the consensus registry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QuotePolicy {
    /// Whether PCS quotes are disabled and will always be rejected.
    #[serde(default)]
    pub disabled: bool,

    /// TCB statuses an attestation may carry. An empty list rejects
    /// everything.
    pub allowed_tcb_statuses: Vec<TcbStatus>,

    /// Advisory IDs that may accompany a status other than `UpToDate`.
    /// Any advisory outside this list invalidates the attestation.
    #[serde(default)]
    pub allowed_advisories: Vec<String>,

    /// Maximum age of TCB collateral counted from its issue date, in days.
    pub max_bundle_age_days: u16,

    /// Whether debug enclaves are acceptable.
    #[serde(default)]
    pub allow_debug_enclaves: bool,
}

impl Default for QuotePolicy {
    fn default() -> Self {
        Self {
            disabled: false,
            allowed_tcb_statuses: vec![TcbStatus::UpToDate],
            allowed_advisories: Vec::new(),
            max_bundle_age_days: 30,
            allow_debug_enclaves: false,
        }
    }
}

impl QuotePolicy {
    pub(crate) fn allows_status(&self, status: TcbStatus) -> bool {
        self.allowed_tcb_statuses.contains(&status)
    }

    pub(crate) fn allows_advisories<'a>(
        &self,
        advisories: impl IntoIterator<Item = &'a String>,
    ) -> bool {
        advisories
            .into_iter()
            .all(|advisory| self.allowed_advisories.contains(advisory))
    }
}
