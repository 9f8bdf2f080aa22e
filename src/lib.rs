// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! Attestation provisioner for Intel SGX runtime enclaves.
//!
//! Given a freshly launched enclave, the provisioner negotiates an
//! attestation key with the platform quoting service, drives the enclave
//! through the attestation dialogue, verifies the resulting quote
//! against Intel PCS collateral under the consensus quote policy, and
//! keeps the attestation fresh with a long-lived per-runtime worker.
//!
//! The embedding node supplies the collaborators: the enclave transport,
//! the quoting service, the Intel PCS client, the consensus registry,
//! the registration layer, and a persistent key/value store.

#![warn(rust_2018_idioms, unused_lifetimes, unused_qualifications, clippy::all)]

pub mod aesm;
pub mod cache;
pub mod config;
pub mod driver;
pub mod metrics;
pub mod pcs;
pub mod protocol;
pub mod registration;
pub mod registry;
pub mod runtime;
pub mod store;

pub(crate) mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use attestation;

pub use config::{AttestationMode, Config};
pub use driver::{Provisioner, TeeState, UpdateError};
pub use metrics::init_metrics;
pub use runtime::{RuntimeHandle, RuntimeId};
