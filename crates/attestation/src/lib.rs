// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! Intel SGX attestation evidence handling: quote decoding, PCK chain
//! verification, and TCB bundle verification against Intel PCS
//! collateral.

#![warn(rust_2018_idioms, unused_lifetimes, unused_qualifications, clippy::all)]

pub mod artifact;
pub mod mock;
pub mod pck;
pub mod quote;
pub mod tcb;

pub use artifact::{Attestation, QuoteBundle, Versioned, ATTESTATION_VERSION};
pub use pck::{Fmspc, PckInfo, PckVerifier};
pub use quote::Quote;
pub use tcb::{QuotePolicy, TcbBundle, TcbStatus};
