// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

#![warn(rust_2018_idioms, unused_lifetimes, unused_qualifications, clippy::all)]

pub mod ext;

pub use const_oid;
pub use der;
pub use p256;
pub use pkcs8;
pub use sec1;
pub use spki;
pub use x509;
pub use zeroize;
