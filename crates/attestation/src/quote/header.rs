// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! The quote header, section A.4, Table 3 of the Intel DCAP quote
//! generation reference.

/// The only quote structure version produced by the quoting services we
/// speak to.
pub const QUOTE_VERSION: u16 = 3;

/// Intel's QE vendor ID, as specified in A.4, Table 3.
pub const QE_VENDOR_ID_INTEL: [u8; 16] =
    *b"\x93\x9A\x72\x33\xF7\x9C\x4C\xA9\x94\x0A\x0D\xB3\x95\x7F\x06\x07";

/// The type of attestation key used to sign the quote.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AttestationKeyType {
    EpidUnlinkable,
    EpidLinkable,
    EcdsaP256,
    EcdsaP384,
}

impl AttestationKeyType {
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(Self::EpidUnlinkable),
            1 => Some(Self::EpidLinkable),
            2 => Some(Self::EcdsaP256),
            3 => Some(Self::EcdsaP384),
            _ => None,
        }
    }

    pub fn tag(&self) -> u16 {
        match self {
            Self::EpidUnlinkable => 0,
            Self::EpidLinkable => 1,
            Self::EcdsaP256 => 2,
            Self::EcdsaP384 => 3,
        }
    }
}

/// Quote header fields other than the version and attestation key type.
///
/// The version is fixed at [`QUOTE_VERSION`] and the key type is implied
/// by the signature variant, which keeps the two structurally consistent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// Security version of the QE.
    pub qe_svn: u16,
    /// Security version of the Provisioning Certification Enclave.
    pub pce_svn: u16,
    /// ID of the QE vendor.
    pub qe_vendor_id: [u8; 16],
    /// Custom user-defined data. For the Intel DCAP library, the first 16
    /// bytes contain a QE identifier used to link a PCK Cert to an
    /// Enc(PPID).
    pub user_data: [u8; 20],
}
