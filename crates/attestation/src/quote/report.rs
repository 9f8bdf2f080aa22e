// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

use core::fmt;
use core::mem::{size_of, transmute};

use sgx::ReportBody;

use super::traits::{FromBytes, ParseBytes};
use super::DecodeError;

/// Length of the hardware report body embedded in quotes.
pub const REPORT_BODY_LEN: usize = size_of::<ReportBody>();

/// Length of a full REPORT as handed to the quoting service: the report
/// body followed by the key ID and MAC.
pub const REPORT_LEN: usize = REPORT_BODY_LEN + 48;

// Raw offsets into the report body used for masked comparisons that the
// typed accessors do not cover.
const MISCSELECT_OFFSET: usize = 16;
const ATTRIBUTES_OFFSET: usize = 48;

/// An SGX report body in its hardware layout.
///
/// Aligned so the typed [`ReportBody`] view is valid.
#[derive(Clone, Eq, PartialEq)]
#[repr(C, align(8))]
pub struct Report([u8; REPORT_BODY_LEN]);

impl Report {
    /// Typed view of the report body.
    pub fn body(&self) -> &ReportBody {
        // SAFETY: ReportBody is a repr(C) byte-for-byte image of the
        // hardware layout and the inner array has exactly its size.
        unsafe { transmute(&self.0) }
    }

    pub fn as_bytes(&self) -> &[u8; REPORT_BODY_LEN] {
        &self.0
    }

    /// MISCSELECT as a raw little-endian value.
    pub fn miscselect(&self) -> u32 {
        let raw: [u8; 4] = self.0[MISCSELECT_OFFSET..MISCSELECT_OFFSET + 4]
            .try_into()
            .unwrap();
        u32::from_le_bytes(raw)
    }

    /// ATTRIBUTES.FLAGS as a raw little-endian value.
    pub fn attributes_flags(&self) -> u64 {
        let raw: [u8; 8] = self.0[ATTRIBUTES_OFFSET..ATTRIBUTES_OFFSET + 8]
            .try_into()
            .unwrap();
        u64::from_le_bytes(raw)
    }

    /// ATTRIBUTES.XFRM as a raw little-endian value.
    pub fn attributes_xfrm(&self) -> u64 {
        let raw: [u8; 8] = self.0[ATTRIBUTES_OFFSET + 8..ATTRIBUTES_OFFSET + 16]
            .try_into()
            .unwrap();
        u64::from_le_bytes(raw)
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Report")
            .field("mrenclave", &hex::encode(self.body().mrenclave))
            .field("mrsigner", &hex::encode(self.body().mrsigner))
            .finish_non_exhaustive()
    }
}

impl From<[u8; REPORT_BODY_LEN]> for Report {
    fn from(bytes: [u8; REPORT_BODY_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Report {
    type Error = DecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        // A full REPORT with key ID and MAC is also accepted; only the
        // body is retained.
        if bytes.len() < REPORT_BODY_LEN {
            return Err(DecodeError::Truncated);
        }

        Ok(Self(bytes[..REPORT_BODY_LEN].try_into().unwrap()))
    }
}

impl FromBytes for Report {
    fn from_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let (raw, bytes): ([u8; REPORT_BODY_LEN], _) = bytes.parse()?;
        Ok((Self(raw), bytes))
    }
}
