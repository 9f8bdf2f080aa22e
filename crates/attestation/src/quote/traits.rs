// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

use super::DecodeError;

/// Splits `len` bytes off the front of `bytes`.
pub(crate) fn take(bytes: &[u8], len: usize) -> Result<(&[u8], &[u8]), DecodeError> {
    if bytes.len() < len {
        return Err(DecodeError::Truncated);
    }

    Ok(bytes.split_at(len))
}

pub(crate) trait FromBytes: Sized {
    fn from_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError>;
}

impl<const N: usize> FromBytes for [u8; N] {
    fn from_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let (lhs, rhs) = take(bytes, N)?;
        Ok((lhs.try_into().unwrap(), rhs))
    }
}

impl FromBytes for u16 {
    fn from_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let (raw, rhs): ([u8; 2], _) = bytes.parse()?;
        Ok((u16::from_le_bytes(raw), rhs))
    }
}

impl FromBytes for u32 {
    fn from_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let (raw, rhs): ([u8; 4], _) = bytes.parse()?;
        Ok((u32::from_le_bytes(raw), rhs))
    }
}

pub(crate) trait ParseBytes<T: FromBytes>: Sized {
    fn parse(self) -> Result<(T, Self), DecodeError>;
}

impl<'a, T: FromBytes> ParseBytes<T> for &'a [u8] {
    fn parse(self) -> Result<(T, Self), DecodeError> {
        T::from_bytes(self)
    }
}
