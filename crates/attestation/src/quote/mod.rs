// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! Intel SGX quote codec.
//!
//! The Quote structure is used to provide proof to an off-platform entity
//! that an application enclave is running with Intel SGX protections on a
//! trusted Intel SGX enabled platform. See section A.4 of:
//! <https://download.01.org/intel-sgx/dcap-1.0/docs/SGX_ECDSA_QuoteGenReference_DCAP_API_Linux_1.0.pdf>
//!
//! Decoding validates every length field; encoding is the exact inverse
//! over the subset of quotes the quoting services emit, so that
//! `decode(encode(q)) == q` for every accepted input.

pub mod header;
pub mod report;
pub mod sign;

mod traits;

use thiserror::Error;

use header::{Header, QUOTE_VERSION};
use report::Report;
use sign::{EcdsaSignatureData, EpidSignature, Signature, UnsupportedSignature};
use traits::{take, ParseBytes};

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("unexpected end of quote data")]
    Truncated,

    #[error("unsupported quote version {0}")]
    BadVersion(u16),

    #[error("unsupported attestation key type {0}")]
    BadKeyType(u16),

    #[error("unsupported certification data type {0}")]
    BadCertDataType(u16),

    #[error("length field does not match remaining data")]
    InnerLengthMismatch,
}

/// A decoded quote.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Quote {
    pub header: Header,
    pub report: Report,
    pub signature: Signature,
}

impl Quote {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (version, bytes): (u16, _) = bytes.parse()?;
        if version != QUOTE_VERSION {
            return Err(DecodeError::BadVersion(version));
        }

        let (key_type, bytes): (u16, _) = bytes.parse()?;
        let (reserved, bytes): ([u8; 4], _) = bytes.parse()?;
        if reserved != [0u8; 4] {
            return Err(DecodeError::BadVersion(version));
        }

        let (qe_svn, bytes): (u16, _) = bytes.parse()?;
        let (pce_svn, bytes): (u16, _) = bytes.parse()?;
        let (qe_vendor_id, bytes): ([u8; 16], _) = bytes.parse()?;
        let (user_data, bytes): ([u8; 20], _) = bytes.parse()?;

        let (report, bytes): (Report, _) = bytes.parse()?;

        let (sig_len, bytes): (u32, _) = bytes.parse()?;
        let (trailer, bytes) = take(bytes, sig_len as usize)?;
        if !bytes.is_empty() {
            return Err(DecodeError::InnerLengthMismatch);
        }

        let signature = match key_type {
            0 | 1 => Signature::Epid(EpidSignature {
                linkable: key_type == 1,
                data: trailer.to_vec(),
            }),
            2 => Signature::EcdsaP256(Box::new(EcdsaSignatureData::from_trailer(trailer)?)),
            // ES384 is defined by Intel but not produced by any quoting
            // service we support.
            3 => return Err(DecodeError::BadKeyType(key_type)),
            _ => Signature::Unsupported(UnsupportedSignature {
                key_type,
                data: trailer.to_vec(),
            }),
        };

        Ok(Quote {
            header: Header {
                qe_svn,
                pce_svn,
                qe_vendor_id,
                user_data,
            },
            report,
            signature,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut trailer = Vec::new();
        match &self.signature {
            Signature::EcdsaP256(data) => data.encode_into(&mut trailer),
            Signature::Epid(epid) => trailer.extend_from_slice(&epid.data),
            Signature::Unsupported(unsupported) => trailer.extend_from_slice(&unsupported.data),
        }

        let mut out = self.signed_data();
        out.extend_from_slice(&(trailer.len() as u32).to_le_bytes());
        out.extend_from_slice(&trailer);
        out
    }

    /// The bytes covered by the attestation key's signature: the header
    /// followed by the report body.
    pub fn signed_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48 + report::REPORT_BODY_LEN);
        out.extend_from_slice(&QUOTE_VERSION.to_le_bytes());
        out.extend_from_slice(&self.signature.key_type_tag().to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&self.header.qe_svn.to_le_bytes());
        out.extend_from_slice(&self.header.pce_svn.to_le_bytes());
        out.extend_from_slice(&self.header.qe_vendor_id);
        out.extend_from_slice(&self.header.user_data);
        out.extend_from_slice(self.report.as_bytes());
        out
    }

    /// The ECDSA signature data, if this quote carries any.
    pub fn ecdsa(&self) -> Option<&EcdsaSignatureData> {
        match &self.signature {
            Signature::EcdsaP256(data) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::header::QE_VENDOR_ID_INTEL;
    use super::sign::{CertificationData, PpidEncryption};
    use super::*;

    fn sample_ecdsa() -> Quote {
        Quote {
            header: Header {
                qe_svn: 7,
                pce_svn: 12,
                qe_vendor_id: QE_VENDOR_ID_INTEL,
                user_data: [9u8; 20],
            },
            report: Report::from([3u8; report::REPORT_BODY_LEN]),
            signature: Signature::EcdsaP256(Box::new(EcdsaSignatureData {
                signature: [1u8; 64],
                attestation_key: [2u8; 64],
                qe_report: Report::from([4u8; report::REPORT_BODY_LEN]),
                qe_report_signature: [5u8; 64],
                authentication_data: vec![0xAA; 32],
                certification_data: CertificationData::PckChain {
                    certs: vec![vec![0x30, 0x03, 0x02, 0x01, 0x01], vec![0x30, 0x00]],
                },
            })),
        }
    }

    #[test]
    fn ecdsa_round_trip() {
        let quote = sample_ecdsa();
        let encoded = quote.encode();
        let decoded = Quote::decode(&encoded).unwrap();
        assert_eq!(decoded, quote);
    }

    #[test]
    fn ppid_round_trip() {
        let mut quote = sample_ecdsa();
        if let Signature::EcdsaP256(data) = &mut quote.signature {
            data.certification_data = CertificationData::Ppid {
                encryption: PpidEncryption::Rsa3072Oaep,
                ppid: vec![0x11; 384],
                cpusvn: [6u8; 16],
                pcesvn: 11,
                pceid: 0,
            };
        }

        let decoded = Quote::decode(&quote.encode()).unwrap();
        assert_eq!(decoded, quote);
    }

    #[test]
    fn epid_round_trip() {
        let quote = Quote {
            signature: Signature::Epid(EpidSignature {
                linkable: true,
                data: vec![0x55; 680],
            }),
            ..sample_ecdsa()
        };

        let decoded = Quote::decode(&quote.encode()).unwrap();
        assert_eq!(decoded, quote);
    }

    #[test]
    fn unknown_key_type_is_preserved() {
        let quote = Quote {
            signature: Signature::Unsupported(UnsupportedSignature {
                key_type: 9,
                data: vec![1, 2, 3],
            }),
            ..sample_ecdsa()
        };

        let decoded = Quote::decode(&quote.encode()).unwrap();
        assert_eq!(decoded.signature.key_type_tag(), 9);
        assert_eq!(decoded, quote);
    }

    #[test]
    fn es384_is_rejected() {
        let mut encoded = sample_ecdsa().encode();
        encoded[2..4].copy_from_slice(&3u16.to_le_bytes());
        assert_eq!(Quote::decode(&encoded), Err(DecodeError::BadKeyType(3)));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut encoded = sample_ecdsa().encode();
        encoded[0..2].copy_from_slice(&4u16.to_le_bytes());
        assert_eq!(Quote::decode(&encoded), Err(DecodeError::BadVersion(4)));
    }

    #[test]
    fn truncation_is_detected_everywhere() {
        let encoded = sample_ecdsa().encode();
        for len in [0, 1, 47, 48, 431, 435, encoded.len() - 1] {
            match Quote::decode(&encoded[..len]) {
                Err(DecodeError::Truncated) | Err(DecodeError::InnerLengthMismatch) => {}
                other => panic!("unexpected result at {len}: {other:?}"),
            }
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = sample_ecdsa().encode();
        encoded.push(0);
        assert_eq!(
            Quote::decode(&encoded),
            Err(DecodeError::InnerLengthMismatch)
        );
    }

    #[test]
    fn bad_cert_data_type_is_rejected() {
        let quote = sample_ecdsa();
        let mut encoded = quote.encode();

        // The certification data tag sits right after the fixed-size part
        // of the signature trailer and the authentication data.
        let auth_len = 32;
        let tag_at = 432 + 4 + 64 + 64 + report::REPORT_BODY_LEN + 64 + 2 + auth_len;
        encoded[tag_at..tag_at + 2].copy_from_slice(&7u16.to_le_bytes());

        assert_eq!(
            Quote::decode(&encoded),
            Err(DecodeError::BadCertDataType(7))
        );
    }
}
