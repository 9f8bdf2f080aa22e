// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! The variable-length signature trailer of a quote, section A.4,
//! Tables 4 and 9.

use super::report::Report;
use super::traits::{take, ParseBytes};
use super::DecodeError;

/// Length of an IEEE P1363 ECDSA-P256 signature (r ‖ s).
pub const ECDSA_SIGNATURE_LEN: usize = 64;

/// Length of an uncompressed ECDSA-P256 public key without the SEC1 tag.
pub const ECDSA_PUBKEY_LEN: usize = 64;

const CERT_DATA_PCK_CHAIN: u16 = 5;

/// Signature variant of a quote, selected by the attestation key type in
/// the header.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Signature {
    /// An ECDSA-P256 signature chain rooted in a PCK certificate.
    EcdsaP256(Box<EcdsaSignatureData>),
    /// A legacy EPID signature blob, kept opaque. EPID quotes are verified
    /// by the Intel Attestation Service rather than locally.
    Epid(EpidSignature),
    /// A key type this codec does not know. Decodes losslessly so callers
    /// can reject it with context instead of a parse failure.
    Unsupported(UnsupportedSignature),
}

impl Signature {
    /// The attestation key type tag this variant encodes under.
    pub fn key_type_tag(&self) -> u16 {
        match self {
            Self::EcdsaP256(_) => 2,
            Self::Epid(epid) => u16::from(epid.linkable),
            Self::Unsupported(unsupported) => unsupported.key_type,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EpidSignature {
    pub linkable: bool,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnsupportedSignature {
    pub key_type: u16,
    pub data: Vec<u8>,
}

/// ECDSA-P256 signature data, A.4 Table 4.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EcdsaSignatureData {
    /// Signature over the quote header and report body.
    pub signature: [u8; ECDSA_SIGNATURE_LEN],
    /// The attestation public key certified by the QE, x ‖ y.
    pub attestation_key: [u8; ECDSA_PUBKEY_LEN],
    /// The QE report whose report data binds the attestation key.
    pub qe_report: Report,
    /// PCK signature over the QE report.
    pub qe_report_signature: [u8; ECDSA_SIGNATURE_LEN],
    /// QE authentication data, bound together with the attestation key.
    pub authentication_data: Vec<u8>,
    pub certification_data: CertificationData,
}

impl EcdsaSignatureData {
    /// The attestation public key in SEC1 uncompressed form.
    pub fn attestation_key_sec1(&self) -> [u8; 65] {
        let mut sec1 = [0u8; 65];
        sec1[0] = 4;
        sec1[1..].copy_from_slice(&self.attestation_key);
        sec1
    }

    pub(super) fn from_trailer(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (signature, bytes) = bytes.parse()?;
        let (attestation_key, bytes) = bytes.parse()?;
        let (qe_report, bytes) = bytes.parse()?;
        let (qe_report_signature, bytes) = bytes.parse()?;

        let (auth_len, bytes): (u16, _) = bytes.parse()?;
        let (auth, bytes) = take(bytes, auth_len.into())?;

        let (certification_data, bytes) = CertificationData::from_bytes(bytes)?;
        if !bytes.is_empty() {
            return Err(DecodeError::InnerLengthMismatch);
        }

        Ok(Self {
            signature,
            attestation_key,
            qe_report,
            qe_report_signature,
            authentication_data: auth.to_vec(),
            certification_data,
        })
    }

    pub(super) fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.attestation_key);
        out.extend_from_slice(self.qe_report.as_bytes());
        out.extend_from_slice(&self.qe_report_signature);
        out.extend_from_slice(&(self.authentication_data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.authentication_data);
        self.certification_data.encode_into(out);
    }
}

/// How a PPID was encrypted in PPID certification data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PpidEncryption {
    Cleartext,
    Rsa2048Oaep,
    Rsa3072Oaep,
}

impl PpidEncryption {
    fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(Self::Cleartext),
            2 => Some(Self::Rsa2048Oaep),
            3 => Some(Self::Rsa3072Oaep),
            _ => None,
        }
    }

    fn tag(&self) -> u16 {
        match self {
            Self::Cleartext => 1,
            Self::Rsa2048Oaep => 2,
            Self::Rsa3072Oaep => 3,
        }
    }

    fn ppid_len(&self) -> usize {
        match self {
            Self::Cleartext => 16,
            Self::Rsa2048Oaep => 256,
            Self::Rsa3072Oaep => 384,
        }
    }
}

/// QE certification data, A.4 Table 9.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CertificationData {
    /// A PCK certificate chain, leaf first, held in DER form.
    PckChain { certs: Vec<Vec<u8>> },
    /// PPID certification data. There is no in-tree PPID to PCK resolver,
    /// so carrying this form makes the attestation fail with a typed
    /// error further up.
    Ppid {
        encryption: PpidEncryption,
        ppid: Vec<u8>,
        cpusvn: [u8; 16],
        pcesvn: u16,
        pceid: u16,
    },
}

impl CertificationData {
    fn from_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let (tag, bytes): (u16, _) = bytes.parse()?;
        let (len, bytes): (u32, _) = bytes.parse()?;
        let (data, bytes) = take(bytes, len as usize)?;

        let parsed = match PpidEncryption::from_tag(tag) {
            Some(encryption) => {
                let (ppid, data) = take(data, encryption.ppid_len())?;
                let (cpusvn, data) = data.parse()?;
                let (pcesvn, data): (u16, _) = data.parse()?;
                let (pceid, data): (u16, _) = data.parse()?;
                if !data.is_empty() {
                    return Err(DecodeError::InnerLengthMismatch);
                }

                Self::Ppid {
                    encryption,
                    ppid: ppid.to_vec(),
                    cpusvn,
                    pcesvn,
                    pceid,
                }
            }

            None if tag == CERT_DATA_PCK_CHAIN => {
                let chain = std::str::from_utf8(data)
                    .map_err(|_| DecodeError::BadCertDataType(tag))?
                    .replace("-----END CERTIFICATE-----", "-----END CERTIFICATE-----\n");

                let certs = rustls_pemfile::certs(&mut chain.as_bytes())
                    .map_err(|_| DecodeError::BadCertDataType(tag))?;
                if certs.is_empty() {
                    return Err(DecodeError::BadCertDataType(tag));
                }

                Self::PckChain { certs }
            }

            None => return Err(DecodeError::BadCertDataType(tag)),
        };

        Ok((parsed, bytes))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::PckChain { certs } => {
                let mut pem = String::new();
                for der in certs {
                    pem.push_str("-----BEGIN CERTIFICATE-----\n");
                    let b64 = base64::encode(der);
                    for chunk in b64.as_bytes().chunks(64) {
                        pem.push_str(std::str::from_utf8(chunk).unwrap());
                        pem.push('\n');
                    }
                    pem.push_str("-----END CERTIFICATE-----\n");
                }

                out.extend_from_slice(&CERT_DATA_PCK_CHAIN.to_le_bytes());
                out.extend_from_slice(&(pem.len() as u32).to_le_bytes());
                out.extend_from_slice(pem.as_bytes());
            }

            Self::Ppid {
                encryption,
                ppid,
                cpusvn,
                pcesvn,
                pceid,
            } => {
                let len = ppid.len() + cpusvn.len() + 4;
                out.extend_from_slice(&encryption.tag().to_le_bytes());
                out.extend_from_slice(&(len as u32).to_le_bytes());
                out.extend_from_slice(ppid);
                out.extend_from_slice(cpusvn);
                out.extend_from_slice(&pcesvn.to_le_bytes());
                out.extend_from_slice(&pceid.to_le_bytes());
            }
        }
    }
}
