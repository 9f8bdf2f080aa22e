// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! PCK certificate chain verification.
//!
//! An ECDSA quote certifies its attestation key through a chain of
//! Provisioning Certification Key certificates rooted at the Intel SGX
//! Root CA. The leaf carries an Intel-defined extension with the platform
//! identifiers (FMSPC, TCB component SVNs, PCESVN, PCEID) that key all
//! further TCB lookups.
//!
//! Verification here is pure: no network access and no clock reads beyond
//! the `now` supplied by the caller.

use core::fmt;
use std::borrow::Cow;

use chrono::{DateTime, Utc};
use const_oid::ObjectIdentifier;
use cryptography::ext::{SubjectPublicKeyInfoExt, TbsCertificateExt};
use der::asn1::{AnyRef, OctetStringRef, UIntRef};
use der::{Decode, Encode, Sequence};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509::crl::CertificateList;
use x509::Certificate;

/// The Intel SGX Root CA certificate, pinned at compile time.
pub const INTEL_SGX_ROOT_DER: &[u8] = include_bytes!("root.der");

/// OID of the Intel SGX extension carried by PCK leaf certificates.
pub const SGX_EXTENSION_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113741.1.13.1");

const SGX_EXTENSION_TCB_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113741.1.13.1.2");
const SGX_EXTENSION_PCEID_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113741.1.13.1.3");
const SGX_EXTENSION_FMSPC_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113741.1.13.1.4");

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum PckError {
    #[error("PCK certificate chain is malformed")]
    Malformed,

    #[error("PCK certificate chain is invalid")]
    ChainInvalid,

    #[error("PCK certificate chain is expired or not yet valid")]
    ChainExpired,

    #[error("PCK certificate chain is not rooted at the Intel SGX root CA")]
    NotIntelRoot,

    #[error("PCK leaf certificate has no SGX extension")]
    ExtensionMissing,

    #[error("no valid CRL available for a certificate in the chain")]
    CrlMissing,

    #[error("a certificate in the chain has been revoked")]
    Revoked,
}

/// FMSPC, the six byte platform family identifier keying TCB tables.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Fmspc(pub [u8; 6]);

impl Fmspc {
    pub fn from_hex(hex: &str) -> Option<Self> {
        let raw = hex::decode(hex).ok()?;
        Some(Self(raw.try_into().ok()?))
    }
}

impl fmt::Display for Fmspc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

/// Platform identifiers extracted from a validated PCK chain.
///
/// `cpusvn` holds the sixteen TCB component SVNs from the SGX extension,
/// which for SGX TCB type 0 are exactly the CPUSVN bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PckInfo {
    pub fmspc: Fmspc,
    pub cpusvn: [u8; 16],
    pub pcesvn: u16,
    pub pceid: u16,
    /// The PCK leaf public key, SEC1 encoded.
    pub public_key: Vec<u8>,
}

/// A set of CA-issued CRLs, typically shipped alongside a TCB bundle.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CrlSet {
    pub entries: Vec<CrlEntry>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CrlEntry {
    /// Where the CRL was obtained. Informational only; lookups match on
    /// the CRL issuer name.
    pub url: String,
    pub der: Vec<u8>,
}

impl CrlSet {
    pub fn push(&mut self, url: impl Into<String>, der: Vec<u8>) {
        self.entries.push(CrlEntry {
            url: url.into(),
            der,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Verifier for PCK certificate chains against a pinned root.
#[derive(Clone, Debug)]
pub struct PckVerifier {
    root: Cow<'static, [u8]>,
}

impl Default for PckVerifier {
    fn default() -> Self {
        Self::intel()
    }
}

impl PckVerifier {
    /// A verifier pinned to the production Intel SGX Root CA.
    pub fn intel() -> Self {
        Self {
            root: Cow::Borrowed(INTEL_SGX_ROOT_DER),
        }
    }

    /// A verifier pinned to a substitute root, for mock attestation and
    /// tests.
    pub fn with_root(root_der: Vec<u8>) -> Self {
        Self {
            root: Cow::Owned(root_der),
        }
    }

    pub fn root_der(&self) -> &[u8] {
        &self.root
    }

    /// Validates a DER certificate chain, leaf first, and extracts the
    /// platform identifiers from the leaf.
    pub fn verify_pck(&self, chain: &[Vec<u8>], now: DateTime<Utc>) -> Result<PckInfo, PckError> {
        let certs = parse_chain(chain)?;
        let leaf = self.verify_chain(&certs, chain, now)?;

        let ext = leaf
            .tbs_certificate
            .extension(SGX_EXTENSION_OID)
            .ok_or(PckError::ExtensionMissing)?;
        let ids = SgxExtension::parse(ext.extn_value)?;

        Ok(PckInfo {
            fmspc: ids.fmspc,
            cpusvn: ids.comp_svn,
            pcesvn: ids.pcesvn,
            pceid: ids.pceid,
            public_key: leaf
                .tbs_certificate
                .subject_public_key_info
                .subject_public_key
                .to_vec(),
        })
    }

    /// Checks every issued certificate in the chain against the CRL of
    /// its issuer. A certificate whose issuer has no usable CRL in `crls`
    /// fails closed.
    pub fn check_revocations(
        &self,
        chain: &[Vec<u8>],
        crls: &CrlSet,
        now: DateTime<Utc>,
    ) -> Result<(), PckError> {
        let certs = parse_chain(chain)?;

        for pair in certs.windows(2) {
            let (cert, issuer) = (&pair[0], &pair[1]);
            check_one_revocation(cert, issuer, crls, now)?;
        }

        Ok(())
    }

    /// Verifies a DER chain, leaf first, against the pinned root and
    /// returns the leaf's public key in SEC1 form.
    pub(crate) fn chain_leaf_spki(
        &self,
        chain: &[Vec<u8>],
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, PckError> {
        let certs = parse_chain(chain)?;
        let leaf = self.verify_chain(&certs, chain, now)?;

        Ok(leaf
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .to_vec())
    }

    /// Verifies signatures and validity down the chain and checks that it
    /// terminates at the pinned root. Returns the leaf.
    fn verify_chain<'r, 'a>(
        &self,
        certs: &'r [Certificate<'a>],
        chain_der: &[Vec<u8>],
        now: DateTime<Utc>,
    ) -> Result<&'r Certificate<'a>, PckError> {
        if certs.len() < 2 {
            return Err(PckError::ChainInvalid);
        }

        if chain_der.last().map(Vec::as_slice) != Some(self.root.as_ref()) {
            return Err(PckError::NotIntelRoot);
        }

        let mut signer = &certs[certs.len() - 1].tbs_certificate;
        for cert in certs.iter().rev() {
            cert.tbs_certificate
                .valid_at(now.into())
                .map_err(|_| PckError::ChainExpired)?;
            signer = signer
                .verify_crt(cert)
                .map_err(|_| PckError::ChainInvalid)?;
        }

        Ok(&certs[0])
    }
}

fn parse_chain(chain: &[Vec<u8>]) -> Result<Vec<Certificate<'_>>, PckError> {
    chain
        .iter()
        .map(|der| Certificate::from_der(der))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| PckError::Malformed)
}

fn check_one_revocation(
    cert: &Certificate<'_>,
    issuer: &Certificate<'_>,
    crls: &CrlSet,
    now: DateTime<Utc>,
) -> Result<(), PckError> {
    for entry in &crls.entries {
        let crl = match CertificateList::from_der(&entry.der) {
            Ok(crl) => crl,
            Err(_) => continue,
        };

        if crl.tbs_cert_list.issuer != cert.tbs_certificate.issuer {
            continue;
        }

        // A stale CRL is no CRL.
        if let Some(next_update) = crl.tbs_cert_list.next_update {
            if next_update.to_system_time() <= now.into() {
                continue;
            }
        }

        let body = crl
            .tbs_cert_list
            .to_vec()
            .map_err(|_| PckError::Malformed)?;
        issuer
            .tbs_certificate
            .subject_public_key_info
            .verify(
                &body,
                crl.signature_algorithm,
                crl.signature.raw_bytes(),
            )
            .map_err(|_| PckError::ChainInvalid)?;

        if let Some(revoked) = crl.tbs_cert_list.revoked_certificates.as_ref() {
            for rc in revoked {
                if rc.serial_number == cert.tbs_certificate.serial_number {
                    return Err(PckError::Revoked);
                }
            }
        }

        return Ok(());
    }

    Err(PckError::CrlMissing)
}

#[derive(Clone, Debug, Sequence)]
struct ExtEntry<'a> {
    oid: ObjectIdentifier,
    value: AnyRef<'a>,
}

fn decode_uint(value: AnyRef<'_>) -> Result<u64, PckError> {
    let raw = value
        .decode_into::<UIntRef<'_>>()
        .map_err(|_| PckError::ExtensionMissing)?;

    let bytes = raw.as_bytes();
    if bytes.len() > 8 {
        return Err(PckError::ExtensionMissing);
    }

    Ok(bytes
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
}

struct SgxExtension {
    fmspc: Fmspc,
    comp_svn: [u8; 16],
    pcesvn: u16,
    pceid: u16,
}

impl SgxExtension {
    fn parse(value: &[u8]) -> Result<Self, PckError> {
        let entries =
            Vec::<ExtEntry<'_>>::from_der(value).map_err(|_| PckError::ExtensionMissing)?;

        let mut fmspc = None;
        let mut comp_svn = None;
        let mut pcesvn = None;
        let mut pceid = None;

        for entry in &entries {
            if entry.oid == SGX_EXTENSION_FMSPC_OID {
                let raw = entry
                    .value
                    .decode_into::<OctetStringRef<'_>>()
                    .map_err(|_| PckError::ExtensionMissing)?;
                let raw: [u8; 6] = raw
                    .as_bytes()
                    .try_into()
                    .map_err(|_| PckError::ExtensionMissing)?;
                fmspc = Some(Fmspc(raw));
            } else if entry.oid == SGX_EXTENSION_PCEID_OID {
                let raw = entry
                    .value
                    .decode_into::<OctetStringRef<'_>>()
                    .map_err(|_| PckError::ExtensionMissing)?;
                let raw: [u8; 2] = raw
                    .as_bytes()
                    .try_into()
                    .map_err(|_| PckError::ExtensionMissing)?;
                pceid = Some(u16::from_be_bytes(raw));
            } else if entry.oid == SGX_EXTENSION_TCB_OID {
                let inner = entry
                    .value
                    .decode_into::<Vec<ExtEntry<'_>>>()
                    .map_err(|_| PckError::ExtensionMissing)?;

                let mut svns = [0u8; 16];
                for item in &inner {
                    let arcs: Vec<u32> = item.oid.arcs().collect();
                    let comp = match arcs.last() {
                        Some(comp) if arcs.len() == 9 => *comp,
                        _ => continue,
                    };

                    if (1..=16).contains(&comp) {
                        let svn = decode_uint(item.value)?;
                        svns[(comp - 1) as usize] =
                            svn.try_into().map_err(|_| PckError::ExtensionMissing)?;
                    } else if comp == 17 {
                        let svn = decode_uint(item.value)?;
                        pcesvn =
                            Some(svn.try_into().map_err(|_| PckError::ExtensionMissing)?);
                    }
                    // Component 18 is the raw CPUSVN, identical to the
                    // sixteen component SVNs for SGX TCB type 0.
                }
                comp_svn = Some(svns);
            }
        }

        match (fmspc, comp_svn, pcesvn) {
            (Some(fmspc), Some(comp_svn), Some(pcesvn)) => Ok(Self {
                fmspc,
                comp_svn,
                pcesvn,
                pceid: pceid.unwrap_or(0),
            }),
            _ => Err(PckError::ExtensionMissing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEvidence;

    fn now() -> DateTime<Utc> {
        MockEvidence::valid_at()
    }

    #[test]
    fn mock_chain_verifies() {
        let mock = MockEvidence::new();
        let verifier = PckVerifier::with_root(mock.root_der());

        let info = verifier.verify_pck(&mock.pck_chain(), now()).unwrap();
        assert_eq!(info.fmspc, mock.fmspc());
        assert_eq!(info.pcesvn, MockEvidence::PCESVN);
        assert_eq!(info.cpusvn, MockEvidence::COMP_SVN);
    }

    #[test]
    fn intel_root_rejects_mock_chain() {
        let mock = MockEvidence::new();
        let verifier = PckVerifier::intel();

        match verifier.verify_pck(&mock.pck_chain(), now()) {
            Err(PckError::NotIntelRoot) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn expired_chain_is_rejected() {
        let mock = MockEvidence::new();
        let verifier = PckVerifier::with_root(mock.root_der());

        let late = now() + chrono::Duration::days(365 * 50);
        match verifier.verify_pck(&mock.pck_chain(), late) {
            Err(PckError::ChainExpired) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn tampered_leaf_is_rejected() {
        let mock = MockEvidence::new();
        let verifier = PckVerifier::with_root(mock.root_der());

        let mut chain = mock.pck_chain();
        let len = chain[0].len();
        chain[0][len - 1] ^= 0xFF;

        match verifier.verify_pck(&chain, now()) {
            Err(PckError::ChainInvalid) | Err(PckError::Malformed) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn revocation_checks_fail_closed() {
        let mock = MockEvidence::new();
        let verifier = PckVerifier::with_root(mock.root_der());

        match verifier.check_revocations(&mock.pck_chain(), &CrlSet::default(), now()) {
            Err(PckError::CrlMissing) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_crl_passes_revocation() {
        let mock = MockEvidence::new();
        let verifier = PckVerifier::with_root(mock.root_der());

        verifier
            .check_revocations(&mock.pck_chain(), &mock.crls(), now())
            .unwrap();
    }

    #[test]
    fn revoked_serial_is_detected() {
        let mock = MockEvidence::new();
        let verifier = PckVerifier::with_root(mock.root_der());

        let crls = mock.crls_revoking_pck();
        match verifier.check_revocations(&mock.pck_chain(), &crls, now()) {
            Err(PckError::Revoked) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
