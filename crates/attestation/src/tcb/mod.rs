// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! TCB bundle and quote verification against Intel PCS collateral.
//!
//! A TCB bundle pairs the two signed JSON documents served by the Intel
//! Provisioning Certification Service: the per-FMSPC TCB info and the QE
//! identity. Both are detached-signed by an Intel TCB signing certificate
//! which in turn chains to the pinned SGX root. The signed documents are
//! kept as their exact signed text so signature verification operates on
//! canonical bytes.

pub mod policy;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use p256::ecdsa::signature::{Signature as _, Verifier};
use p256::ecdsa::{Signature as EcdsaSig, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::pck::{CrlSet, PckError, PckVerifier};
use crate::quote::report::Report;
use crate::quote::sign::CertificationData;
use crate::quote::Quote;

pub use policy::{QuotePolicy, TcbStatus};

/// Timestamp format used by PCS collateral.
const PCS_TS_FMT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

const TCB_INFO_ID: &str = "SGX";
const TCB_INFO_VERSION: u32 = 3;
const QE_IDENTITY_ID: &str = "QE";
const QE_IDENTITY_VERSION: u32 = 2;

// The DEBUG bit of the report ATTRIBUTES.FLAGS field.
const ATTRIBUTE_DEBUG: u64 = 1 << 1;

/// Errors verifying a TCB bundle.
#[derive(Debug, Error)]
pub enum TcbError {
    #[error("malformed TCB collateral: {0}")]
    Malformed(&'static str),

    #[error("unexpected TCB collateral identifier")]
    UnexpectedIdentifier,

    #[error("unexpected TCB collateral version")]
    UnexpectedVersion,

    #[error("TCB collateral signature is invalid")]
    SignatureInvalid,

    #[error("TCB collateral is expired or not yet valid")]
    BundleExpired,

    #[error("TCB collateral exceeds the maximum age allowed by policy")]
    BundleTooOld,

    #[error(transparent)]
    Certificates(#[from] PckError),
}

/// Errors verifying a quote against a TCB bundle.
#[derive(Debug, Error)]
pub enum QuoteError {
    #[error(transparent)]
    Bundle(#[from] TcbError),

    #[error(transparent)]
    Pck(#[from] PckError),

    #[error("unsupported QE vendor")]
    UnsupportedQeVendor,

    #[error("unsupported attestation key type {0}")]
    UnsupportedSignature(u16),

    #[error("unsupported certification data: {0}")]
    UnsupportedCertData(&'static str),

    #[error("QE report signature is invalid")]
    QeReportSignature,

    #[error("QE identity mismatch: {0}")]
    QeIdentityMismatch(&'static str),

    #[error("attestation key does not match QE report data")]
    AttestationKeyBinding,

    #[error("quote signature is invalid")]
    QuoteSignature,

    #[error("TCB info does not match the quote")]
    TcbMismatch,

    #[error("TCB is not acceptable: status {status}, advisories {advisory_ids:?}")]
    TcbOutOfDate {
        status: TcbStatus,
        advisory_ids: Vec<String>,
    },

    #[error("policy violation: {0}")]
    PolicyViolation(&'static str),
}

/// Successfully verified quote contents, for consumers that need the
/// attested identity.
#[derive(Clone, Debug)]
pub struct VerifiedQuote {
    pub mr_enclave: [u8; 32],
    pub mr_signer: [u8; 32],
    pub report_data: Vec<u8>,
    pub tcb_status: TcbStatus,
    pub advisory_ids: Vec<String>,
}

/// The TCB bundle: everything needed to verify an ECDSA quote offline.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TcbBundle {
    pub tcb_info: SignedTcbInfo,
    pub qe_identity: SignedQeIdentity,
    /// PEM chain of the TCB signing certificate and the root it chains to.
    pub certificates: Vec<u8>,
    /// CRLs for the PCK CAs, keyed by issuer on lookup.
    #[serde(default)]
    pub crls: CrlSet,
}

impl TcbBundle {
    /// The `nextUpdate` timestamp of the TCB info, read without signature
    /// verification. Used for refresh scheduling only.
    pub fn next_update(&self) -> Result<DateTime<Utc>, TcbError> {
        let info: TcbInfo = serde_json::from_str(self.tcb_info.body()?)
            .map_err(|_| TcbError::Malformed("tcbInfo"))?;
        parse_pcs_ts(&info.next_update)
    }

    /// Verifies the issuer chain and returns the TCB signing key.
    fn signing_key(&self, pck: &PckVerifier, now: DateTime<Utc>) -> Result<VerifyingKey, TcbError> {
        let chain = rustls_pemfile::certs(&mut self.certificates.as_slice())
            .map_err(|_| TcbError::Malformed("certificates"))?;

        let spki = pck.chain_leaf_spki(&chain, now)?;
        VerifyingKey::from_sec1_bytes(&spki).map_err(|_| TcbError::Malformed("signing key"))
    }
}

/// A signed TCB info document, stored as the exact text served by PCS.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignedTcbInfo {
    raw: String,
}

impl SignedTcbInfo {
    pub fn new(raw: String) -> Result<Self, TcbError> {
        let this = Self { raw };
        this.body()?;
        this.signature()?;
        Ok(this)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn body(&self) -> Result<&str, TcbError> {
        signed_body(&self.raw, "tcbInfo").ok_or(TcbError::Malformed("tcbInfo"))
    }

    fn signature(&self) -> Result<EcdsaSig, TcbError> {
        parse_signature(&self.raw)
    }

    /// Verifies the signature and returns the validated TCB info.
    pub fn open(
        &self,
        now: DateTime<Utc>,
        policy: &QuotePolicy,
        key: &VerifyingKey,
    ) -> Result<TcbInfo, TcbError> {
        let body = self.body()?;
        key.verify(body.as_bytes(), &self.signature()?)
            .map_err(|_| TcbError::SignatureInvalid)?;

        let info: TcbInfo =
            serde_json::from_str(body).map_err(|_| TcbError::Malformed("tcbInfo"))?;
        info.validate(now, policy)?;
        Ok(info)
    }
}

/// A signed QE identity document, stored as the exact text served by PCS.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignedQeIdentity {
    raw: String,
}

impl SignedQeIdentity {
    pub fn new(raw: String) -> Result<Self, TcbError> {
        let this = Self { raw };
        this.body()?;
        this.signature()?;
        Ok(this)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn body(&self) -> Result<&str, TcbError> {
        signed_body(&self.raw, "enclaveIdentity").ok_or(TcbError::Malformed("enclaveIdentity"))
    }

    fn signature(&self) -> Result<EcdsaSig, TcbError> {
        parse_signature(&self.raw)
    }

    /// Verifies the signature and returns the validated QE identity.
    pub fn open(
        &self,
        now: DateTime<Utc>,
        policy: &QuotePolicy,
        key: &VerifyingKey,
    ) -> Result<QeIdentity, TcbError> {
        let body = self.body()?;
        key.verify(body.as_bytes(), &self.signature()?)
            .map_err(|_| TcbError::SignatureInvalid)?;

        let identity: QeIdentity =
            serde_json::from_str(body).map_err(|_| TcbError::Malformed("enclaveIdentity"))?;
        identity.validate(now, policy)?;
        Ok(identity)
    }
}

/// Slices the signed body out of a `{"<field>":<body>,"signature":"…"}`
/// document without re-serializing, preserving the canonical bytes.
fn signed_body<'a>(raw: &'a str, field: &str) -> Option<&'a str> {
    let rest = raw
        .strip_prefix("{\"")?
        .strip_prefix(field)?
        .strip_prefix("\":")?;
    let end = rest.rfind(",\"signature\"")?;
    Some(&rest[..end])
}

fn parse_signature(raw: &str) -> Result<EcdsaSig, TcbError> {
    #[derive(Deserialize)]
    struct Detached {
        signature: String,
    }

    let detached: Detached =
        serde_json::from_str(raw).map_err(|_| TcbError::Malformed("signature"))?;
    let bytes = hex::decode(detached.signature).map_err(|_| TcbError::Malformed("signature"))?;
    EcdsaSig::from_bytes(&bytes).map_err(|_| TcbError::Malformed("signature"))
}

fn parse_pcs_ts(raw: &str) -> Result<DateTime<Utc>, TcbError> {
    NaiveDateTime::parse_from_str(raw, PCS_TS_FMT)
        .map(|naive| naive.and_utc())
        .map_err(|_| TcbError::Malformed("timestamp"))
}

fn check_collateral_dates(
    issue_date: &str,
    next_update: &str,
    now: DateTime<Utc>,
    policy: &QuotePolicy,
) -> Result<(), TcbError> {
    let issue_date = parse_pcs_ts(issue_date)?;
    let next_update = parse_pcs_ts(next_update)?;

    if now < issue_date || now >= next_update {
        return Err(TcbError::BundleExpired);
    }

    if now - issue_date > Duration::days(policy.max_bundle_age_days.into()) {
        return Err(TcbError::BundleTooOld);
    }

    Ok(())
}

/// TCB info body.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcbInfo {
    pub id: String,
    pub version: u32,
    pub issue_date: String,
    pub next_update: String,
    pub fmspc: String,
    pub pce_id: String,
    pub tcb_type: u32,
    pub tcb_evaluation_data_number: u32,
    pub tcb_levels: Vec<TcbLevel>,
}

impl TcbInfo {
    pub fn validate(&self, now: DateTime<Utc>, policy: &QuotePolicy) -> Result<(), TcbError> {
        if self.id != TCB_INFO_ID {
            return Err(TcbError::UnexpectedIdentifier);
        }
        if self.version != TCB_INFO_VERSION {
            return Err(TcbError::UnexpectedVersion);
        }

        check_collateral_dates(&self.issue_date, &self.next_update, now, policy)
    }

    /// Finds the TCB level for the given platform identifiers.
    ///
    /// Among the levels at or below the platform's component SVNs and
    /// PCESVN, the one with the most recent `tcbDate` wins.
    pub fn lookup(
        &self,
        fmspc: &[u8; 6],
        comp_svn: &[u8; 16],
        pcesvn: u16,
    ) -> Result<&TcbLevel, QuoteError> {
        let expected = hex::decode(&self.fmspc).map_err(|_| QuoteError::TcbMismatch)?;
        if expected != fmspc {
            return Err(QuoteError::TcbMismatch);
        }

        self.tcb_levels
            .iter()
            .filter(|level| level.matches(comp_svn, pcesvn))
            // ISO 8601 timestamps order lexicographically.
            .max_by(|a, b| a.tcb_date.cmp(&b.tcb_date))
            .ok_or(QuoteError::TcbOutOfDate {
                status: TcbStatus::OutOfDate,
                advisory_ids: Vec::new(),
            })
    }
}

/// A platform TCB level.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcbLevel {
    pub tcb: TcbComponents,
    pub tcb_date: String,
    pub tcb_status: TcbStatus,
    #[serde(default, rename = "advisoryIDs")]
    pub advisory_ids: Vec<String>,
}

impl TcbLevel {
    fn matches(&self, comp_svn: &[u8; 16], pcesvn: u16) -> bool {
        if self.tcb.sgxtcbcomponents.len() != comp_svn.len() {
            return false;
        }

        for (have, level) in comp_svn.iter().zip(&self.tcb.sgxtcbcomponents) {
            if *have < level.svn {
                return false;
            }
        }

        pcesvn >= self.tcb.pcesvn
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcbComponents {
    pub sgxtcbcomponents: Vec<TcbComponent>,
    pub pcesvn: u16,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcbComponent {
    pub svn: u8,
}

/// QE identity body.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QeIdentity {
    pub id: String,
    pub version: u32,
    pub issue_date: String,
    pub next_update: String,
    pub tcb_evaluation_data_number: u32,
    pub miscselect: String,
    pub miscselect_mask: String,
    pub attributes: String,
    pub attributes_mask: String,
    pub mrsigner: String,
    pub isvprodid: u16,
    pub tcb_levels: Vec<EnclaveTcbLevel>,
}

impl QeIdentity {
    pub fn validate(&self, now: DateTime<Utc>, policy: &QuotePolicy) -> Result<(), TcbError> {
        if self.id != QE_IDENTITY_ID {
            return Err(TcbError::UnexpectedIdentifier);
        }
        if self.version != QE_IDENTITY_VERSION {
            return Err(TcbError::UnexpectedVersion);
        }

        check_collateral_dates(&self.issue_date, &self.next_update, now, policy)
    }

    /// Verifies the QE report against this identity.
    pub fn verify(&self, report: &Report) -> Result<(), QuoteError> {
        let body = report.body();

        let mr_signer =
            hex::decode(&self.mrsigner).map_err(|_| QuoteError::QeIdentityMismatch("MRSIGNER"))?;
        if mr_signer != body.mrsigner {
            return Err(QuoteError::QeIdentityMismatch("MRSIGNER"));
        }

        if self.isvprodid != body.enclave_product_id() {
            return Err(QuoteError::QeIdentityMismatch("ISVPRODID"));
        }

        let miscselect = parse_hex_u32(&self.miscselect)
            .ok_or(QuoteError::QeIdentityMismatch("miscselect"))?;
        let miscselect_mask = parse_hex_u32(&self.miscselect_mask)
            .ok_or(QuoteError::QeIdentityMismatch("miscselect"))?;
        if report.miscselect() & miscselect_mask != miscselect {
            return Err(QuoteError::QeIdentityMismatch("MISCSELECT"));
        }

        let (flags, xfrm) = parse_hex_attributes(&self.attributes)
            .ok_or(QuoteError::QeIdentityMismatch("attributes"))?;
        let (flags_mask, xfrm_mask) = parse_hex_attributes(&self.attributes_mask)
            .ok_or(QuoteError::QeIdentityMismatch("attributes"))?;
        if report.attributes_flags() & flags_mask != flags
            || report.attributes_xfrm() & xfrm_mask != xfrm
        {
            return Err(QuoteError::QeIdentityMismatch("ATTRIBUTES"));
        }

        // Find the QE TCB level for the report's ISVSVN; it must be up to
        // date for the quote to be trustworthy.
        let level = self
            .tcb_levels
            .iter()
            .find(|level| level.tcb.isvsvn <= body.enclave_security_version());
        match level {
            Some(level) if level.tcb_status == TcbStatus::UpToDate => Ok(()),
            Some(level) => Err(QuoteError::TcbOutOfDate {
                status: level.tcb_status,
                advisory_ids: level.advisory_ids.clone(),
            }),
            None => Err(QuoteError::TcbOutOfDate {
                status: TcbStatus::OutOfDate,
                advisory_ids: Vec::new(),
            }),
        }
    }
}

/// An enclave TCB level.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnclaveTcbLevel {
    pub tcb: EnclaveTcb,
    pub tcb_date: String,
    pub tcb_status: TcbStatus,
    #[serde(default, rename = "advisoryIDs")]
    pub advisory_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnclaveTcb {
    pub isvsvn: u16,
}

fn parse_hex_u32(raw: &str) -> Option<u32> {
    let bytes: [u8; 4] = hex::decode(raw).ok()?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn parse_hex_attributes(raw: &str) -> Option<(u64, u64)> {
    let bytes: [u8; 16] = hex::decode(raw).ok()?.try_into().ok()?;
    let flags = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    let xfrm = u64::from_le_bytes(bytes[8..].try_into().unwrap());
    Some((flags, xfrm))
}

/// Verifies a TCB bundle in isolation: issuer chain, both document
/// signatures, and the collateral validity windows.
pub fn verify_bundle(
    bundle: &TcbBundle,
    now: DateTime<Utc>,
    policy: &QuotePolicy,
    pck: &PckVerifier,
) -> Result<(), TcbError> {
    let key = bundle.signing_key(pck, now)?;
    bundle.qe_identity.open(now, policy, &key)?;
    bundle.tcb_info.open(now, policy, &key)?;
    Ok(())
}

/// Verifies a decoded quote against a TCB bundle under the given policy.
pub fn verify_quote(
    quote: &Quote,
    bundle: &TcbBundle,
    policy: &QuotePolicy,
    now: DateTime<Utc>,
    pck: &PckVerifier,
) -> Result<VerifiedQuote, QuoteError> {
    if policy.disabled {
        return Err(QuoteError::PolicyViolation("PCS attestation is disabled"));
    }
    if policy.allowed_tcb_statuses.is_empty() {
        return Err(QuoteError::PolicyViolation("no TCB status is acceptable"));
    }

    if quote.header.qe_vendor_id != crate::quote::header::QE_VENDOR_ID_INTEL {
        return Err(QuoteError::UnsupportedQeVendor);
    }

    let ecdsa = quote
        .ecdsa()
        .ok_or_else(|| QuoteError::UnsupportedSignature(quote.signature.key_type_tag()))?;

    // Open the bundle first; its documents gate everything else.
    let key = bundle.signing_key(pck, now)?;
    let qe_identity = bundle.qe_identity.open(now, policy, &key)?;
    let tcb_info = bundle.tcb_info.open(now, policy, &key)?;

    let chain = match &ecdsa.certification_data {
        CertificationData::PckChain { certs } => certs,
        CertificationData::Ppid { .. } => {
            return Err(QuoteError::UnsupportedCertData("PPID certification data"))
        }
    };

    let pck_info = pck.verify_pck(chain, now)?;
    pck.check_revocations(chain, &bundle.crls, now)?;

    // QE report signature, using the PCK public key.
    let pck_key = VerifyingKey::from_sec1_bytes(&pck_info.public_key)
        .map_err(|_| QuoteError::QeReportSignature)?;
    let qe_sig = EcdsaSig::from_bytes(&ecdsa.qe_report_signature)
        .map_err(|_| QuoteError::QeReportSignature)?;
    pck_key
        .verify(ecdsa.qe_report.as_bytes(), &qe_sig)
        .map_err(|_| QuoteError::QeReportSignature)?;

    qe_identity.verify(&ecdsa.qe_report)?;

    // The QE report data must bind the attestation key: the first half is
    // SHA-256(key ‖ authentication data), the second half zero.
    let mut expected = [0u8; 64];
    let mut hasher = Sha256::new();
    hasher.update(ecdsa.attestation_key);
    hasher.update(&ecdsa.authentication_data);
    expected[..32].copy_from_slice(&hasher.finalize());
    if expected != ecdsa.qe_report.body().reportdata {
        return Err(QuoteError::AttestationKeyBinding);
    }

    // Attestation key signature over the quote header and report body.
    let att_key = VerifyingKey::from_sec1_bytes(&ecdsa.attestation_key_sec1())
        .map_err(|_| QuoteError::QuoteSignature)?;
    let quote_sig =
        EcdsaSig::from_bytes(&ecdsa.signature).map_err(|_| QuoteError::QuoteSignature)?;
    att_key
        .verify(&quote.signed_data(), &quote_sig)
        .map_err(|_| QuoteError::QuoteSignature)?;

    if quote.report.attributes_flags() & ATTRIBUTE_DEBUG != 0 && !policy.allow_debug_enclaves {
        return Err(QuoteError::PolicyViolation("debug enclaves not allowed"));
    }

    let level = tcb_info.lookup(&pck_info.fmspc.0, &pck_info.cpusvn, pck_info.pcesvn)?;

    let acceptable = policy.allows_status(level.tcb_status)
        && (level.tcb_status == TcbStatus::UpToDate
            || policy.allows_advisories(&level.advisory_ids));
    if !acceptable {
        return Err(QuoteError::TcbOutOfDate {
            status: level.tcb_status,
            advisory_ids: level.advisory_ids.clone(),
        });
    }

    let body = quote.report.body();
    Ok(VerifiedQuote {
        mr_enclave: body.mrenclave,
        mr_signer: body.mrsigner,
        report_data: body.reportdata.to_vec(),
        tcb_status: level.tcb_status,
        advisory_ids: level.advisory_ids.clone(),
    })
}
