// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! Deterministic attestation evidence for tests and the mock attestation
//! path.
//!
//! Everything here is derived from fixed P-256 scalars, so the same
//! evidence bytes come out on every run. The generated material exercises
//! the production code paths: quotes decode with the real codec, the PCK
//! chain verifies against a substitute root, and the TCB documents carry
//! real signatures.

use chrono::{DateTime, Duration, TimeZone, Utc};
use const_oid::ObjectIdentifier;
use cryptography::ext::{PrivateKeyInfoExt, TbsCertificateExt};
use cryptography::sec1::pkcs8::PrivateKeyInfo;
use cryptography::zeroize::Zeroizing;
use der::asn1::{BitStringRef, GeneralizedTime, UIntRef};
use der::{Decode, Encode};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature as EcdsaSig, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde_json::json;
use sha2::{Digest, Sha256};
use x509::crl::{CertificateList, RevokedCert, TbsCertList};
use x509::ext::Extension;
use x509::name::RdnSequence;
use x509::time::{Time, Validity};
use x509::TbsCertificate;

use crate::pck::{CrlSet, Fmspc, SGX_EXTENSION_OID};
use crate::quote::header::{Header, QE_VENDOR_ID_INTEL};
use crate::quote::report::{Report, REPORT_BODY_LEN, REPORT_LEN};
use crate::quote::sign::{CertificationData, EcdsaSignatureData, PpidEncryption, Signature};
use crate::quote::Quote;
use crate::tcb::{SignedQeIdentity, SignedTcbInfo, TcbBundle, TcbStatus};

// Fixed key material. Arbitrary nonzero scalars below the P-256 order.
const ROOT_SCALAR: [u8; 32] = [0x11; 32];
const PCK_SCALAR: [u8; 32] = [0x22; 32];
const TCB_SCALAR: [u8; 32] = [0x33; 32];
const ATT_SCALAR: [u8; 32] = [0x44; 32];

const SERIAL_ROOT: [u8; 1] = [1];
const SERIAL_PCK: [u8; 1] = [2];
const SERIAL_TCB: [u8; 1] = [3];

// Certificate validity window: 2020-01-01 through 2049-01-01.
const NOT_BEFORE_SECS: u64 = 1_577_836_800;
const NOT_AFTER_SECS: u64 = 2_493_072_000;

// Report body field offsets.
const CPUSVN_OFFSET: usize = 0;
const MISCSELECT_OFFSET: usize = 16;
const ATTRIBUTES_OFFSET: usize = 48;
const MRENCLAVE_OFFSET: usize = 64;
const MRSIGNER_OFFSET: usize = 128;
const ISVPRODID_OFFSET: usize = 256;
const ISVSVN_OFFSET: usize = 258;
const REPORTDATA_OFFSET: usize = 320;

/// Deterministic evidence: a substitute root CA, a PCK certificate with
/// the SGX extension, a TCB signing certificate, and an attestation key.
pub struct MockEvidence {
    root_key: Zeroizing<Vec<u8>>,
    root_der: Vec<u8>,
    pck_der: Vec<u8>,
    tcb_der: Vec<u8>,
}

impl Default for MockEvidence {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEvidence {
    pub const FMSPC_HEX: &'static str = "00906ED50000";
    pub const COMP_SVN: [u8; 16] = [2; 16];
    pub const PCESVN: u16 = 11;

    pub const QE_MRSIGNER: [u8; 32] = [0xA5; 32];
    pub const QE_ISVPRODID: u16 = 1;
    pub const QE_ISVSVN: u16 = 8;

    pub fn new() -> Self {
        let root_key = PrivateKeyInfo::from_scalar(&ROOT_SCALAR).unwrap();
        let pck_key = PrivateKeyInfo::from_scalar(&PCK_SCALAR).unwrap();
        let tcb_signing_key = PrivateKeyInfo::from_scalar(&TCB_SCALAR).unwrap();

        let root_der = {
            let pki = PrivateKeyInfo::from_der(root_key.as_ref()).unwrap();
            let rdns = RdnSequence::encode_from_string("CN=Mock SGX Root CA").unwrap();
            let rdns = RdnSequence::from_der(&rdns).unwrap();

            let tbs = TbsCertificate {
                version: x509::Version::V3,
                serial_number: UIntRef::new(&SERIAL_ROOT).unwrap(),
                signature: pki.signs_with().unwrap(),
                issuer: rdns.clone(),
                validity: validity(),
                subject: rdns,
                subject_public_key_info: pki.public_key().unwrap(),
                issuer_unique_id: None,
                subject_unique_id: None,
                extensions: None,
            };

            tbs.sign(&pki).unwrap()
        };

        let sgx_ext = sgx_extension_der();
        let pck_der = {
            let root_pki = PrivateKeyInfo::from_der(root_key.as_ref()).unwrap();
            let pck_pki = PrivateKeyInfo::from_der(pck_key.as_ref()).unwrap();

            let issuer = RdnSequence::encode_from_string("CN=Mock SGX Root CA").unwrap();
            let issuer = RdnSequence::from_der(&issuer).unwrap();
            let subject = RdnSequence::encode_from_string("CN=Mock SGX PCK Certificate").unwrap();
            let subject = RdnSequence::from_der(&subject).unwrap();

            let tbs = TbsCertificate {
                version: x509::Version::V3,
                serial_number: UIntRef::new(&SERIAL_PCK).unwrap(),
                signature: root_pki.signs_with().unwrap(),
                issuer,
                validity: validity(),
                subject,
                subject_public_key_info: pck_pki.public_key().unwrap(),
                issuer_unique_id: None,
                subject_unique_id: None,
                extensions: Some(vec![Extension {
                    extn_id: SGX_EXTENSION_OID,
                    critical: false,
                    extn_value: &sgx_ext,
                }]),
            };

            tbs.sign(&root_pki).unwrap()
        };

        let tcb_der = {
            let root_pki = PrivateKeyInfo::from_der(root_key.as_ref()).unwrap();
            let tcb_pki = PrivateKeyInfo::from_der(tcb_signing_key.as_ref()).unwrap();

            let issuer = RdnSequence::encode_from_string("CN=Mock SGX Root CA").unwrap();
            let issuer = RdnSequence::from_der(&issuer).unwrap();
            let subject = RdnSequence::encode_from_string("CN=Mock SGX TCB Signing").unwrap();
            let subject = RdnSequence::from_der(&subject).unwrap();

            let tbs = TbsCertificate {
                version: x509::Version::V3,
                serial_number: UIntRef::new(&SERIAL_TCB).unwrap(),
                signature: root_pki.signs_with().unwrap(),
                issuer,
                validity: validity(),
                subject,
                subject_public_key_info: tcb_pki.public_key().unwrap(),
                issuer_unique_id: None,
                subject_unique_id: None,
                extensions: None,
            };

            tbs.sign(&root_pki).unwrap()
        };

        Self {
            root_key,
            root_der,
            pck_der,
            tcb_der,
        }
    }

    /// A timestamp inside the validity window of all generated material.
    pub fn valid_at() -> DateTime<Utc> {
        // 2023-01-01T00:00:00Z
        Utc.timestamp_opt(1_672_531_200, 0).unwrap()
    }

    pub fn fmspc(&self) -> Fmspc {
        Fmspc::from_hex(Self::FMSPC_HEX).unwrap()
    }

    pub fn root_der(&self) -> Vec<u8> {
        self.root_der.clone()
    }

    /// The PCK chain as embedded in quotes, leaf first.
    pub fn pck_chain(&self) -> Vec<Vec<u8>> {
        vec![self.pck_der.clone(), self.root_der.clone()]
    }

    /// A CRL set with an empty CRL for every issued certificate.
    pub fn crls(&self) -> CrlSet {
        let mut crls = CrlSet::default();
        crls.push("mock://crl/root", self.crl(None));
        crls
    }

    /// A CRL set that revokes the PCK certificate.
    pub fn crls_revoking_pck(&self) -> CrlSet {
        let mut crls = CrlSet::default();
        crls.push("mock://crl/root", self.crl(Some(&SERIAL_PCK)));
        crls
    }

    /// Produces a quote over `report` signed by the mock attestation key
    /// and certified by the mock PCK chain. `report` may be a full REPORT
    /// or a bare report body.
    pub fn quote(&self, report: &[u8]) -> Vec<u8> {
        self.build_quote(report, CertificationData::PckChain {
            certs: self.pck_chain(),
        })
    }

    /// Produces a quote whose certification data is an encrypted PPID, for
    /// exercising the unsupported-certification-data path.
    pub fn quote_with_ppid(&self, report: &[u8]) -> Vec<u8> {
        self.build_quote(report, CertificationData::Ppid {
            encryption: PpidEncryption::Rsa3072Oaep,
            ppid: vec![0u8; 384],
            cpusvn: Self::COMP_SVN,
            pcesvn: Self::PCESVN,
            pceid: 0,
        })
    }

    fn build_quote(&self, report: &[u8], certification_data: CertificationData) -> Vec<u8> {
        let report = Report::try_from(report).expect("report too short");

        let att_key = SigningKey::from_bytes(&ATT_SCALAR).unwrap();
        let att_pub = VerifyingKey::from(&att_key).to_encoded_point(false);
        let att_pub: [u8; 64] = att_pub.as_bytes()[1..].try_into().unwrap();

        let authentication_data = vec![0xAA; 32];

        // QE report data binds the attestation key.
        let mut binding = Sha256::new();
        binding.update(att_pub);
        binding.update(&authentication_data);

        let mut qe_report = [0u8; REPORT_BODY_LEN];
        qe_report[CPUSVN_OFFSET..CPUSVN_OFFSET + 16].copy_from_slice(&[1u8; 16]);
        qe_report[MISCSELECT_OFFSET..MISCSELECT_OFFSET + 4].copy_from_slice(&[0u8; 4]);
        qe_report[ATTRIBUTES_OFFSET..ATTRIBUTES_OFFSET + 8]
            .copy_from_slice(&0x05u64.to_le_bytes());
        qe_report[ATTRIBUTES_OFFSET + 8..ATTRIBUTES_OFFSET + 16]
            .copy_from_slice(&0x03u64.to_le_bytes());
        qe_report[MRSIGNER_OFFSET..MRSIGNER_OFFSET + 32].copy_from_slice(&Self::QE_MRSIGNER);
        qe_report[ISVPRODID_OFFSET..ISVPRODID_OFFSET + 2]
            .copy_from_slice(&Self::QE_ISVPRODID.to_le_bytes());
        qe_report[ISVSVN_OFFSET..ISVSVN_OFFSET + 2]
            .copy_from_slice(&Self::QE_ISVSVN.to_le_bytes());
        qe_report[REPORTDATA_OFFSET..REPORTDATA_OFFSET + 32]
            .copy_from_slice(&binding.finalize());

        let pck_key = SigningKey::from_bytes(&PCK_SCALAR).unwrap();
        let qe_report_sig: EcdsaSig = pck_key.sign(&qe_report);

        let mut quote = Quote {
            header: Header {
                qe_svn: 7,
                pce_svn: Self::PCESVN,
                qe_vendor_id: QE_VENDOR_ID_INTEL,
                user_data: [0u8; 20],
            },
            report,
            signature: Signature::EcdsaP256(Box::new(EcdsaSignatureData {
                signature: [0u8; 64],
                attestation_key: att_pub,
                qe_report: Report::from(qe_report),
                qe_report_signature: qe_report_sig.as_ref().try_into().unwrap(),
                authentication_data,
                certification_data,
            })),
        };

        let quote_sig: EcdsaSig = att_key.sign(&quote.signed_data());
        if let Signature::EcdsaP256(data) = &mut quote.signature {
            data.signature = quote_sig.as_ref().try_into().unwrap();
        }

        quote.encode()
    }

    /// A TCB bundle whose single TCB level matches the mock PCK identifiers
    /// with status `UpToDate`.
    pub fn tcb_bundle(&self, now: DateTime<Utc>) -> TcbBundle {
        self.tcb_bundle_with_status(now, TcbStatus::UpToDate, &[])
    }

    /// A TCB bundle whose matching TCB level carries the given status and
    /// advisory IDs.
    pub fn tcb_bundle_with_status(
        &self,
        now: DateTime<Utc>,
        status: TcbStatus,
        advisories: &[&str],
    ) -> TcbBundle {
        let issue = pcs_ts(now - Duration::days(1));
        let update = pcs_ts(now + Duration::days(30));

        let components: Vec<_> = Self::COMP_SVN.iter().map(|svn| json!({ "svn": svn })).collect();
        let tcb_info = json!({
            "id": "SGX",
            "version": 3,
            "issueDate": issue,
            "nextUpdate": update,
            "fmspc": Self::FMSPC_HEX,
            "pceId": "0000",
            "tcbType": 0,
            "tcbEvaluationDataNumber": 12,
            "tcbLevels": [
                {
                    "tcb": { "sgxtcbcomponents": components, "pcesvn": Self::PCESVN },
                    "tcbDate": "2022-08-01T00:00:00Z",
                    "tcbStatus": status.to_string(),
                    "advisoryIDs": advisories,
                },
            ],
        })
        .to_string();

        let qe_identity = json!({
            "id": "QE",
            "version": 2,
            "issueDate": issue,
            "nextUpdate": update,
            "tcbEvaluationDataNumber": 12,
            "miscselect": "00000000",
            "miscselectMask": "ffffffff",
            "attributes": "05000000000000000300000000000000",
            "attributesMask": "ffffffffffffffffffffffffffffffff",
            "mrsigner": hex::encode(Self::QE_MRSIGNER),
            "isvprodid": Self::QE_ISVPRODID,
            "tcbLevels": [
                {
                    "tcb": { "isvsvn": 2 },
                    "tcbDate": "2022-08-01T00:00:00Z",
                    "tcbStatus": "UpToDate",
                },
            ],
        })
        .to_string();

        let mut certificates = pem(&self.tcb_der);
        certificates.extend_from_slice(&pem(&self.root_der));

        TcbBundle {
            tcb_info: SignedTcbInfo::new(self.sign_document("tcbInfo", &tcb_info)).unwrap(),
            qe_identity: SignedQeIdentity::new(self.sign_document("enclaveIdentity", &qe_identity))
                .unwrap(),
            certificates,
            crls: self.crls(),
        }
    }

    fn sign_document(&self, field: &str, body: &str) -> String {
        let key = SigningKey::from_bytes(&TCB_SCALAR).unwrap();
        let signature: EcdsaSig = key.sign(body.as_bytes());
        let signature = hex::encode(signature.as_ref());

        format!("{{\"{field}\":{body},\"signature\":\"{signature}\"}}")
    }

    fn crl(&self, revoked_serial: Option<&'static [u8]>) -> Vec<u8> {
        let pki = PrivateKeyInfo::from_der(self.root_key.as_ref()).unwrap();
        let rdns = RdnSequence::encode_from_string("CN=Mock SGX Root CA").unwrap();
        let rdns = RdnSequence::from_der(&rdns).unwrap();

        let revoked = revoked_serial.map(|serial| {
            vec![RevokedCert {
                serial_number: UIntRef::new(serial).unwrap(),
                revocation_date: time(NOT_BEFORE_SECS),
                crl_entry_extensions: None,
            }]
        });

        let tbs = TbsCertList {
            version: Default::default(),
            signature: pki.signs_with().unwrap(),
            issuer: rdns,
            this_update: time(NOT_BEFORE_SECS),
            next_update: Some(time(NOT_AFTER_SECS)),
            revoked_certificates: revoked,
            crl_extensions: None,
        };

        let body = tbs.to_vec().unwrap();
        let signature = pki.sign(&body, pki.signs_with().unwrap()).unwrap();

        CertificateList {
            tbs_cert_list: tbs,
            signature_algorithm: pki.signs_with().unwrap(),
            signature: BitStringRef::from_bytes(&signature).unwrap(),
        }
        .to_vec()
        .unwrap()
    }

}

/// A synthetic enclave REPORT with the given report data, in the full
/// REPORT layout the quoting service consumes.
pub fn enclave_report(report_data: &[u8; 64]) -> Vec<u8> {
    let mut report = vec![0u8; REPORT_LEN];
    report[CPUSVN_OFFSET..CPUSVN_OFFSET + 16].copy_from_slice(&[1u8; 16]);
    report[ATTRIBUTES_OFFSET..ATTRIBUTES_OFFSET + 8].copy_from_slice(&0x05u64.to_le_bytes());
    report[ATTRIBUTES_OFFSET + 8..ATTRIBUTES_OFFSET + 16]
        .copy_from_slice(&0x03u64.to_le_bytes());
    report[MRENCLAVE_OFFSET..MRENCLAVE_OFFSET + 32].copy_from_slice(&[0xE1; 32]);
    report[MRSIGNER_OFFSET..MRSIGNER_OFFSET + 32].copy_from_slice(&[0xE2; 32]);
    report[ISVPRODID_OFFSET..ISVPRODID_OFFSET + 2].copy_from_slice(&42u16.to_le_bytes());
    report[ISVSVN_OFFSET..ISVSVN_OFFSET + 2].copy_from_slice(&1u16.to_le_bytes());
    report[REPORTDATA_OFFSET..REPORTDATA_OFFSET + 64].copy_from_slice(report_data);
    report
}

fn validity() -> Validity {
    Validity {
        not_before: time(NOT_BEFORE_SECS),
        not_after: time(NOT_AFTER_SECS),
    }
}

fn time(secs: u64) -> Time {
    let at = std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs);
    Time::GeneralTime(GeneralizedTime::from_system_time(at).unwrap())
}

fn pcs_ts(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn pem(der: &[u8]) -> Vec<u8> {
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    let b64 = base64::encode(der);
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out.into_bytes()
}

fn sgx_extension_der() -> Vec<u8> {
    let tcb_base = "1.2.840.113741.1.13.1.2";

    let mut tcb_entries = Vec::new();
    for (index, svn) in MockEvidence::COMP_SVN.iter().enumerate() {
        let oid = ObjectIdentifier::new(&format!("{}.{}", tcb_base, index + 1)).unwrap();
        tcb_entries.extend_from_slice(&der_seq(&[der_oid(&oid), der_int(u64::from(*svn))]));
    }
    let pcesvn_oid = ObjectIdentifier::new(&format!("{tcb_base}.17")).unwrap();
    tcb_entries.extend_from_slice(&der_seq(&[
        der_oid(&pcesvn_oid),
        der_int(u64::from(MockEvidence::PCESVN)),
    ]));
    let cpusvn_oid = ObjectIdentifier::new(&format!("{tcb_base}.18")).unwrap();
    tcb_entries.extend_from_slice(&der_seq(&[
        der_oid(&cpusvn_oid),
        der_octet(&MockEvidence::COMP_SVN),
    ]));
    let tcb = der_tlv(0x30, &tcb_entries);

    let fmspc = hex::decode(MockEvidence::FMSPC_HEX).unwrap();

    let mut entries = Vec::new();
    entries.extend_from_slice(&der_seq(&[
        der_oid(&ObjectIdentifier::new("1.2.840.113741.1.13.1.2").unwrap()),
        tcb,
    ]));
    entries.extend_from_slice(&der_seq(&[
        der_oid(&ObjectIdentifier::new("1.2.840.113741.1.13.1.3").unwrap()),
        der_octet(&[0, 0]),
    ]));
    entries.extend_from_slice(&der_seq(&[
        der_oid(&ObjectIdentifier::new("1.2.840.113741.1.13.1.4").unwrap()),
        der_octet(&fmspc),
    ]));

    der_tlv(0x30, &entries)
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x100 {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
    out.extend_from_slice(content);
    out
}

fn der_seq(children: &[Vec<u8>]) -> Vec<u8> {
    let content: Vec<u8> = children.iter().flatten().copied().collect();
    der_tlv(0x30, &content)
}

fn der_oid(oid: &ObjectIdentifier) -> Vec<u8> {
    der_tlv(0x06, oid.as_bytes())
}

fn der_octet(bytes: &[u8]) -> Vec<u8> {
    der_tlv(0x04, bytes)
}

fn der_int(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 && bytes[start] == 0 {
        start += 1;
    }

    let mut content = bytes[start..].to_vec();
    if content[0] & 0x80 != 0 {
        content.insert(0, 0);
    }
    der_tlv(0x02, &content)
}
