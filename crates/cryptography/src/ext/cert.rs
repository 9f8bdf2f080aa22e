// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

use std::time::SystemTime;

use anyhow::{anyhow, Result};
use const_oid::ObjectIdentifier;
use der::asn1::BitStringRef;
use der::Encode;
use pkcs8::PrivateKeyInfo;
use spki::AlgorithmIdentifier;
use x509::ext::Extension;
use x509::{Certificate, TbsCertificate};

use super::{PrivateKeyInfoExt, SubjectPublicKeyInfoExt};

pub trait TbsCertificateExt<'a> {
    /// Signs the `TbsCertificate` with the specified `PrivateKeyInfo`,
    /// returning the DER encoding of the resulting `Certificate`.
    fn sign(self, pki: &PrivateKeyInfo<'_>) -> Result<Vec<u8>>;

    /// Verifies a signature over a raw body using this certificate's key.
    ///
    /// The signature must be in the encoded form it would appear in an
    /// X.509 certificate, i.e. a DER ECDSA-Sig-Value.
    fn verify_raw(
        &self,
        body: &[u8],
        algo: AlgorithmIdentifier<'_>,
        signature: &[u8],
    ) -> Result<()>;

    /// Verifies that `cert` was issued and signed by this certificate,
    /// returning the body of the verified certificate.
    ///
    /// This checks the signature only. Validity windows are the caller's
    /// concern since the reference time is context-dependent.
    fn verify_crt<'r>(&self, cert: &'r Certificate<'a>) -> Result<&'r TbsCertificate<'a>>;

    /// Checks that `now` falls inside the certificate validity window.
    fn valid_at(&self, now: SystemTime) -> Result<()>;

    /// Looks up an extension by OID.
    fn extension(&self, oid: ObjectIdentifier) -> Option<&Extension<'a>>;
}

impl<'a> TbsCertificateExt<'a> for TbsCertificate<'a> {
    fn sign(self, pki: &PrivateKeyInfo<'_>) -> Result<Vec<u8>> {
        let algo = self.signature;
        let body = self.to_vec()?;
        let sign = pki.sign(&body, algo)?;

        let rval = Certificate {
            tbs_certificate: self,
            signature_algorithm: algo,
            signature: BitStringRef::from_bytes(&sign)?,
        };

        Ok(rval.to_vec()?)
    }

    fn verify_raw(
        &self,
        body: &[u8],
        algo: AlgorithmIdentifier<'_>,
        signature: &[u8],
    ) -> Result<()> {
        self.subject_public_key_info.verify(body, algo, signature)
    }

    fn verify_crt<'r>(&self, cert: &'r Certificate<'a>) -> Result<&'r TbsCertificate<'a>> {
        if cert.tbs_certificate.issuer != self.subject {
            return Err(anyhow!("subject mismatch"));
        }

        let body = cert.tbs_certificate.to_vec()?;
        let sign = cert
            .signature
            .as_bytes()
            .ok_or_else(|| anyhow!("invalid signature"))?;

        self.verify_raw(&body, cert.signature_algorithm, sign)?;
        Ok(&cert.tbs_certificate)
    }

    fn valid_at(&self, now: SystemTime) -> Result<()> {
        if self.validity.not_before.to_system_time() > now {
            return Err(anyhow!("certificate not yet valid"));
        }

        if self.validity.not_after.to_system_time() < now {
            return Err(anyhow!("certificate expired"));
        }

        Ok(())
    }

    fn extension(&self, oid: ObjectIdentifier) -> Option<&Extension<'a>> {
        self.extensions
            .as_ref()?
            .iter()
            .find(|ext| ext.extn_id == oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use const_oid::db::rfc5912::SECP_256_R_1 as P256;
    use der::asn1::{GeneralizedTime, UIntRef};
    use der::Decode;
    use x509::name::RdnSequence;
    use x509::time::{Time, Validity};

    fn self_signed(name: &str) -> (zeroize::Zeroizing<Vec<u8>>, Vec<u8>) {
        let key = PrivateKeyInfo::generate(P256).unwrap();
        let pki = PrivateKeyInfo::from_der(key.as_ref()).unwrap();

        let rdns = RdnSequence::encode_from_string(name).unwrap();
        let rdns = RdnSequence::from_der(&rdns).unwrap();

        let now = SystemTime::now();
        let dur = Duration::from_secs(60 * 60);
        let validity = Validity {
            not_before: Time::GeneralTime(GeneralizedTime::from_system_time(now).unwrap()),
            not_after: Time::GeneralTime(GeneralizedTime::from_system_time(now + dur).unwrap()),
        };

        let tbs = TbsCertificate {
            version: x509::Version::V3,
            serial_number: UIntRef::new(&[1u8]).unwrap(),
            signature: pki.signs_with().unwrap(),
            issuer: rdns.clone(),
            validity,
            subject: rdns,
            subject_public_key_info: pki.public_key().unwrap(),
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: None,
        };

        let crt = tbs.sign(&pki).unwrap();
        (key, crt)
    }

    #[test]
    fn self_signature_verifies() {
        let (_key, crt) = self_signed("CN=localhost");
        let crt = Certificate::from_der(&crt).unwrap();

        crt.tbs_certificate.verify_crt(&crt).unwrap();
        crt.tbs_certificate
            .valid_at(SystemTime::now())
            .unwrap();
    }

    #[test]
    fn issuer_mismatch_is_rejected() {
        let (_ka, crt_a) = self_signed("CN=a");
        let (_kb, crt_b) = self_signed("CN=b");
        let crt_a = Certificate::from_der(&crt_a).unwrap();
        let crt_b = Certificate::from_der(&crt_b).unwrap();

        assert!(crt_a.tbs_certificate.verify_crt(&crt_b).is_err());
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let (_key, crt) = self_signed("CN=localhost");
        let crt = Certificate::from_der(&crt).unwrap();

        let later = SystemTime::now() + Duration::from_secs(60 * 60 * 24);
        assert!(crt.tbs_certificate.valid_at(later).is_err());
    }
}
