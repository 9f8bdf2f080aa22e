// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! Intel Provisioning Certification Service client.

use std::time::Duration;

use async_trait::async_trait;
use attestation::pck::CrlSet;
use attestation::tcb::{SignedQeIdentity, SignedTcbInfo, TcbBundle};
use attestation::Fmspc;
use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Production PCS endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.trustedservices.intel.com";

const API_PREFIX: &str = "/sgx/certification/v4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PcsError {
    #[error("PCS transport: {0}")]
    Transport(String),

    #[error("PCS returned HTTP status {0}")]
    Status(u16),

    #[error("PCS response malformed: {0}")]
    Malformed(String),

    #[error("PCS request timed out")]
    Timeout,
}

impl From<reqwest::Error> for PcsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Fetches TCB collateral for a platform family.
#[async_trait]
pub trait PcsClient: Send + Sync {
    async fn tcb_bundle(&self, fmspc: Fmspc) -> Result<TcbBundle, PcsError>;
}

/// A [`PcsClient`] speaking the PCS v4 REST API.
pub struct HttpPcsClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpPcsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PcsError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(PcsError::from)?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn signed_document(
        &self,
        path: &str,
        chain_header: &str,
    ) -> Result<(String, Vec<u8>), PcsError> {
        let response = self
            .http
            .get(format!("{}{}{}", self.base_url, API_PREFIX, path))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PcsError::Status(status.as_u16()));
        }

        let chain = response
            .headers()
            .get(chain_header)
            .ok_or_else(|| PcsError::Malformed(format!("missing {chain_header} header")))?
            .to_str()
            .map_err(|_| PcsError::Malformed(format!("invalid {chain_header} header")))?;
        let chain = percent_decode_str(chain)
            .decode_utf8()
            .map_err(|_| PcsError::Malformed(format!("invalid {chain_header} header")))?
            .into_owned()
            .into_bytes();

        let body = response.text().await?;
        Ok((body, chain))
    }

    async fn crl(&self, ca: &str) -> Result<(String, Vec<u8>), PcsError> {
        let url = format!(
            "{}{}/pckcrl?ca={}&encoding=der",
            self.base_url, API_PREFIX, ca
        );
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PcsError::Status(status.as_u16()));
        }

        Ok((url, response.bytes().await?.to_vec()))
    }

    /// The root CA CRL, covering the intermediate PCK CAs. Served as a
    /// hex string by some PCS deployments and as raw DER by others.
    async fn root_ca_crl(&self) -> Result<(String, Vec<u8>), PcsError> {
        let url = format!("{}{}/rootcacrl", self.base_url, API_PREFIX);
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PcsError::Status(status.as_u16()));
        }

        let body = response.bytes().await?.to_vec();
        let der = match std::str::from_utf8(&body) {
            Ok(text) => hex::decode(text.trim()).unwrap_or(body),
            Err(_) => body,
        };

        Ok((url, der))
    }
}

#[async_trait]
impl PcsClient for HttpPcsClient {
    async fn tcb_bundle(&self, fmspc: Fmspc) -> Result<TcbBundle, PcsError> {
        let (tcb_info, certificates) = self
            .signed_document(
                &format!("/tcb?fmspc={}", hex::encode(fmspc.0)),
                "TCB-Info-Issuer-Chain",
            )
            .await?;

        let (qe_identity, _) = self
            .signed_document("/qe/identity", "SGX-Enclave-Identity-Issuer-Chain")
            .await?;

        // CRLs for both PCK issuing CAs; which one applies depends on the
        // platform's PCK chain. The root CA CRL covers the intermediates.
        let mut crls = CrlSet::default();
        for ca in ["processor", "platform"] {
            let (url, der) = self.crl(ca).await?;
            crls.push(url, der);
        }
        let (url, der) = self.root_ca_crl().await?;
        crls.push(url, der);

        Ok(TcbBundle {
            tcb_info: SignedTcbInfo::new(tcb_info)
                .map_err(|err| PcsError::Malformed(err.to_string()))?,
            qe_identity: SignedQeIdentity::new(qe_identity)
                .map_err(|err| PcsError::Malformed(err.to_string()))?,
            certificates,
            crls,
        })
    }
}
