// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! The per-enclave attestation driver.
//!
//! For every runtime the driver negotiates an attestation backend,
//! initializes the enclave's attestation key material, and then produces
//! attestations on demand: obtain a quote over the enclave's REPORT,
//! verify it against Intel PCS collateral under the current consensus
//! policy, have the enclave countersign the result, and hand the
//! canonical artifact to the registration layer.

use std::sync::Arc;

use attestation::mock::MockEvidence;
use attestation::pck::PckError;
use attestation::quote::sign::CertificationData;
use attestation::quote::{DecodeError, Quote};
use attestation::tcb::{self, QuoteError};
use attestation::{Attestation, Fmspc, QuoteBundle, QuotePolicy, TcbBundle, Versioned};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::aesm::{AttestationKey, KeyAlgorithm, QuotingError, QuotingService};
use crate::cache::TcbCache;
use crate::config::{AttestationMode, Config, CALL_TIMEOUT};
use crate::metrics;
use crate::pcs::{PcsClient, PcsError};
use crate::protocol::{Request, Response, TransportError, TARGET_INFO_LEN};
use crate::registration::Registration;
use crate::registry::{ConsensusParameters, Height, Registry, RegistryError};
use crate::runtime::RuntimeHandle;
use crate::store::{Store, StoreError};
use crate::worker;

/// Failure of one attestation update.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("enclave transport: {0}")]
    Transport(#[from] TransportError),

    #[error("enclave error: {0}")]
    Enclave(String),

    #[error("quoting service: {0}")]
    Quoting(#[from] QuotingError),

    #[error("failed to parse quote: {0}")]
    QuoteDecode(#[from] DecodeError),

    #[error("PCK verification failed: {0}")]
    Pck(#[from] PckError),

    #[error("quote verification failed: {0}")]
    Verify(#[from] QuoteError),

    #[error("PCS: {0}")]
    Pcs(#[from] PcsError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("persistent store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Unsupported(&'static str),
}

/// A runtime's attestation context: the negotiated backend plus the last
/// produced attestation.
pub struct TeeState {
    method: TeeMethod,

    pub last_attestation: Option<Attestation>,
    pub last_refresh_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// The attestation backend, fixed at initialization time.
enum TeeMethod {
    Ecdsa(EcdsaMethod),
    Epid(EpidMethod),
    Mock(MockMethod),
}

impl TeeMethod {
    async fn target_info(&self, provisioner: &Provisioner) -> Result<Vec<u8>, UpdateError> {
        match self {
            Self::Ecdsa(method) => method.target_info(provisioner).await,
            Self::Epid(method) => method.target_info(provisioner).await,
            Self::Mock(_) => Ok(vec![0u8; TARGET_INFO_LEN]),
        }
    }

    async fn update(
        &self,
        provisioner: &Provisioner,
        handle: &RuntimeHandle,
        report: &[u8],
        nonce: &str,
    ) -> Result<Attestation, UpdateError> {
        match self {
            Self::Ecdsa(method) => method.update(provisioner, handle, report, nonce).await,
            Self::Epid(method) => method.update(provisioner, handle, report, nonce).await,
            Self::Mock(method) => method.update(provisioner, handle, report, nonce).await,
        }
    }
}

/// The SGX attestation provisioner shared by all runtimes on the host.
pub struct Provisioner {
    pub(crate) cfg: Config,
    pub(crate) quoting: Arc<dyn QuotingService>,
    pub(crate) pcs: Arc<dyn PcsClient>,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) registration: Arc<dyn Registration>,
    pub(crate) cache: TcbCache,
}

impl Provisioner {
    pub fn new(
        cfg: Config,
        quoting: Arc<dyn QuotingService>,
        pcs: Arc<dyn PcsClient>,
        registry: Arc<dyn Registry>,
        registration: Arc<dyn Registration>,
        store: Arc<dyn Store>,
    ) -> Result<Arc<Self>, StoreError> {
        let cache = TcbCache::new(store);
        let restored = cache.load()?;
        if restored > 0 {
            debug!(restored, "restored persisted TCB cache entries");
        }

        Ok(Arc::new(Self {
            cfg,
            quoting,
            pcs,
            registry,
            registration,
            cache,
        }))
    }

    /// Initializes attestation for a freshly launched enclave, produces
    /// the first attestation, and spawns the re-attestation worker.
    pub async fn provision(
        self: &Arc<Self>,
        handle: RuntimeHandle,
    ) -> Result<(Attestation, JoinHandle<()>), UpdateError> {
        let mut state = self.init_tee(&handle).await?;
        let attestation = self.update_tee(&mut state, &handle).await?;
        self.submit(&handle, &attestation).await;

        let worker = tokio::spawn(worker::attestation_worker(self.clone(), state, handle));

        Ok((attestation, worker))
    }

    /// Negotiates an attestation backend and delivers the QE target info
    /// to the enclave.
    pub async fn init_tee(&self, handle: &RuntimeHandle) -> Result<TeeState, UpdateError> {
        let (method, target_info) = match self.cfg.mode {
            AttestationMode::Mock => {
                let (method, target_info) = MockMethod::init(self).await?;
                (TeeMethod::Mock(method), target_info)
            }
            AttestationMode::Auto => match EcdsaMethod::init(self).await {
                Ok((method, target_info)) => (TeeMethod::Ecdsa(method), target_info),
                Err(err) => {
                    debug!(
                        runtime_id = %handle.runtime_id,
                        %err,
                        "ECDSA attestation initialization failed, trying EPID",
                    );
                    let (method, target_info) = EpidMethod::init(self).await?;
                    (TeeMethod::Epid(method), target_info)
                }
            },
        };

        self.rak_init(handle, target_info).await?;

        Ok(TeeState {
            method,
            last_attestation: None,
            last_refresh_at: None,
        })
    }

    /// Runs one attestation update, counting the attempt in the metrics.
    pub async fn update_tee(
        &self,
        state: &mut TeeState,
        handle: &RuntimeHandle,
    ) -> Result<Attestation, UpdateError> {
        let result = self.update_inner(state, handle).await;
        metrics::update_attestation_metrics(&handle.runtime_id, result.is_ok());

        if let Ok(attestation) = &result {
            state.last_attestation = Some(attestation.clone());
            state.last_refresh_at = Some((self.cfg.clock)());
        }

        result
    }

    async fn update_inner(
        &self,
        state: &TeeState,
        handle: &RuntimeHandle,
    ) -> Result<Attestation, UpdateError> {
        // Refresh the report target info in case the QE identity has
        // changed, e.g. after an aesmd upgrade.
        let target_info = state.method.target_info(self).await?;
        self.rak_init(handle, target_info).await?;

        let (report, nonce) = match self.call_enclave(handle, Request::RakReport).await? {
            Response::RakReport { report, nonce, .. } => (report, nonce),
            Response::Error { message } => return Err(UpdateError::Enclave(message)),
            _ => return Err(UpdateError::Transport(TransportError::UnexpectedResponse)),
        };

        state.method.update(self, handle, &report, &nonce).await
    }

    async fn rak_init(
        &self,
        handle: &RuntimeHandle,
        target_info: Vec<u8>,
    ) -> Result<(), UpdateError> {
        if target_info.len() > TARGET_INFO_LEN {
            return Err(UpdateError::Unsupported("oversized QE target info"));
        }

        match self
            .call_enclave(handle, Request::RakInit { target_info })
            .await?
        {
            Response::Empty => Ok(()),
            Response::Error { message } => Err(UpdateError::Enclave(message)),
            _ => Err(UpdateError::Transport(TransportError::UnexpectedResponse)),
        }
    }

    /// Decodes, verifies and finalizes an attestation from raw quote
    /// bytes. Shared by the ECDSA and mock backends.
    async fn finish_update(
        &self,
        handle: &RuntimeHandle,
        raw_quote: Vec<u8>,
    ) -> Result<Attestation, UpdateError> {
        let quote = Quote::decode(&raw_quote)?;

        let ecdsa = quote
            .ecdsa()
            .ok_or(UpdateError::Unsupported("unsupported attestation key type"))?;

        let chain = match &ecdsa.certification_data {
            CertificationData::PckChain { certs } => certs.clone(),
            CertificationData::Ppid { .. } => {
                // There is no PPID to PCK resolver here; a quote provider
                // has to be installed so quotes carry the full chain.
                return Err(UpdateError::Unsupported(
                    "PPID certification data not supported; install a quote provider",
                ));
            }
            _ => {
                return Err(UpdateError::Unsupported(
                    "unsupported certification data type",
                ));
            }
        };

        let now = (self.cfg.clock)();
        let pck_info = self.cfg.pck.verify_pck(&chain, now)?;

        // Always take a fresh policy read; the policy is never cached.
        let params = self.consensus_parameters().await?;
        let policy = params.quote_policy;

        let tcb = self.select_bundle(&quote, pck_info.fmspc, &policy).await?;
        let quote_bundle = QuoteBundle {
            quote: raw_quote,
            tcb,
        };

        let (height, signature) = match self
            .call_enclave(
                handle,
                Request::RakQuote {
                    quote: quote_bundle.clone(),
                },
            )
            .await?
        {
            Response::RakQuote { height, signature } => (height, signature),
            Response::Error { message } => return Err(UpdateError::Enclave(message)),
            _ => return Err(UpdateError::Transport(TransportError::UnexpectedResponse)),
        };

        Ok(Attestation {
            versioned: Versioned::default(),
            quote: quote_bundle,
            height,
            signature,
        })
    }

    /// Chooses the TCB bundle for this update: fresh first when a refresh
    /// is due, then cached, then a forced download. Makes at most two PCS
    /// calls per update.
    async fn select_bundle(
        &self,
        quote: &Quote,
        fmspc: Fmspc,
        policy: &QuotePolicy,
    ) -> Result<TcbBundle, UpdateError> {
        // Per-FMSPC slot: concurrent updates for the same platform share
        // one download.
        let _slot = self.cache.acquire(fmspc).await;

        let now = (self.cfg.clock)();
        let (cached, refresh) = self.cache.lookup(fmspc, now);

        let mut fresh_err = None;
        if refresh {
            match self.fetch_bundle(fmspc).await {
                Ok(fresh) => match self.verify_bundle(quote, policy, &fresh, "fresh") {
                    Ok(()) => {
                        self.cache.store(fmspc, fresh.clone(), now)?;
                        return Ok(fresh);
                    }
                    Err(err) => {
                        warn!(%err, "error verifying downloaded TCB refresh");
                        fresh_err = Some(err);
                    }
                },
                Err(err) => {
                    warn!(%err, "error downloading TCB refresh");
                    fresh_err = Some(err);
                }
            }
        }

        let mut cached_err = None;
        if let Some(cached) = cached {
            match self.verify_bundle(quote, policy, &cached, "cached") {
                Ok(()) => return Ok(cached),
                Err(err) => cached_err = Some(err),
            }
        }

        // If a download already happened this round, don't retry; the
        // cached bundle's error is the most informative one.
        if refresh {
            return Err(cached_err
                .or(fresh_err)
                .unwrap_or(UpdateError::Pcs(PcsError::Transport(
                    "no TCB bundle available".into(),
                ))));
        }

        // No scheduled refresh this round: force a download. Any failure
        // here is fatal to the update.
        let fresh = self.fetch_bundle(fmspc).await?;
        self.verify_bundle(quote, policy, &fresh, "downloaded")?;
        self.cache.store(fmspc, fresh.clone(), now)?;
        Ok(fresh)
    }

    async fn fetch_bundle(&self, fmspc: Fmspc) -> Result<TcbBundle, UpdateError> {
        timeout(CALL_TIMEOUT, self.pcs.tcb_bundle(fmspc))
            .await
            .map_err(|_| UpdateError::Pcs(PcsError::Timeout))?
            .map_err(UpdateError::Pcs)
    }

    fn verify_bundle(
        &self,
        quote: &Quote,
        policy: &QuotePolicy,
        bundle: &TcbBundle,
        which: &'static str,
    ) -> Result<(), UpdateError> {
        let now = (self.cfg.clock)();
        match tcb::verify_quote(quote, bundle, policy, now, &self.cfg.pck) {
            Ok(_) => Ok(()),
            Err(QuoteError::TcbOutOfDate {
                status,
                advisory_ids,
            }) => {
                error!(
                    which,
                    tcb_status = %status,
                    ?advisory_ids,
                    "TCB is not up to date",
                );
                Err(UpdateError::Verify(QuoteError::TcbOutOfDate {
                    status,
                    advisory_ids,
                }))
            }
            Err(err) => Err(UpdateError::Verify(err)),
        }
    }

    pub(crate) async fn consensus_parameters(&self) -> Result<ConsensusParameters, UpdateError> {
        timeout(
            CALL_TIMEOUT,
            self.registry.consensus_parameters(Height::Latest),
        )
        .await
        .map_err(|_| UpdateError::Registry(RegistryError::Timeout))?
        .map_err(UpdateError::Registry)
    }

    pub(crate) async fn call_enclave(
        &self,
        handle: &RuntimeHandle,
        request: Request,
    ) -> Result<Response, UpdateError> {
        timeout(CALL_TIMEOUT, handle.connection.call(request))
            .await
            .map_err(|_| UpdateError::Transport(TransportError::Timeout))?
            .map_err(UpdateError::Transport)
    }

    pub(crate) async fn submit(&self, handle: &RuntimeHandle, attestation: &Attestation) {
        if let Err(err) = self
            .registration
            .submit(&handle.runtime_id, attestation)
            .await
        {
            error!(runtime_id = %handle.runtime_id, %err, "failed to submit attestation");
        }
    }
}

struct EcdsaMethod {
    key: AttestationKey,
}

impl EcdsaMethod {
    async fn init(provisioner: &Provisioner) -> Result<(Self, Vec<u8>), UpdateError> {
        // The consensus layer has to support ECDSA attestations at all.
        let params = provisioner.consensus_parameters().await?;
        if !params.tee_features.sgx.pcs {
            return Err(UpdateError::Unsupported(
                "ECDSA attestation not supported by the registry",
            ));
        }

        let keys = timeout(CALL_TIMEOUT, provisioner.quoting.attestation_keys())
            .await
            .map_err(|_| UpdateError::Quoting(QuotingError::Timeout))??;
        let key = keys
            .into_iter()
            .find(|key| key.algorithm == KeyAlgorithm::EcdsaP256)
            .ok_or(UpdateError::Unsupported(
                "no suitable ECDSA attestation keys found",
            ))?;

        let method = Self { key };
        let target_info = method.target_info(provisioner).await?;
        Ok((method, target_info))
    }

    async fn target_info(&self, provisioner: &Provisioner) -> Result<Vec<u8>, UpdateError> {
        Ok(timeout(CALL_TIMEOUT, provisioner.quoting.target_info(&self.key))
            .await
            .map_err(|_| UpdateError::Quoting(QuotingError::Timeout))??)
    }

    async fn update(
        &self,
        provisioner: &Provisioner,
        handle: &RuntimeHandle,
        report: &[u8],
        _nonce: &str,
    ) -> Result<Attestation, UpdateError> {
        let raw_quote = timeout(CALL_TIMEOUT, provisioner.quoting.quote(&self.key, report))
            .await
            .map_err(|_| UpdateError::Quoting(QuotingError::Timeout))??;

        provisioner.finish_update(handle, raw_quote).await
    }
}

/// EPID is a compatibility-only backend: key negotiation and target-info
/// delivery share the state machine, but updates require verification
/// through the Intel Attestation Service, which is not wired in.
struct EpidMethod {
    key: AttestationKey,
}

impl EpidMethod {
    async fn init(provisioner: &Provisioner) -> Result<(Self, Vec<u8>), UpdateError> {
        let keys = timeout(CALL_TIMEOUT, provisioner.quoting.attestation_keys())
            .await
            .map_err(|_| UpdateError::Quoting(QuotingError::Timeout))??;
        let key = keys
            .into_iter()
            .find(|key| key.algorithm == KeyAlgorithm::Epid)
            .ok_or(UpdateError::Unsupported("no EPID attestation keys found"))?;

        let method = Self { key };
        let target_info = method.target_info(provisioner).await?;
        Ok((method, target_info))
    }

    async fn target_info(&self, provisioner: &Provisioner) -> Result<Vec<u8>, UpdateError> {
        Ok(timeout(CALL_TIMEOUT, provisioner.quoting.target_info(&self.key))
            .await
            .map_err(|_| UpdateError::Quoting(QuotingError::Timeout))??)
    }

    async fn update(
        &self,
        provisioner: &Provisioner,
        _handle: &RuntimeHandle,
        _report: &[u8],
        _nonce: &str,
    ) -> Result<Attestation, UpdateError> {
        let params = provisioner.consensus_parameters().await?;
        if params.tee_features.sgx.pcs {
            return Err(UpdateError::Unsupported(
                "EPID attestation key on a PCS-enabled registry",
            ));
        }

        Err(UpdateError::Unsupported(
            "EPID attestation requires an IAS endpoint",
        ))
    }
}

/// Deterministic mock backend for development nodes: synthetic quotes
/// that still run the full codec, verification and caching pipeline.
struct MockMethod {
    evidence: MockEvidence,
}

impl MockMethod {
    async fn init(provisioner: &Provisioner) -> Result<(Self, Vec<u8>), UpdateError> {
        let params = provisioner.consensus_parameters().await?;
        if !params.tee_features.sgx.pcs {
            return Err(UpdateError::Unsupported(
                "ECDSA attestation not supported by the registry",
            ));
        }

        Ok((
            Self {
                evidence: MockEvidence::new(),
            },
            vec![0u8; TARGET_INFO_LEN],
        ))
    }

    async fn update(
        &self,
        provisioner: &Provisioner,
        handle: &RuntimeHandle,
        report: &[u8],
        _nonce: &str,
    ) -> Result<Attestation, UpdateError> {
        let raw_quote = self.evidence.quote(report);
        provisioner.finish_update(handle, raw_quote).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use attestation::tcb::{self as tcb_verify, TcbStatus};
    use chrono::{Duration, Utc};

    use super::*;
    use crate::aesm::KeyAlgorithm;
    use crate::metrics::attestation_counts;
    use crate::testing::Fixture;

    #[tokio::test]
    async fn happy_path_ecdsa() {
        let fixture = Fixture::new(10);

        let mut state = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        let attestation = fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap();

        // The produced attestation verifies on its own.
        let quote = Quote::decode(&attestation.quote.quote).unwrap();
        let policy = fixture.registry.policy.lock().unwrap().clone();
        tcb_verify::verify_quote(
            &quote,
            &attestation.quote.tcb,
            &policy,
            Utc::now(),
            &fixture.provisioner.cfg.pck,
        )
        .unwrap();

        assert_eq!(attestation.height, 42);
        assert_eq!(attestation.signature.len(), 64);

        // One PCS download, now cached for the platform.
        assert_eq!(fixture.pcs.calls.load(Ordering::SeqCst), 1);
        let (cached, _) = fixture
            .provisioner
            .cache
            .lookup(fixture.evidence.fmspc(), Utc::now());
        assert!(cached.is_some());

        assert_eq!(attestation_counts(&fixture.handle.runtime_id), (1, 1, 0));
    }

    #[tokio::test]
    async fn accepted_advisories_round_trip() {
        let fixture = Fixture::new(11);

        *fixture.registry.policy.lock().unwrap() = attestation::QuotePolicy {
            allowed_tcb_statuses: vec![TcbStatus::UpToDate, TcbStatus::SWHardeningNeeded],
            allowed_advisories: vec!["INTEL-SA-00334".into()],
            ..attestation::QuotePolicy::default()
        };
        *fixture.pcs.bundle.lock().unwrap() = fixture.evidence.tcb_bundle_with_status(
            Utc::now(),
            TcbStatus::SWHardeningNeeded,
            &["INTEL-SA-00334"],
        );

        let mut state = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        let attestation = fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap();

        // The advisory IDs travel into the attestation unchanged.
        assert!(attestation
            .quote
            .tcb
            .tcb_info
            .as_str()
            .contains("INTEL-SA-00334"));
        assert_eq!(attestation_counts(&fixture.handle.runtime_id), (1, 1, 0));
    }

    #[tokio::test]
    async fn stale_cache_survives_a_pcs_outage() {
        let fixture = Fixture::new(12);
        let fmspc = fixture.evidence.fmspc();

        let mut state = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap();
        assert_eq!(fixture.pcs.calls.load(Ordering::SeqCst), 1);

        // Age the cache entry so a refresh is due, then take PCS down.
        let bundle = fixture.pcs.bundle.lock().unwrap().clone();
        fixture
            .provisioner
            .cache
            .store(fmspc, bundle, Utc::now() - Duration::hours(2))
            .unwrap();
        fixture.pcs.fail.store(true, Ordering::SeqCst);

        fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap();

        // One failed download; the cached bundle carried the update and
        // its refresh schedule did not advance.
        assert_eq!(fixture.pcs.calls.load(Ordering::SeqCst), 2);
        let (_, refresh) = fixture.provisioner.cache.lookup(fmspc, Utc::now());
        assert!(refresh);

        assert_eq!(attestation_counts(&fixture.handle.runtime_id), (2, 2, 0));
    }

    #[tokio::test]
    async fn tightened_policy_fails_with_the_cached_error() {
        let fixture = Fixture::new(13);
        let fmspc = fixture.evidence.fmspc();

        // First update under a policy that accepts SWHardeningNeeded.
        *fixture.registry.policy.lock().unwrap() = attestation::QuotePolicy {
            allowed_tcb_statuses: vec![TcbStatus::UpToDate, TcbStatus::SWHardeningNeeded],
            allowed_advisories: vec!["INTEL-SA-00334".into()],
            ..attestation::QuotePolicy::default()
        };
        let sw_bundle = fixture.evidence.tcb_bundle_with_status(
            Utc::now(),
            TcbStatus::SWHardeningNeeded,
            &["INTEL-SA-00334"],
        );
        *fixture.pcs.bundle.lock().unwrap() = sw_bundle.clone();

        let mut state = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap();

        // The policy tightens, the cache entry goes stale, and Intel
        // still serves the same status.
        *fixture.registry.policy.lock().unwrap() = attestation::QuotePolicy::default();
        fixture
            .provisioner
            .cache
            .store(fmspc, sw_bundle.clone(), Utc::now() - Duration::hours(2))
            .unwrap();

        let err = fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap_err();
        match err {
            UpdateError::Verify(QuoteError::TcbOutOfDate { status, .. }) => {
                assert_eq!(status, TcbStatus::SWHardeningNeeded);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Both bundles were tried; the cache entry was not replaced.
        assert_eq!(fixture.pcs.calls.load(Ordering::SeqCst), 2);
        let (cached, _) = fixture.provisioner.cache.lookup(fmspc, Utc::now());
        assert_eq!(cached.unwrap().tcb_info, sw_bundle.tcb_info);

        assert_eq!(attestation_counts(&fixture.handle.runtime_id), (2, 1, 1));
    }

    #[tokio::test]
    async fn ppid_certification_data_makes_no_network_calls() {
        let fixture = Fixture::new(14);
        fixture.quoting.ppid.store(true, Ordering::SeqCst);

        let mut state = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        let err = fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Unsupported(_)));
        assert_eq!(fixture.pcs.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.enclave.quote_calls.load(Ordering::SeqCst), 0);
        assert_eq!(attestation_counts(&fixture.handle.runtime_id), (1, 0, 1));
    }

    #[tokio::test]
    async fn concurrent_updates_share_one_download() {
        let fixture = Fixture::new(15);

        let mut state_a = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        let mut state_b = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();

        let (a, b) = tokio::join!(
            fixture.provisioner.update_tee(&mut state_a, &fixture.handle),
            fixture.provisioner.update_tee(&mut state_b, &fixture.handle),
        );
        a.unwrap();
        b.unwrap();

        // The same FMSPC refreshes once; the second update hits the cache.
        assert_eq!(fixture.pcs.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pcs_disabled_registry_falls_back_to_epid() {
        let fixture = Fixture::new(16);
        fixture.registry.pcs_enabled.store(false, Ordering::SeqCst);

        let mut state = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        assert_eq!(fixture.enclave.init_calls.load(Ordering::SeqCst), 1);

        // The EPID backend initializes but cannot verify without an IAS
        // endpoint.
        let err = fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap_err();
        match err {
            UpdateError::Unsupported(message) => assert!(message.contains("IAS")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_ecdsa_key_on_pcs_registry_is_terminal() {
        let fixture = Fixture::new(17);
        fixture.quoting.keys.lock().unwrap().retain(|key| {
            key.algorithm == KeyAlgorithm::Epid
        });

        let mut state = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        let err = fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap_err();
        match err {
            UpdateError::Unsupported(message) => assert!(message.contains("PCS-enabled")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_status_allowlist_fails_every_update() {
        let fixture = Fixture::new(18);
        *fixture.registry.policy.lock().unwrap() = attestation::QuotePolicy {
            allowed_tcb_statuses: Vec::new(),
            ..attestation::QuotePolicy::default()
        };

        let mut state = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        let err = fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Verify(QuoteError::PolicyViolation(_))
        ));
        assert_eq!(attestation_counts(&fixture.handle.runtime_id), (1, 0, 1));
    }

    #[tokio::test]
    async fn mock_mode_runs_the_full_pipeline() {
        let fixture = Fixture::with_mode(19, crate::config::AttestationMode::Mock);

        let mut state = fixture.provisioner.init_tee(&fixture.handle).await.unwrap();
        let attestation = fixture
            .provisioner
            .update_tee(&mut state, &fixture.handle)
            .await
            .unwrap();

        assert!(Quote::decode(&attestation.quote.quote).is_ok());
        assert_eq!(fixture.pcs.calls.load(Ordering::SeqCst), 1);
        let (cached, _) = fixture
            .provisioner
            .cache
            .lookup(fixture.evidence.fmspc(), Utc::now());
        assert!(cached.is_some());
    }
}
