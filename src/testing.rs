// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! Mock collaborators shared by the driver and worker tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use attestation::mock::{enclave_report, MockEvidence};
use attestation::{Attestation, Fmspc, PckVerifier, QuotePolicy, TcbBundle};
use chrono::Utc;
use semver::Version;
use tokio::sync::watch;

use crate::aesm::{AttestationKey, KeyAlgorithm, QuotingError, QuotingService};
use crate::config::{AttestationMode, Config};
use crate::driver::Provisioner;
use crate::pcs::{PcsClient, PcsError};
use crate::protocol::{Connection, Request, Response, TransportError, TARGET_INFO_LEN};
use crate::registration::{Registration, RegistrationError};
use crate::registry::{ConsensusParameters, Height, Registry, RegistryError, SgxFeatures, TeeFeatures};
use crate::runtime::{RuntimeHandle, RuntimeId};
use crate::store::MemoryStore;

/// An in-process enclave answering the attestation dialogue.
#[derive(Default)]
pub(crate) struct MockEnclave {
    pub init_calls: AtomicUsize,
    pub report_calls: AtomicUsize,
    pub quote_calls: AtomicUsize,

    /// Virtual seconds each RakReport call takes.
    pub report_delay_secs: AtomicU64,
    /// When set, RakReport never completes.
    pub hang_report: AtomicBool,
}

#[async_trait]
impl Connection for MockEnclave {
    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        match request {
            Request::RakInit { target_info } => {
                assert!(target_info.len() <= TARGET_INFO_LEN);
                self.init_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Response::Empty)
            }

            Request::RakReport => {
                self.report_calls.fetch_add(1, Ordering::SeqCst);

                if self.hang_report.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                let delay = self.report_delay_secs.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }

                Ok(Response::RakReport {
                    rak_pub: vec![1u8; 32],
                    rek_pub: vec![2u8; 32],
                    report: enclave_report(&[0x10; 64]),
                    nonce: "00000000".into(),
                })
            }

            Request::RakQuote { .. } => {
                self.quote_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Response::RakQuote {
                    height: 42,
                    signature: vec![9u8; 64],
                })
            }
        }
    }
}

/// A quoting service producing deterministic mock quotes.
pub(crate) struct MockQuotingService {
    evidence: MockEvidence,
    pub keys: Mutex<Vec<AttestationKey>>,
    /// Produce quotes with PPID certification data instead of a chain.
    pub ppid: AtomicBool,
    pub quote_calls: AtomicUsize,
}

impl Default for MockQuotingService {
    fn default() -> Self {
        Self {
            evidence: MockEvidence::new(),
            keys: Mutex::new(vec![
                AttestationKey {
                    id: vec![1],
                    algorithm: KeyAlgorithm::EcdsaP256,
                },
                AttestationKey {
                    id: vec![2],
                    algorithm: KeyAlgorithm::Epid,
                },
            ]),
            ppid: AtomicBool::new(false),
            quote_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl QuotingService for MockQuotingService {
    async fn attestation_keys(&self) -> Result<Vec<AttestationKey>, QuotingError> {
        Ok(self.keys.lock().unwrap().clone())
    }

    async fn target_info(&self, _key: &AttestationKey) -> Result<Vec<u8>, QuotingError> {
        Ok(vec![0u8; TARGET_INFO_LEN])
    }

    async fn quote(&self, _key: &AttestationKey, report: &[u8]) -> Result<Vec<u8>, QuotingError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);

        if self.ppid.load(Ordering::SeqCst) {
            Ok(self.evidence.quote_with_ppid(report))
        } else {
            Ok(self.evidence.quote(report))
        }
    }
}

/// A PCS client serving one configurable bundle.
pub(crate) struct MockPcsClient {
    pub bundle: Mutex<TcbBundle>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockPcsClient {
    fn new(bundle: TcbBundle) -> Self {
        Self {
            bundle: Mutex::new(bundle),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PcsClient for MockPcsClient {
    async fn tcb_bundle(&self, _fmspc: Fmspc) -> Result<TcbBundle, PcsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(PcsError::Transport("mock PCS outage".into()));
        }

        Ok(self.bundle.lock().unwrap().clone())
    }
}

pub(crate) struct MockRegistry {
    pub pcs_enabled: AtomicBool,
    pub policy: Mutex<QuotePolicy>,
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self {
            pcs_enabled: AtomicBool::new(true),
            policy: Mutex::new(QuotePolicy::default()),
        }
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn consensus_parameters(
        &self,
        _height: Height,
    ) -> Result<ConsensusParameters, RegistryError> {
        Ok(ConsensusParameters {
            tee_features: TeeFeatures {
                sgx: SgxFeatures {
                    pcs: self.pcs_enabled.load(Ordering::SeqCst),
                },
            },
            quote_policy: self.policy.lock().unwrap().clone(),
        })
    }
}

#[derive(Default)]
pub(crate) struct MockRegistration {
    pub submissions: Mutex<Vec<(RuntimeId, Attestation)>>,
}

#[async_trait]
impl Registration for MockRegistration {
    async fn submit(
        &self,
        runtime_id: &RuntimeId,
        attestation: &Attestation,
    ) -> Result<(), RegistrationError> {
        self.submissions
            .lock()
            .unwrap()
            .push((*runtime_id, attestation.clone()));
        Ok(())
    }
}

/// A fully wired provisioner over mock collaborators. Each test uses a
/// distinct runtime tag so the per-runtime metrics stay isolated.
pub(crate) struct Fixture {
    pub evidence: MockEvidence,
    pub enclave: Arc<MockEnclave>,
    pub quoting: Arc<MockQuotingService>,
    pub pcs: Arc<MockPcsClient>,
    pub registry: Arc<MockRegistry>,
    pub registration: Arc<MockRegistration>,
    pub provisioner: Arc<Provisioner>,
    pub handle: RuntimeHandle,

    exit_tx: watch::Sender<bool>,
}

impl Fixture {
    pub fn new(tag: u8) -> Self {
        Self::with_mode(tag, AttestationMode::Auto)
    }

    pub fn with_mode(tag: u8, mode: AttestationMode) -> Self {
        let evidence = MockEvidence::new();

        let enclave = Arc::new(MockEnclave::default());
        let quoting = Arc::new(MockQuotingService::default());
        let pcs = Arc::new(MockPcsClient::new(evidence.tcb_bundle(Utc::now())));
        let registry = Arc::new(MockRegistry::default());
        let registration = Arc::new(MockRegistration::default());

        let cfg = Config {
            runtime_attest_interval: Duration::from_secs(10 * 60),
            pck: PckVerifier::with_root(evidence.root_der()),
            mode,
            ..Config::default()
        };

        let provisioner = Provisioner::new(
            cfg,
            quoting.clone(),
            pcs.clone(),
            registry.clone(),
            registration.clone(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let (handle, exit_tx) = RuntimeHandle::new(
            RuntimeId([tag; 32]),
            Version::new(0, 1, 0),
            enclave.clone(),
        );

        Self {
            evidence,
            enclave,
            quoting,
            pcs,
            registry,
            registration,
            provisioner,
            handle,
            exit_tx,
        }
    }

    /// Signals enclave process exit.
    pub fn exit(&self) {
        let _ = self.exit_tx.send(true);
    }
}
