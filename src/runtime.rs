// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

use core::fmt;
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};

use crate::protocol::Connection;

/// The 32-byte namespace identifying a runtime.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct RuntimeId(pub [u8; 32]);

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A handle to one running enclave instance.
///
/// Created when the sandbox launches the enclave. The worker holds only
/// the pieces it needs (connection, notifier, exit signal); the sandbox
/// side keeps the corresponding senders, so there is no reference cycle
/// between the two.
#[derive(Clone)]
pub struct RuntimeHandle {
    pub runtime_id: RuntimeId,
    pub version: Version,

    /// Transport to the enclave. The attestation driver is the only
    /// caller.
    pub connection: Arc<dyn Connection>,

    /// Level-triggered re-attestation requests. Multiple notifications
    /// during one attestation coalesce into a single follow-up.
    pub notify_update: Arc<Notify>,

    /// Becomes `true` when the enclave process exits.
    pub exit: watch::Receiver<bool>,
}

impl RuntimeHandle {
    /// Creates a handle plus the exit-signal sender retained by the
    /// sandbox side.
    pub fn new(
        runtime_id: RuntimeId,
        version: Version,
        connection: Arc<dyn Connection>,
    ) -> (Self, watch::Sender<bool>) {
        let (exit_tx, exit_rx) = watch::channel(false);

        (
            Self {
                runtime_id,
                version,
                connection,
                notify_update: Arc::new(Notify::new()),
                exit: exit_rx,
            },
            exit_tx,
        )
    }
}

/// Resolves when the process-exit signal fires or its sender goes away.
pub(crate) async fn exited(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
