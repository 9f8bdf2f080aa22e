// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! The long-lived per-runtime attestation worker.

use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::driver::{Provisioner, TeeState};
use crate::runtime::{exited, RuntimeHandle};

/// Re-attests the runtime on a timer and on explicit request, until the
/// enclave process exits.
///
/// Notifications arriving while an attestation is in flight coalesce
/// into exactly one follow-up attestation. Update failures are counted
/// and logged; the worker simply tries again on the next trigger. The
/// exit signal aborts an in-flight update at its next suspension point.
pub(crate) async fn attestation_worker(
    provisioner: Arc<Provisioner>,
    mut state: TeeState,
    handle: RuntimeHandle,
) {
    let interval = provisioner.cfg.runtime_attest_interval;
    let mut exit = handle.exit.clone();

    let timer = sleep(interval);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = exited(&mut exit) => {
                info!(runtime_id = %handle.runtime_id, "runtime terminated, stopping attestation worker");
                return;
            }
            () = timer.as_mut() => {
                // Re-attest based on the configured interval.
            }
            _ = handle.notify_update.notified() => {
                // Re-attest on explicit request. Also reset the periodic
                // timer so we don't needlessly re-attest right after.
                timer.as_mut().reset(Instant::now() + interval);
            }
        }

        info!(runtime_id = %handle.runtime_id, "regenerating runtime attestation");

        tokio::select! {
            _ = exited(&mut exit) => {
                info!(runtime_id = %handle.runtime_id, "runtime terminated, stopping attestation worker");
                return;
            }
            result = provisioner.update_tee(&mut state, &handle) => match result {
                Ok(attestation) => provisioner.submit(&handle, &attestation).await,
                Err(err) => {
                    error!(
                        runtime_id = %handle.runtime_id,
                        %err,
                        "failed to regenerate runtime attestation",
                    );
                }
            }
        }

        timer.as_mut().reset(Instant::now() + interval);
    }
}
