// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! Attestation counters.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts};

use crate::runtime::RuntimeId;

lazy_static! {
    static ref ATTESTATIONS_PERFORMED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "warden_attestations_performed",
            "Number of TEE attestations performed.",
        ),
        &["runtime"],
    )
    .unwrap();
    static ref ATTESTATIONS_SUCCESSFUL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "warden_attestations_successful",
            "Number of successful TEE attestations.",
        ),
        &["runtime"],
    )
    .unwrap();
    static ref ATTESTATIONS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "warden_attestations_failed",
            "Number of failed TEE attestations.",
        ),
        &["runtime"],
    )
    .unwrap();
}

static REGISTER: Once = Once::new();

/// Registers the collectors with the default prometheus registry. Called
/// once at program entry; updating the counters does not require it.
pub fn init_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(ATTESTATIONS_PERFORMED.clone()),
            Box::new(ATTESTATIONS_SUCCESSFUL.clone()),
            Box::new(ATTESTATIONS_FAILED.clone()),
        ];
        for collector in collectors {
            // Double registration only happens when the embedding process
            // registered us already; not a reason to die.
            let _ = prometheus::register(collector);
        }
    });
}

/// Counts one attestation attempt. `performed` always increments;
/// exactly one of `successful` or `failed` increments alongside.
pub(crate) fn update_attestation_metrics(runtime_id: &RuntimeId, succeeded: bool) {
    let runtime = runtime_id.to_string();

    ATTESTATIONS_PERFORMED
        .with_label_values(&[&runtime])
        .inc();
    if succeeded {
        ATTESTATIONS_SUCCESSFUL
            .with_label_values(&[&runtime])
            .inc();
    } else {
        ATTESTATIONS_FAILED.with_label_values(&[&runtime]).inc();
    }
}

#[cfg(test)]
pub(crate) fn attestation_counts(runtime_id: &RuntimeId) -> (u64, u64, u64) {
    let runtime = runtime_id.to_string();
    (
        ATTESTATIONS_PERFORMED
            .with_label_values(&[&runtime])
            .get(),
        ATTESTATIONS_SUCCESSFUL
            .with_label_values(&[&runtime])
            .get(),
        ATTESTATIONS_FAILED.with_label_values(&[&runtime]).get(),
    )
}
