// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Lock-free counters for engine statistics.
//!
//! Counters are plain atomics and serialize to their current value, so a
//! stats snapshot never takes an engine lock. Readers must tolerate the
//! transiently inconsistent view this implies.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

pub trait Metric {
    fn add(&self, value: u64);
    fn inc(&self) {
        self.add(1);
    }
    fn count(&self) -> u64;
}

/// A monotonically increasing counter.
#[derive(Default)]
pub struct IncMetric(AtomicU64);

impl IncMetric {
    pub const fn new() -> Self {
        IncMetric(AtomicU64::new(0))
    }
}

impl Metric for IncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for IncMetric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.count())
    }
}

impl std::fmt::Debug for IncMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.count())
    }
}

/// A gauge that stores the latest value.
#[derive(Default)]
pub struct StoreMetric(AtomicU64);

impl StoreMetric {
    pub const fn new() -> Self {
        StoreMetric(AtomicU64::new(0))
    }

    pub fn store(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn fetch_add(&self, value: u64) -> u64 {
        self.0.fetch_add(value, Ordering::Relaxed)
    }

    pub fn fetch_sub(&self, value: u64) -> u64 {
        self.0.fetch_sub(value, Ordering::Relaxed)
    }
}

impl Serialize for StoreMetric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.fetch())
    }
}

impl std::fmt::Debug for StoreMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fetch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Default, Serialize)]
    struct DemoMetrics {
        reads: IncMetric,
        inflight: StoreMetric,
    }

    #[test]
    fn counters_serialize_as_values() {
        let m = DemoMetrics::default();
        m.reads.add(3);
        m.inflight.store(7);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["reads"], 3);
        assert_eq!(json["inflight"], 7);
    }

    #[test]
    fn inc_metric_is_monotonic() {
        let m = IncMetric::new();
        m.inc();
        m.add(9);
        assert_eq!(m.count(), 10);
    }
}
