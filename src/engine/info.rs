//! Read-only engine report.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::engine::stats::Quantile;
use crate::manifest::Manifest;
use crate::profile::Profile;
use crate::slave::SlaveStats;

/// Optional sections of [`Info`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InfoFlags {
    /// Include the full manifest.
    pub manifest: bool,
    /// Include the full profile.
    pub profile: bool,
    /// Include per-slave stats.
    pub slaves: bool,
}

impl InfoFlags {
    pub fn all() -> Self {
        Self {
            manifest: true,
            profile: true,
            slaves: true,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Info {
    pub app: String,
    pub uptime_ms: u64,
    pub profile_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    pub requests: RequestsInfo,
    pub queue: QueueInfo,
    pub pool: PoolInfo,
    pub timings: Vec<Quantile>,
    /// Open channels over the whole pool.
    pub load: usize,
    /// Operator-set population; `0` is the automatic policy.
    pub population: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RequestsInfo {
    pub accepted: u64,
    pub rejected: u64,
    pub expired: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueInfo {
    /// `0` means pressure-based admission.
    pub capacity: usize,
    pub depth: usize,
    pub oldest_event_age_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolInfo {
    pub capacity: usize,
    /// Active slaves with at least one open channel.
    pub active: usize,
    /// Active slaves without channels.
    pub idle: usize,
    pub size: usize,
    pub spawned: u64,
    pub crashed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slaves: Option<BTreeMap<String, SlaveStats>>,
}
