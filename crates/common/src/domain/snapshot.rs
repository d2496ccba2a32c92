use crate::domain::DomainResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Published per-device state after decoding, validation and filtering.
///
/// This is the wire contract between the SOC bridge and the policy engine:
/// the bridge publishes it to `{base}/{serial}/json/state` and the policy
/// engine consumes it from there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Epoch milliseconds of the last accepted update.
    pub ts: i64,
    /// Device serial number.
    pub device: String,
    /// Filtered state of charge, 0-100.
    pub soc: f64,
    /// Last accepted per-module SOC values, sorted descending.
    pub soc_modules: Vec<u32>,
    /// Filtered grid-connection status.
    pub grid_connected: bool,
    /// Average temperature across valid battery modules.
    pub temp_celsius: f64,
}

/// Trait for publishing device snapshots to the message broker.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SnapshotPublisher: Send + Sync {
    /// Publish a single device snapshot.
    async fn publish(&self, snapshot: &DeviceSnapshot) -> DomainResult<()>;
}
