use gridwatch_common::domain::{DomainError, DomainResult};
use std::collections::HashMap;

/// Which power-manager agents depend on each battery device.
///
/// Parsed once at startup from a JSON object of the form
/// `{"SERIAL": ["agent-a", "agent-b"]}`. A malformed map is a
/// configuration error and fails startup rather than silently protecting
/// nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAgentMap {
    map: HashMap<String, Vec<String>>,
}

impl DeviceAgentMap {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let map: HashMap<String, Vec<String>> = serde_json::from_str(raw)
            .map_err(|e| DomainError::InvalidDeviceMap(format!("{}: {}", e, raw)))?;

        for (device, agents) in &map {
            if device.trim().is_empty() {
                return Err(DomainError::InvalidDeviceMap(
                    "device serial cannot be empty".to_string(),
                ));
            }
            if agents.iter().any(|a| a.trim().is_empty()) {
                return Err(DomainError::InvalidDeviceMap(format!(
                    "empty agent id for device '{}'",
                    device
                )));
            }
        }

        Ok(Self { map })
    }

    /// Agents mapped to a device. Unknown devices get an empty slice, the
    /// policy machine still runs for them.
    pub fn agents_for(&self, device: &str) -> &[String] {
        self.map.get(device).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
