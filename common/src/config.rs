use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime tunables. Operator-supplied credentials live in the persisted
/// store, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub sample_cycles: u32,
    pub sample_interval_ms: u64,
    pub wifi_poll_interval_ms: u64,
    /// Link checks before a steady-state connect gives up. `None` waits forever.
    pub wifi_connect_max_polls: Option<u32>,
    pub restart_delay_ms: u64,
    pub storage_namespace: String,
    pub ap_ssid: String,
    pub ap_password: String,
    pub device_model: String,
    pub default_device_name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sample_cycles: 10,
            sample_interval_ms: 1_000,
            wifi_poll_interval_ms: 500,
            wifi_connect_max_polls: Some(60),
            restart_delay_ms: 1_000,
            storage_namespace: "pref".to_string(),
            ap_ssid: "Temperature_Transmitter".to_string(),
            ap_password: String::new(),
            device_model: "ESP32".to_string(),
            default_device_name: "Temperature_Transmitter".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.sample_cycles = self.sample_cycles.clamp(1, 600);
        self.sample_interval_ms = self.sample_interval_ms.min(60_000);
        self.wifi_poll_interval_ms = self.wifi_poll_interval_ms.clamp(50, 10_000);
        self.restart_delay_ms = self.restart_delay_ms.clamp(100, 10_000);

        if self.storage_namespace.is_empty() || self.storage_namespace.len() > 15 {
            self.storage_namespace = "pref".to_string();
        }
        // WPA2 needs at least 8 characters; anything shorter falls back to an open AP.
        if !self.ap_password.is_empty() && self.ap_password.len() < 8 {
            self.ap_password.clear();
        }
        if self.ap_ssid.trim().is_empty() {
            self.ap_ssid = Self::default().ap_ssid;
        }
        if self.default_device_name.trim().is_empty() {
            self.default_device_name = Self::default().default_device_name;
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn wifi_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wifi_poll_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}
