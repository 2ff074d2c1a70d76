//! Backend Configuration

use serde::{Deserialize, Serialize};

use crate::BackendError;

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// First device slot used for guest queues; lower slots belong to the
    /// physical ports
    pub base_index: u32,
    /// Total device slots on the switch
    pub max_devices: u32,
    /// Interface name prefix, suffixed with the peer's interface index
    pub name_prefix: String,
    /// Handler name prefix, suffixed with the owner id
    pub handler_name_prefix: String,
    /// Device types this backend attaches to
    pub device_types: Vec<String>,
    /// First chain index of the shared pool
    pub pool_first_index: u32,
    /// Number of chains in the shared pool
    pub pool_size: u32,
    /// Enable receive checksum offload on registered interfaces
    pub rx_csum: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_index: 3,
            max_devices: 8,
            name_prefix: "vmq".into(),
            handler_name_prefix: "rswitch-vmq-osid".into(),
            device_types: vec!["renesas_vmq".into()],
            pool_first_index: 0,
            pool_size: 128,
            rx_csum: true,
        }
    }
}

impl BackendConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject configurations that leave no room for guest queues
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.base_index >= self.max_devices {
            return Err(BackendError::Config(format!(
                "base_index {} leaves no guest slots out of {}",
                self.base_index, self.max_devices
            )));
        }
        if self.name_prefix.is_empty() {
            return Err(BackendError::Config("name_prefix must not be empty".into()));
        }
        if self.device_types.is_empty() {
            return Err(BackendError::Config("device_types must not be empty".into()));
        }
        if self.pool_size < 2 {
            return Err(BackendError::Config(
                "pool_size must hold at least one chain pair".into(),
            ));
        }
        Ok(())
    }

    /// Guest interface indices this configuration can host
    pub fn guest_slots(&self) -> u32 {
        self.max_devices.saturating_sub(self.base_index)
    }

    /// Interface name for a peer interface index
    pub fn interface_name(&self, if_num: u32) -> String {
        format!("{}{}", self.name_prefix, if_num)
    }

    /// Handler name for an owner id
    pub fn handler_name(&self, osid: u32) -> String {
        format!("{}{}", self.handler_name_prefix, osid)
    }

    /// Whether a device type is handled by this backend
    pub fn matches(&self, device_type: &str) -> bool {
        self.device_types.iter().any(|t| t == device_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.guest_slots(), 5);
        assert_eq!(config.interface_name(2), "vmq2");
        assert_eq!(config.handler_name(5), "rswitch-vmq-osid5");
        assert!(config.matches("renesas_vmq"));
        assert!(!config.matches("vif"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BackendConfig =
            serde_json::from_str(r#"{ "base_index": 4, "name_prefix": "gq" }"#).unwrap();
        assert_eq!(config.base_index, 4);
        assert_eq!(config.interface_name(1), "gq1");
        assert_eq!(config.max_devices, 8);
    }

    #[test]
    fn test_validate_rejects_bad_layout() {
        let config = BackendConfig {
            base_index: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BackendError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("vmq-config-{}.json", std::process::id()));
        let path = path.to_string_lossy().to_string();

        let config = BackendConfig {
            pool_size: 32,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(BackendConfig::load(&path).unwrap(), config);
        let _ = std::fs::remove_file(&path);
    }
}
