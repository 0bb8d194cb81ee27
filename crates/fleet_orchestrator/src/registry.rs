use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

/// One known robot and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    pub name: String,
    /// Bridge address of the robot.
    pub address: String,
    /// Characteristic commands are written to.
    pub write_uuid: uuid::Uuid,
}

/// Read-only robot registry, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RobotRegistry {
    devices: Vec<Device>,
}

impl RobotRegistry {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read robot registry at '{}'", path.display()))?;
        let registry: Self = serde_json::from_str(&raw).context("Failed to parse robot registry")?;
        if let Some(dup) = registry.first_duplicate() {
            anyhow::bail!("Robot '{dup}' is registered twice");
        }
        Ok(registry)
    }

    fn first_duplicate(&self) -> Option<&str> {
        let mut seen = std::collections::HashSet::new();
        self.devices
            .iter()
            .map(|d| d.name.as_str())
            .find(|name| !seen.insert(*name))
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
}
