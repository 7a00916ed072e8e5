use color_eyre::Result;
use config::{builder::DefaultState, ConfigBuilder, ConfigError};
use eyre::eyre;
use serde::Deserialize;

use crate::gateway::SymmetricKey;

#[derive(Clone, Deserialize, Debug)]
pub struct DeviceSettings {
    pub id: String,
    pub primary_key: SymmetricKey,
}

#[derive(Clone, Deserialize, Debug)]
pub struct ProvisioningSettings {
    pub global_endpoint: String,
    pub id_scope: String,
    pub port: u16,
}

#[derive(Clone, Deserialize, Debug)]
pub struct HubSettings {
    pub port: u16,
    pub keep_alive_secs: u64,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Settings {
    pub device: DeviceSettings,
    pub provisioning: ProvisioningSettings,
    pub hub: HubSettings,
}

impl Settings {
    /// Reject settings that cannot possibly register.
    pub fn validate(&self) -> Result<()> {
        if self.device.id.is_empty() {
            return Err(eyre!("device.id must not be empty"));
        }
        if self.device.primary_key.0.is_empty() {
            return Err(eyre!(
                "device.primary_key is not set (Settings.toml or ROOM_DEVICE__DEVICE__PRIMARY_KEY)"
            ));
        }
        if self.provisioning.id_scope.is_empty() {
            return Err(eyre!("provisioning.id_scope must not be empty"));
        }

        Ok(())
    }
}

fn settings_builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    config::Config::builder()
        .set_default("device.id", "room-device-01")?
        .set_default("device.primary_key", "")?
        .set_default(
            "provisioning.global_endpoint",
            "global.azure-devices-provisioning.net",
        )?
        .set_default("provisioning.id_scope", "")?
        .set_default("provisioning.port", 8883)?
        .set_default("hub.port", 8883)?
        .set_default("hub.keep_alive_secs", 30)
}

pub fn read_settings() -> Result<Settings, ConfigError> {
    settings_builder()?
        .add_source(config::File::with_name("Settings").required(false))
        .add_source(
            config::Environment::with_prefix("ROOM_DEVICE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize::<Settings>()
}
