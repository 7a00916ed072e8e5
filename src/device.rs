use std::sync::Arc;

use color_eyre::Result;
use eyre::WrapErr;
use futures::FutureExt;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    climate::{mk_shared_climate, Entropy, SharedClimate, SystemEntropy},
    commands::{mk_clean_system_handler, SharedEntropy, CLEAN_SYSTEM_METHOD},
    gateway::{DesiredPropertyCallback, DeviceClient, DeviceConnector, SymmetricKey},
    settings::DeviceSettings,
    telemetry::start_telemetry_loop,
    twin::{build_reported, sync_desired},
};

/// Report the current target temperature to the hub. Failures are logged only.
pub async fn send_reported_properties(client: &dyn DeviceClient, climate: &SharedClimate) {
    let reported = build_reported(&*climate.lock().await);

    match client.update_reported_properties(&reported).await {
        Ok(()) => log::info!("Sent reported properties {:?}", reported),
        Err(e) => log::error!("Failed to send reported properties: {:?}", e),
    }
}

async fn read_desired_properties_from_twin(client: &dyn DeviceClient, climate: &SharedClimate) {
    match client.get_twin().await {
        Ok(twin) => {
            if let Ok(json) = serde_json::to_string_pretty(&twin) {
                log::debug!("Got twin:\n{}", json);
            }
            sync_desired(climate, &twin.desired).await;
        }
        Err(e) => log::error!("Failed to get twin, keeping defaults: {:?}", e),
    }
}

fn mk_desired_property_callback(
    client: &Arc<dyn DeviceClient>,
    climate: &SharedClimate,
) -> DesiredPropertyCallback {
    let client = client.clone();
    let climate = climate.clone();

    Arc::new(move |desired| {
        let client = client.clone();
        let climate = climate.clone();

        async move {
            log::info!(
                "Received desired property update: {}",
                serde_json::Value::Object(desired.0.clone())
            );

            if sync_desired(&climate, &desired).await {
                send_reported_properties(client.as_ref(), &climate).await;
            }
        }
        .boxed()
    })
}

/// The simulated room device before it has registered.
pub struct Device<C: DeviceConnector> {
    connector: C,
    device_id: String,
    key: SymmetricKey,
    climate: SharedClimate,
    telemetry_entropy: Box<dyn Entropy>,
    command_entropy: SharedEntropy,
}

/// A connected device with its telemetry loop running.
pub struct RunningDevice {
    pub climate: SharedClimate,
    shutdown_tx: watch::Sender<bool>,
    telemetry: JoinHandle<()>,
}

impl<C: DeviceConnector> Device<C> {
    pub fn new(connector: C, settings: &DeviceSettings) -> Self {
        Self::with_entropy(
            connector,
            settings,
            Box::new(SystemEntropy::new()),
            Box::new(SystemEntropy::new()),
        )
    }

    pub fn with_entropy(
        connector: C,
        settings: &DeviceSettings,
        telemetry_entropy: Box<dyn Entropy>,
        command_entropy: Box<dyn Entropy>,
    ) -> Self {
        Device {
            connector,
            device_id: settings.id.clone(),
            key: settings.primary_key.clone(),
            climate: mk_shared_climate(),
            telemetry_entropy,
            command_entropy: Arc::new(tokio::sync::Mutex::new(command_entropy)),
        }
    }

    /// Register, connect, sync properties, install listeners and start the
    /// telemetry loop. Only registration and connection failures abort.
    pub async fn start(self) -> Result<RunningDevice> {
        log::info!("Will register device {}...", self.device_id);
        let hub = self
            .connector
            .register(&self.device_id, &self.key)
            .await
            .wrap_err_with(|| format!("Failed to register device {}", self.device_id))?;
        log::info!("Device {} was assigned to hub '{}'", self.device_id, hub);

        let client = self
            .connector
            .connect(&hub, &self.device_id, &self.key)
            .await
            .wrap_err_with(|| format!("Failed to create client for device {}", self.device_id))?;
        let client: Arc<dyn DeviceClient> = Arc::new(client);
        log::info!("Successfully created client for device {}", self.device_id);

        read_desired_properties_from_twin(client.as_ref(), &self.climate).await;

        let handler = mk_clean_system_handler(self.command_entropy.clone());
        match client.set_method_handler(CLEAN_SYSTEM_METHOD, handler).await {
            Ok(()) => log::info!("Now listening for direct method {}", CLEAN_SYSTEM_METHOD),
            Err(e) => log::error!(
                "Failed to listen for direct method {}: {:?}",
                CLEAN_SYSTEM_METHOD,
                e
            ),
        }

        let callback = mk_desired_property_callback(&client, &self.climate);
        match client.set_desired_property_callback(callback).await {
            Ok(()) => log::info!("Now listening for desired property updates"),
            Err(e) => log::error!("Failed to listen for desired property updates: {:?}", e),
        }

        send_reported_properties(client.as_ref(), &self.climate).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let telemetry =
            start_telemetry_loop(client, &self.climate, self.telemetry_entropy, shutdown_rx);

        Ok(RunningDevice {
            climate: self.climate,
            shutdown_tx,
            telemetry,
        })
    }
}

impl RunningDevice {
    /// Ask the telemetry loop to stop and wait until it has.
    pub async fn shutdown(self) -> Result<()> {
        // The loop also stops when the sender is gone, so a send error is fine
        let _ = self.shutdown_tx.send(true);

        self.telemetry
            .await
            .wrap_err("Telemetry loop did not shut down cleanly")?;

        let state = self.climate.lock().await;
        log::info!(
            "Stopped at {:.2} degrees ({}), target {:.2}",
            state.current_temperature,
            state.mode,
            state.target_temperature
        );

        Ok(())
    }
}
