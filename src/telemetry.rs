use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    climate::{ClimateMode, ClimateState, Entropy, SharedClimate},
    gateway::{DeviceClient, MessageBuilder},
};

pub const TELEMETRY_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetryPayload {
    #[serde(rename = "CurrentTemperature")]
    pub current_temperature: f64,
    #[serde(rename = "CurrentHumidity")]
    pub current_humidity: f64,
    #[serde(rename = "ClimateControlState")]
    pub climate_control_state: ClimateMode,
    #[serde(rename = "WarningEvent")]
    pub warning_event: Option<String>,
}

impl TelemetryPayload {
    pub fn new(state: &ClimateState, warning_event: Option<String>) -> Self {
        TelemetryPayload {
            current_temperature: state.current_temperature,
            current_humidity: state.current_humidity,
            climate_control_state: state.mode,
            warning_event,
        }
    }
}

pub async fn send_telemetry(client: &dyn DeviceClient, payload: &TelemetryPayload) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    let message = MessageBuilder::default()
        .body(body)
        .content_type("application/json")
        .content_encoding("utf-8")
        .build()?;

    client.send_event(message).await
}

/// Tick the climate, emit telemetry, wait, repeat, until `shutdown` flips to
/// true (or its sender goes away). A failed send drops that tick's payload.
pub async fn run_telemetry_loop(
    client: Arc<dyn DeviceClient>,
    climate: SharedClimate,
    mut entropy: Box<dyn Entropy>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let (payload, target_temperature) = {
            let mut state = climate.lock().await;
            let warning_event = state.tick(entropy.as_mut());
            (
                TelemetryPayload::new(&state, warning_event),
                state.target_temperature,
            )
        };

        // Only echo telemetry while the climate control is doing something
        let level = match payload.climate_control_state {
            ClimateMode::Idle => log::Level::Debug,
            _ => log::Level::Info,
        };
        log::log!(
            level,
            "{}: current temperature {:.2}, target temperature {:.2}, humidity {:.2}",
            payload.climate_control_state,
            payload.current_temperature,
            target_temperature,
            payload.current_humidity
        );
        if let Some(warning) = &payload.warning_event {
            log::warn!("{}", warning);
        }

        // A send stuck behind an unreachable hub must not hold up shutdown
        tokio::select! {
            result = send_telemetry(client.as_ref(), &payload) => match result {
                Ok(()) => log::debug!("Sent telemetry {:?}", payload),
                Err(e) => log::error!("Failed to send telemetry: {:?}", e),
            },
            _ = shutdown.changed() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(TELEMETRY_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    log::info!("Telemetry loop stopped");
}

pub fn start_telemetry_loop(
    client: Arc<dyn DeviceClient>,
    climate: &SharedClimate,
    entropy: Box<dyn Entropy>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let climate = climate.clone();

    tokio::spawn(run_telemetry_loop(client, climate, entropy, shutdown))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        climate::{mk_shared_climate, tests::FixedEntropy},
        gateway::fake::FakeClient,
    };

    fn quiet() -> Box<dyn Entropy> {
        Box::new(FixedEntropy {
            unit: 0.5,
            hit: false,
            pick: 1,
        })
    }

    #[test]
    fn test_payload_wire_format() {
        let state = ClimateState {
            current_temperature: 70.5,
            current_humidity: 44.5,
            mode: ClimateMode::Heating,
            ..ClimateState::default()
        };

        let value = serde_json::to_value(TelemetryPayload::new(&state, None)).unwrap();
        assert_eq!(
            value,
            json!({
                "CurrentTemperature": 70.5,
                "CurrentHumidity": 44.5,
                "ClimateControlState": "Heating",
                "WarningEvent": null
            })
        );

        let value = serde_json::to_value(TelemetryPayload::new(
            &state,
            Some("Warning: system error code 7".to_string()),
        ))
        .unwrap();
        assert_eq!(value["WarningEvent"], "Warning: system error code 7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_sends_json_events_until_cancelled() {
        let client = FakeClient::new();
        let climate = mk_shared_climate();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = start_telemetry_loop(Arc::new(client.clone()), &climate, quiet(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let events = client.events();
        assert!(events.len() >= 3, "expected at least 3 events, got {}", events.len());

        for event in &events {
            assert_eq!(event.content_type, "application/json");
            assert_eq!(event.content_encoding, "utf-8");

            let body: Value = serde_json::from_slice(&event.body).unwrap();
            assert_eq!(body["ClimateControlState"], "Idle");
            assert_eq!(body["CurrentTemperature"], 68.2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_do_not_stop_loop() {
        let client = FakeClient::new();
        client.fail_sends(true);
        let climate = mk_shared_climate();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = start_telemetry_loop(Arc::new(client.clone()), &climate, quiet(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(client.events().is_empty());
        assert!(!handle.is_finished());

        client.fail_sends(false);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(!client.events().is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_delay_exits_within_one_tick() {
        let client = FakeClient::new();
        let climate = mk_shared_climate();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = start_telemetry_loop(Arc::new(client.clone()), &climate, quiet(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(1400)).await;
        let sent_before_stop = client.events().len();
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(TELEMETRY_INTERVAL, handle)
            .await
            .expect("telemetry loop did not stop within one tick")
            .unwrap();

        assert_eq!(client.events().len(), sent_before_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_does_not_block_shutdown() {
        let client = FakeClient::new();
        client.stall_sends(true);
        let climate = mk_shared_climate();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = start_telemetry_loop(Arc::new(client.clone()), &climate, quiet(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(12_500)).await;
        assert!(!handle.is_finished());
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(TELEMETRY_INTERVAL, handle)
            .await
            .expect("telemetry loop stuck in a stalled send")
            .unwrap();
        assert!(client.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_shutdown_sender_stops_loop() {
        let client = FakeClient::new();
        let climate = mk_shared_climate();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = start_telemetry_loop(Arc::new(client), &climate, quiet(), shutdown_rx);
        drop(shutdown_tx);

        tokio::time::timeout(TELEMETRY_INTERVAL, handle)
            .await
            .expect("telemetry loop did not stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_drives_heating() {
        let client = FakeClient::new();
        let climate = mk_shared_climate();
        {
            let mut state = climate.lock().await;
            state.target_temperature = 70.0;
            state.mode = ClimateMode::Heating;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = start_telemetry_loop(Arc::new(client.clone()), &climate, quiet(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let state = climate.lock().await;
        assert_eq!(state.current_temperature, 70.0);
        assert_eq!(state.mode, ClimateMode::Idle);

        let last: Value = serde_json::from_slice(&client.events().last().unwrap().body).unwrap();
        assert_eq!(last["ClimateControlState"], "Idle");
    }
}
