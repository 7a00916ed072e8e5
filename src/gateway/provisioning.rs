use std::time::Duration;

use color_eyre::Result;
use eyre::{eyre, WrapErr};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;

use super::{
    mqtt::{await_connack, split_topic},
    SymmetricKey,
};
use crate::settings::ProvisioningSettings;

const PROVISIONING_API_VERSION: &str = "2019-03-31";
const RESPONSE_TOPICS: &str = "$dps/registrations/res/#";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    assigned_hub: Option<String>,
    error_message: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct RegistrationOperation {
    operation_id: String,
    status: String,
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, PartialEq)]
enum RegistrationStep {
    Assigned(String),
    Poll {
        operation_id: String,
        retry_after: Duration,
    },
}

/// Response topics look like `$dps/registrations/res/202/?$rid=1&retry-after=3`.
fn parse_response_topic(topic: &str) -> Option<(u16, Option<Duration>)> {
    let (path, query) = split_topic(topic);

    let status = path
        .strip_prefix("$dps/registrations/res/")?
        .trim_end_matches('/')
        .parse()
        .ok()?;
    let retry_after = query
        .get("retry-after")
        .and_then(|secs| secs.parse().ok())
        .map(Duration::from_secs);

    Some((status, retry_after))
}

fn registration_step(
    status: u16,
    retry_after: Option<Duration>,
    payload: &[u8],
) -> Result<RegistrationStep> {
    if status >= 300 {
        return Err(eyre!(
            "Provisioning service answered with status {}: {}",
            status,
            String::from_utf8_lossy(payload)
        ));
    }

    let de = &mut serde_json::Deserializer::from_slice(payload);
    let operation: RegistrationOperation = serde_path_to_error::deserialize(de)?;

    match operation.status.as_str() {
        "assigned" => operation
            .registration_state
            .and_then(|state| state.assigned_hub)
            .map(RegistrationStep::Assigned)
            .ok_or_else(|| eyre!("Registration assigned without a hub")),
        "assigning" | "unassigned" => Ok(RegistrationStep::Poll {
            operation_id: operation.operation_id,
            retry_after: retry_after.unwrap_or(DEFAULT_POLL_INTERVAL),
        }),
        other => {
            let reason = operation
                .registration_state
                .and_then(|state| state.error_message)
                .unwrap_or_default();

            Err(eyre!("Registration status is {} {}", other, reason))
        }
    }
}

fn mk_provisioning_options(
    settings: &ProvisioningSettings,
    device_id: &str,
    key: &SymmetricKey,
) -> MqttOptions {
    let mut options = MqttOptions::new(device_id, &settings.global_endpoint, settings.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_credentials(
        format!(
            "{}/registrations/{}/api-version={}",
            settings.id_scope, device_id, PROVISIONING_API_VERSION
        ),
        key.0.clone(),
    );
    options.set_transport(Transport::tls_with_default_config());

    options
}

/// Register the device with the provisioning service and return the host name
/// of the hub it was assigned to.
pub async fn register(
    settings: &ProvisioningSettings,
    device_id: &str,
    key: &SymmetricKey,
) -> Result<String> {
    let options = mk_provisioning_options(settings, device_id, key);
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    await_connack(&mut eventloop).await.wrap_err_with(|| {
        format!(
            "Failed to connect to provisioning endpoint {}",
            settings.global_endpoint
        )
    })?;

    client.subscribe(RESPONSE_TOPICS, QoS::AtLeastOnce).await?;

    let mut rid: u64 = 1;
    let body = serde_json::json!({ "registrationId": device_id }).to_string();
    client
        .publish(
            format!("$dps/registrations/PUT/iotdps-register/?$rid={}", rid),
            QoS::AtLeastOnce,
            false,
            body,
        )
        .await?;

    loop {
        let notification = eventloop
            .poll()
            .await
            .wrap_err("Provisioning connection failed")?;

        let Event::Incoming(Packet::Publish(publish)) = notification else {
            continue;
        };

        let Some((status, retry_after)) = parse_response_topic(&publish.topic) else {
            log::debug!("Ignoring message on topic {}", publish.topic);
            continue;
        };

        match registration_step(status, retry_after, &publish.payload)? {
            RegistrationStep::Assigned(hub) => {
                if let Err(e) = client.disconnect().await {
                    log::debug!("Failed to disconnect from provisioning endpoint: {:?}", e);
                }

                return Ok(hub);
            }
            RegistrationStep::Poll {
                operation_id,
                retry_after,
            } => {
                log::debug!(
                    "Registration of {} pending, checking again in {:?}",
                    device_id,
                    retry_after
                );
                tokio::time::sleep(retry_after).await;

                rid += 1;
                client
                    .publish(
                        format!(
                            "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={}&operationId={}",
                            rid, operation_id
                        ),
                        QoS::AtLeastOnce,
                        false,
                        "",
                    )
                    .await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_topic() {
        assert_eq!(
            parse_response_topic("$dps/registrations/res/202/?$rid=1&retry-after=3"),
            Some((202, Some(Duration::from_secs(3))))
        );
        assert_eq!(
            parse_response_topic("$dps/registrations/res/200/?$rid=2"),
            Some((200, None))
        );
        assert_eq!(parse_response_topic("$iothub/twin/res/200/?$rid=2"), None);
    }

    #[test]
    fn test_assigned_registration() {
        let payload = br#"{
            "operationId": "4.abc",
            "status": "assigned",
            "registrationState": {
                "registrationId": "room-device-01",
                "assignedHub": "iotc-1234.azure-devices.net",
                "deviceId": "room-device-01",
                "status": "assigned"
            }
        }"#;

        assert_eq!(
            registration_step(200, None, payload).unwrap(),
            RegistrationStep::Assigned("iotc-1234.azure-devices.net".to_string())
        );
    }

    #[test]
    fn test_pending_registration_polls() {
        let payload = br#"{"operationId": "4.abc", "status": "assigning"}"#;

        assert_eq!(
            registration_step(202, Some(Duration::from_secs(3)), payload).unwrap(),
            RegistrationStep::Poll {
                operation_id: "4.abc".to_string(),
                retry_after: Duration::from_secs(3)
            }
        );
        assert_eq!(
            registration_step(202, None, payload).unwrap(),
            RegistrationStep::Poll {
                operation_id: "4.abc".to_string(),
                retry_after: DEFAULT_POLL_INTERVAL
            }
        );
    }

    #[test]
    fn test_failed_registration() {
        let payload = br#"{
            "operationId": "4.abc",
            "status": "failed",
            "registrationState": { "errorMessage": "Device disabled" }
        }"#;
        let error = registration_step(200, None, payload).unwrap_err();
        assert!(error.to_string().contains("Device disabled"));

        assert!(registration_step(401, None, b"{\"message\":\"Unauthorized\"}").is_err());
    }
}
