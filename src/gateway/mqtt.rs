use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use color_eyre::Result;
use eyre::{eyre, WrapErr};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS, Transport};
use serde::Deserialize;
use tokio::{
    sync::{oneshot, Mutex, RwLock},
    task,
};

use super::{
    provisioning, DesiredPropertyCallback, DeviceClient, DeviceConnector, Message, MethodHandler,
    MethodRequest, SymmetricKey, STATUS_NOT_IMPLEMENTED,
};
use crate::{
    settings::{HubSettings, ProvisioningSettings},
    twin::{DesiredProperties, ReportedProperties, Twin},
};

const HUB_API_VERSION: &str = "2021-04-12";

const TWIN_RESPONSE_TOPICS: &str = "$iothub/twin/res/#";
const DESIRED_PATCH_TOPICS: &str = "$iothub/twin/PATCH/properties/desired/#";
const METHOD_TOPICS: &str = "$iothub/methods/POST/#";

/// Split `path/?a=1&b=2` into its path and query pairs.
pub(super) fn split_topic(topic: &str) -> (&str, HashMap<&str, &str>) {
    let (path, query) = topic.split_once('?').unwrap_or((topic, ""));

    let query = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();

    (path, query)
}

/// Percent-encode a message property value for the telemetry topic.
fn encode_property(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());

    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }

    encoded
}

pub(super) fn telemetry_topic(device_id: &str, message: &Message) -> String {
    format!(
        "devices/{}/messages/events/$.ct={}&$.ce={}",
        device_id,
        encode_property(&message.content_type),
        encode_property(&message.content_encoding)
    )
}

#[derive(Debug, PartialEq)]
enum HubTopic {
    TwinResponse { status: u16, rid: u64 },
    DesiredPatch,
    MethodCall { name: String, rid: String },
    Unknown,
}

fn parse_hub_topic(topic: &str) -> HubTopic {
    let (path, query) = split_topic(topic);

    if let Some(status) = path.strip_prefix("$iothub/twin/res/") {
        let status = status.trim_end_matches('/').parse();
        let rid = query.get("$rid").and_then(|rid| rid.parse().ok());

        if let (Ok(status), Some(rid)) = (status, rid) {
            return HubTopic::TwinResponse { status, rid };
        }
    } else if path.starts_with("$iothub/twin/PATCH/properties/desired/") {
        return HubTopic::DesiredPatch;
    } else if let Some(name) = path.strip_prefix("$iothub/methods/POST/") {
        if let Some(rid) = query.get("$rid") {
            return HubTopic::MethodCall {
                name: name.trim_end_matches('/').to_string(),
                rid: rid.to_string(),
            };
        }
    }

    HubTopic::Unknown
}

#[derive(Debug)]
struct HubResponse {
    status: u16,
    body: Vec<u8>,
}

fn deserialize_body<T: for<'a> Deserialize<'a>>(body: &[u8]) -> Result<T> {
    let de = &mut serde_json::Deserializer::from_slice(body);
    let value: T = serde_path_to_error::deserialize(de)?;

    Ok(value)
}

#[derive(Default)]
struct HubState {
    next_rid: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<HubResponse>>>,
    method_handlers: RwLock<HashMap<String, MethodHandler>>,
    desired_callback: RwLock<Option<DesiredPropertyCallback>>,
}

/// Device session on a hub, speaking the hub's MQTT topic conventions.
#[derive(Clone)]
pub struct MqttDeviceClient {
    client: AsyncClient,
    device_id: String,
    state: Arc<HubState>,
}

fn hub_username(hub: &str, device_id: &str) -> String {
    format!("{}/{}/?api-version={}", hub, device_id, HUB_API_VERSION)
}

pub fn mk_hub_options(
    settings: &HubSettings,
    hub: &str,
    device_id: &str,
    key: &SymmetricKey,
) -> MqttOptions {
    let mut options = MqttOptions::new(device_id, hub, settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    options.set_credentials(hub_username(hub, device_id), key.0.clone());
    options.set_transport(Transport::tls_with_default_config());

    options
}

/// Poll until the broker acknowledges the connection.
pub(super) async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(eyre!(e)),
        }
    }
}

pub async fn mk_mqtt_device_client(
    settings: &HubSettings,
    hub: &str,
    device_id: &str,
    key: &SymmetricKey,
) -> Result<MqttDeviceClient> {
    let options = mk_hub_options(settings, hub, device_id, key);
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    await_connack(&mut eventloop)
        .await
        .wrap_err_with(|| format!("Failed to connect device {} to hub {}", device_id, hub))?;

    client.subscribe(TWIN_RESPONSE_TOPICS, QoS::AtMostOnce).await?;

    let device_client = MqttDeviceClient::new(client, device_id);

    start_hub_events_loop(eventloop, &device_client);

    Ok(device_client)
}

fn start_hub_events_loop(mut eventloop: EventLoop, device_client: &MqttDeviceClient) {
    let device_client = device_client.clone();

    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let result = device_client.handle_incoming_publish(publish).await;

                    if let Err(e) = result {
                        log::error!("Error while handling hub message: {:?}", e);
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    log::info!("Reconnected to hub");

                    if let Err(e) = device_client.resubscribe().await {
                        log::error!("Failed to restore hub subscriptions: {:?}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("MQTT error: {:?}", e);
                    device_client.fail_pending_requests().await;

                    // rumqttc reconnects on the next poll
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });
}

/// Status to answer a method call with, 501 when nothing handles `name`.
async fn answer_method(handler: Option<MethodHandler>, request: MethodRequest) -> u16 {
    match handler {
        Some(handler) => handler(request).await.status,
        None => {
            log::warn!("No handler registered for direct method {}", request.name);
            STATUS_NOT_IMPLEMENTED
        }
    }
}

fn method_response_topic(status: u16, rid: &str) -> String {
    format!("$iothub/methods/res/{}/?$rid={}", status, rid)
}

impl MqttDeviceClient {
    fn new(client: AsyncClient, device_id: &str) -> Self {
        MqttDeviceClient {
            client,
            device_id: device_id.to_string(),
            state: Default::default(),
        }
    }

    /// Topic filters this session needs, given the handlers registered so far.
    async fn subscriptions(&self) -> Vec<&'static str> {
        let mut filters = vec![TWIN_RESPONSE_TOPICS];

        if self.state.desired_callback.read().await.is_some() {
            filters.push(DESIRED_PATCH_TOPICS);
        }
        if !self.state.method_handlers.read().await.is_empty() {
            filters.push(METHOD_TOPICS);
        }

        filters
    }

    /// Subscriptions do not survive a reconnect with a clean session, so
    /// restore them on every ConnAck. Runs on the event loop task and must
    /// not wait on the request queue that task drains.
    async fn resubscribe(&self) -> Result<Vec<&'static str>> {
        let filters = self.subscriptions().await;

        for filter in &filters {
            self.client
                .try_subscribe(*filter, QoS::AtMostOnce)
                .wrap_err_with(|| format!("Failed to subscribe to {}", filter))?;
        }

        Ok(filters)
    }

    /// Twin responses never arrive for requests sent on a dropped connection.
    /// Dropping their senders wakes the waiters with an error.
    async fn fail_pending_requests(&self) {
        let mut pending = self.state.pending.lock().await;

        if !pending.is_empty() {
            log::warn!("Abandoning {} twin request(s) after connection loss", pending.len());
            pending.clear();
        }
    }

    async fn handle_incoming_publish(&self, publish: Publish) -> Result<()> {
        match parse_hub_topic(&publish.topic) {
            HubTopic::TwinResponse { status, rid } => {
                let pending = self.state.pending.lock().await.remove(&rid);

                match pending {
                    Some(tx) => {
                        // Requester may have gone away; nothing left to do then
                        let _ = tx.send(HubResponse {
                            status,
                            body: publish.payload.to_vec(),
                        });
                    }
                    None => log::debug!("Unexpected twin response for request {}", rid),
                }
            }
            HubTopic::DesiredPatch => {
                let desired: DesiredProperties = deserialize_body(&publish.payload)?;
                let callback = self.state.desired_callback.read().await.clone();

                if let Some(callback) = callback {
                    task::spawn(callback(desired));
                }
            }
            HubTopic::MethodCall { name, rid } => {
                let handler = self.state.method_handlers.read().await.get(&name).cloned();
                let client = self.client.clone();
                let payload = (!publish.payload.is_empty()).then(|| publish.payload.to_vec());

                task::spawn(async move {
                    let status = answer_method(handler, MethodRequest { name, payload }).await;

                    let topic = method_response_topic(status, &rid);
                    if let Err(e) = client.try_publish(topic, QoS::AtMostOnce, false, "") {
                        log::error!("Failed to respond to direct method: {:?}", e);
                    }
                });
            }
            HubTopic::Unknown => {
                log::debug!("Ignoring message on topic {}", publish.topic);
            }
        }

        Ok(())
    }

    /// Publish a twin request and wait for the hub's response to it.
    async fn twin_request(&self, topic_prefix: &str, payload: Vec<u8>) -> Result<HubResponse> {
        let rid = self.state.next_rid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.state.pending.lock().await.insert(rid, tx);

        let topic = format!("{}?$rid={}", topic_prefix, rid);
        if let Err(e) = self.client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            self.state.pending.lock().await.remove(&rid);
            return Err(e.into());
        }

        rx.await
            .map_err(|_| eyre!("Hub connection closed before twin request {} completed", rid))
    }
}

#[async_trait]
impl DeviceClient for MqttDeviceClient {
    async fn get_twin(&self) -> Result<Twin> {
        let response = self.twin_request("$iothub/twin/GET/", vec![]).await?;

        if response.status != 200 {
            return Err(eyre!("Twin request failed with status {}", response.status));
        }

        deserialize_body(&response.body)
    }

    async fn update_reported_properties(&self, reported: &ReportedProperties) -> Result<()> {
        let body = serde_json::to_vec(reported)?;
        let response = self
            .twin_request("$iothub/twin/PATCH/properties/reported/", body)
            .await?;

        match response.status {
            200..=299 => Ok(()),
            status => Err(eyre!("Reported properties rejected with status {}", status)),
        }
    }

    /// Queues the event without waiting. While the hub is unreachable the
    /// request queue fills up and further events fail instead of piling up.
    async fn send_event(&self, message: Message) -> Result<()> {
        let topic = telemetry_topic(&self.device_id, &message);

        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, message.body)
            .wrap_err("Telemetry not queued")?;

        Ok(())
    }

    async fn set_method_handler(&self, name: &str, handler: MethodHandler) -> Result<()> {
        let first = {
            let mut handlers = self.state.method_handlers.write().await;
            let first = handlers.is_empty();
            handlers.insert(name.to_string(), handler);
            first
        };

        if first {
            self.client.try_subscribe(METHOD_TOPICS, QoS::AtMostOnce)?;
        }

        Ok(())
    }

    async fn set_desired_property_callback(&self, callback: DesiredPropertyCallback) -> Result<()> {
        let previous = self.state.desired_callback.write().await.replace(callback);

        if previous.is_none() {
            self.client.try_subscribe(DESIRED_PATCH_TOPICS, QoS::AtMostOnce)?;
        }

        Ok(())
    }
}

/// Registers through the provisioning endpoint, then connects to the
/// assigned hub, both over MQTT.
#[derive(Clone, Debug)]
pub struct MqttDeviceConnector {
    provisioning: ProvisioningSettings,
    hub: HubSettings,
}

impl MqttDeviceConnector {
    pub fn new(provisioning: &ProvisioningSettings, hub: &HubSettings) -> Self {
        MqttDeviceConnector {
            provisioning: provisioning.clone(),
            hub: hub.clone(),
        }
    }
}

#[async_trait]
impl DeviceConnector for MqttDeviceConnector {
    type Client = MqttDeviceClient;

    async fn register(&self, device_id: &str, key: &SymmetricKey) -> Result<String> {
        provisioning::register(&self.provisioning, device_id, key).await
    }

    async fn connect(
        &self,
        hub: &str,
        device_id: &str,
        key: &SymmetricKey,
    ) -> Result<MqttDeviceClient> {
        mk_mqtt_device_client(&self.hub, hub, device_id, key).await
    }
}
