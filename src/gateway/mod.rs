use std::{fmt, sync::Arc};

use async_trait::async_trait;
use color_eyre::Result;
use derive_builder::Builder;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::twin::{DesiredProperties, ReportedProperties, Twin};

#[cfg(test)]
pub mod fake;
pub mod mqtt;
pub mod provisioning;

pub const STATUS_OK: u16 = 200;
pub const STATUS_ERROR: u16 = 500;
pub const STATUS_NOT_IMPLEMENTED: u16 = 501;

/// Symmetric key credential. Never printed.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct SymmetricKey(pub String);

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Device-to-cloud event.
#[derive(Builder, Clone, Debug, PartialEq)]
#[builder(setter(into))]
pub struct Message {
    pub body: Vec<u8>,
    #[builder(default = "\"application/json\".to_string()")]
    pub content_type: String,
    #[builder(default = "\"utf-8\".to_string()")]
    pub content_encoding: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodRequest {
    pub name: String,
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodResponse {
    pub status: u16,
}

impl MethodResponse {
    pub fn ok() -> Self {
        MethodResponse { status: STATUS_OK }
    }

    pub fn error() -> Self {
        MethodResponse {
            status: STATUS_ERROR,
        }
    }
}

pub type MethodHandler =
    Arc<dyn Fn(MethodRequest) -> BoxFuture<'static, MethodResponse> + Send + Sync>;

pub type DesiredPropertyCallback =
    Arc<dyn Fn(DesiredProperties) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registration with the provisioning service and connection to the assigned
/// hub.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    type Client: DeviceClient;

    /// Returns the host name of the hub the device was assigned to.
    async fn register(&self, device_id: &str, key: &SymmetricKey) -> Result<String>;

    async fn connect(&self, hub: &str, device_id: &str, key: &SymmetricKey)
        -> Result<Self::Client>;
}

/// Connected device session on a hub.
///
/// Handlers are invoked from the client's own tasks, each invocation
/// independently, so a slow handler does not hold up other listeners.
#[async_trait]
pub trait DeviceClient: Send + Sync + 'static {
    async fn get_twin(&self) -> Result<Twin>;

    async fn update_reported_properties(&self, reported: &ReportedProperties) -> Result<()>;

    async fn send_event(&self, message: Message) -> Result<()>;

    async fn set_method_handler(&self, name: &str, handler: MethodHandler) -> Result<()>;

    async fn set_desired_property_callback(&self, callback: DesiredPropertyCallback)
        -> Result<()>;
}
