use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use color_eyre::Result;
use eyre::eyre;

use super::{
    DesiredPropertyCallback, DeviceClient, DeviceConnector, Message, MethodHandler, MethodRequest,
    MethodResponse, SymmetricKey,
};
use crate::twin::{DesiredProperties, ReportedProperties, Twin};

pub const FAKE_HUB: &str = "fake-hub.example.net";

#[derive(Default)]
struct Inner {
    twin: Mutex<Option<Twin>>,
    events: Mutex<Vec<Message>>,
    reported: Mutex<Vec<ReportedProperties>>,
    method_handlers: Mutex<HashMap<String, MethodHandler>>,
    desired_callback: Mutex<Option<DesiredPropertyCallback>>,
    fail_sends: AtomicBool,
    stall_sends: AtomicBool,
    fail_reported: AtomicBool,
}

/// In-memory device client recording everything the device sends.
#[derive(Clone, Default)]
pub struct FakeClient {
    inner: Arc<Inner>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Twin returned by `get_twin`. Without one, `get_twin` fails.
    pub fn with_twin(self, twin: Twin) -> Self {
        *self.inner.twin.lock().unwrap() = Some(twin);
        self
    }

    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make `send_event` hang, like a publish queued behind a dead connection.
    pub fn stall_sends(&self, stall: bool) {
        self.inner.stall_sends.store(stall, Ordering::SeqCst);
    }

    pub fn fail_reported(&self, fail: bool) {
        self.inner.fail_reported.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Message> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn reported(&self) -> Vec<ReportedProperties> {
        self.inner.reported.lock().unwrap().clone()
    }

    pub fn has_method_handler(&self, name: &str) -> bool {
        self.inner.method_handlers.lock().unwrap().contains_key(name)
    }

    pub fn has_desired_callback(&self) -> bool {
        self.inner.desired_callback.lock().unwrap().is_some()
    }

    /// Invoke a registered method the way the hub would.
    pub async fn invoke_method(&self, name: &str, payload: Option<&[u8]>) -> Option<MethodResponse> {
        let handler = self.inner.method_handlers.lock().unwrap().get(name).cloned()?;

        let request = MethodRequest {
            name: name.to_string(),
            payload: payload.map(|p| p.to_vec()),
        };

        Some(handler(request).await)
    }

    /// Push a desired property patch to the registered callback.
    pub async fn push_desired(&self, desired: DesiredProperties) -> bool {
        let callback = self.inner.desired_callback.lock().unwrap().clone();

        match callback {
            Some(callback) => {
                callback(desired).await;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl DeviceClient for FakeClient {
    async fn get_twin(&self) -> Result<Twin> {
        self.inner
            .twin
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| eyre!("Twin not available"))
    }

    async fn update_reported_properties(&self, reported: &ReportedProperties) -> Result<()> {
        if self.inner.fail_reported.load(Ordering::SeqCst) {
            return Err(eyre!("Reported property update rejected"));
        }

        self.inner.reported.lock().unwrap().push(reported.clone());
        Ok(())
    }

    async fn send_event(&self, message: Message) -> Result<()> {
        if self.inner.stall_sends.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }

        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(eyre!("Hub unreachable"));
        }

        self.inner.events.lock().unwrap().push(message);
        Ok(())
    }

    async fn set_method_handler(&self, name: &str, handler: MethodHandler) -> Result<()> {
        self.inner
            .method_handlers
            .lock()
            .unwrap()
            .insert(name.to_string(), handler);
        Ok(())
    }

    async fn set_desired_property_callback(&self, callback: DesiredPropertyCallback) -> Result<()> {
        *self.inner.desired_callback.lock().unwrap() = Some(callback);
        Ok(())
    }
}

/// Connector handing out a single shared [`FakeClient`].
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub client: FakeClient,
    pub fail_register: bool,
    pub fail_connect: bool,
    pub connected_to: Arc<Mutex<Option<String>>>,
}

impl FakeConnector {
    pub fn new(client: FakeClient) -> Self {
        FakeConnector {
            client,
            ..Default::default()
        }
    }
}

#[async_trait]
impl DeviceConnector for FakeConnector {
    type Client = FakeClient;

    async fn register(&self, device_id: &str, _key: &SymmetricKey) -> Result<String> {
        if self.fail_register {
            return Err(eyre!("Failed to register device {}", device_id));
        }

        Ok(FAKE_HUB.to_string())
    }

    async fn connect(&self, hub: &str, _device_id: &str, _key: &SymmetricKey) -> Result<FakeClient> {
        if self.fail_connect {
            return Err(eyre!("Connection to {} refused", hub));
        }

        *self.connected_to.lock().unwrap() = Some(hub.to_string());
        Ok(self.client.clone())
    }
}
