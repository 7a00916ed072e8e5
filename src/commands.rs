use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use eyre::eyre;
use futures::FutureExt;
use tokio::sync::Mutex;

use crate::{
    climate::Entropy,
    gateway::{MethodHandler, MethodRequest, MethodResponse},
};

pub const CLEAN_SYSTEM_METHOD: &str = "CleanSystem";

const MIN_CLEANING_MS: u32 = 1000;
const MAX_CLEANING_MS: u32 = 3000;

pub type SharedEntropy = Arc<Mutex<Box<dyn Entropy>>>;

/// Cleaning mode carried in the payload. Accepts either the raw string or a
/// JSON string literal, which is how hub method payloads usually arrive.
fn cleaning_mode(request: &MethodRequest) -> Result<String> {
    let missing = || eyre!("Missing payload for direct method {}", request.name);

    let payload = request.payload.as_deref().ok_or_else(missing)?;
    let raw = std::str::from_utf8(payload)?;

    let mode = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(serde_json::Value::Null) => String::new(),
        _ => raw.to_string(),
    };

    if mode.is_empty() {
        return Err(missing());
    }

    Ok(mode)
}

async fn try_clean_system(request: &MethodRequest, entropy: &SharedEntropy) -> Result<()> {
    log::info!("Direct method {} was invoked", request.name);

    let mode = cleaning_mode(request)?;
    log::info!("Cleaning system now (mode: {})...", mode);

    let delay_ms = entropy.lock().await.between(MIN_CLEANING_MS, MAX_CLEANING_MS);
    tokio::time::sleep(Duration::from_millis(delay_ms.into())).await;

    log::info!("Done cleaning system");

    Ok(())
}

/// Simulated system clean. Leaves the climate untouched.
pub async fn clean_system(request: MethodRequest, entropy: &SharedEntropy) -> MethodResponse {
    match try_clean_system(&request, entropy).await {
        Ok(()) => MethodResponse::ok(),
        Err(e) => {
            log::error!("Direct method {} failed: {:?}", request.name, e);
            MethodResponse::error()
        }
    }
}

pub fn mk_clean_system_handler(entropy: SharedEntropy) -> MethodHandler {
    Arc::new(move |request| {
        let entropy = entropy.clone();
        async move { clean_system(request, &entropy).await }.boxed()
    })
}
