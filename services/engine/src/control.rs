//! Control Handler: the out-of-band start/stop API for a single
//! device, invoked by the control-plane service via the callback routes
//! mounted in `http::control`. Mutates the Runtime Device Map the
//! same way the Device Monitor does, just driven by an explicit request
//! instead of a timer.

use tracing::{info, warn};

use crate::device_runtime::RuntimeDeviceState;
use crate::Engine;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("device not found")]
    DeviceNotFound,
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub struct ControlHandler {
    engine: Engine,
}

impl ControlHandler {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Start transmitting for `device_id`. A no-op if the device no
    /// longer qualifies (deleted, inactive, transmission disabled, or has
    /// no connection) — the caller is expected to have just enabled it.
    pub async fn start(&self, device_id: &str) -> Result<(), ControlError> {
        let device = self
            .engine
            .store
            .fetch_device(device_id)
            .await?
            .ok_or(ControlError::DeviceNotFound)?;

        if !device.qualifies_for_transmission() {
            info!(device_id, "control: start ignored, device does not qualify");
            return Ok(());
        }
        let connection_id = device.connection_id.clone().expect("qualifies_for_transmission checked Some");

        if let Some(existing) = self.engine.devices.get(device_id).await {
            existing.refresh_config(&device);
            info!(device_id, "control: refreshed already-running device");
            return Ok(());
        }

        let rows = crate::device_monitor::load_dataset_rows(&self.engine, device_id).await;
        self.engine.devices.insert(RuntimeDeviceState::new(&device, connection_id, rows)).await;
        info!(device_id, "control: started device");
        Ok(())
    }

    /// Stop transmitting for `device_id`. Removes the runtime state
    /// immediately so no further ticks select it, persists the requested
    /// state, and releases the connection's pooled handle plus circuit
    /// breaker only if no other runtime device still shares it.
    pub async fn stop(&self, device_id: &str, reset_row_index: bool) -> Result<(), ControlError> {
        let removed = self.engine.devices.remove(device_id).await;

        if let Err(e) = self.engine.store.stop_device(device_id, reset_row_index).await {
            warn!(device_id, error = %e, "control: failed to persist stop");
        }

        if let Some(device) = removed {
            if !self.engine.devices.connection_in_use(&device.connection_id, device_id).await {
                self.engine.pool.invalidate(&device.connection_id).await;
                self.engine.breakers.reset(&device.connection_id).await;
            }
        }

        info!(device_id, reset_row_index, "control: stopped device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Start/stop correctness (adoption, refresh-in-place, shared-connection
    //! pool/breaker release) is exercised end-to-end in the root crate's
    //! `tests/integration/e2e_control_plane_stop.rs` against the in-memory
    //! store fake, where a real `Engine` can be assembled.
}
