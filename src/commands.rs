//! Bridge commands
//! String-error entry points for a UI or CLI front end, one per session operation.

use futures_util::StreamExt;

use crate::core::bluetooth::{
    ConnectionSession, ConnectionState, DeviceSession, PeripheralDescriptor,
};
use crate::core::codec::ControlValues;
use crate::core::registry::DeviceFamily;
use crate::core::telemetry::Reading;
use crate::state::AppState;

fn session<'a>(app_state: &'a AppState, family: &str) -> Result<&'a DeviceSession, String> {
    let family: DeviceFamily = family.parse()?;
    Ok(app_state.session(family))
}

/// Runs one scan window to completion
///
/// # Returns
/// Every peripheral found in the window, strongest signal first. Discoveries
/// are also broadcast as they arrive.
pub async fn scan_devices(
    app_state: &AppState,
    family: &str,
) -> Result<Vec<PeripheralDescriptor>, String> {
    let session = session(app_state, family)?;
    let mut stream = session.scan().await.map_err(|e| e.to_string())?;
    while stream.next().await.is_some() {}

    let mut found = session.discovered().await;
    found.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
    Ok(found)
}

pub async fn stop_scan(app_state: &AppState, family: &str) -> Result<(), String> {
    session(app_state, family)?.stop_scan().await;
    Ok(())
}

/// Connects to a peripheral and starts polling it
///
/// # Arguments
/// * `device_id` - Platform identifier of the peripheral
pub async fn connect_to_device(
    app_state: &AppState,
    family: &str,
    device_id: &str,
) -> Result<ConnectionSession, String> {
    session(app_state, family)?
        .connect(device_id)
        .await
        .map_err(|e| e.to_string())
}

pub async fn disconnect(app_state: &AppState, family: &str, device_id: &str) -> Result<(), String> {
    session(app_state, family)?
        .disconnect(device_id)
        .await
        .map_err(|e| e.to_string())
}

pub fn connection_state(app_state: &AppState, family: &str) -> Result<ConnectionState, String> {
    Ok(session(app_state, family)?.state())
}

pub async fn read_all(app_state: &AppState, family: &str) -> Result<Vec<Reading>, String> {
    session(app_state, family)?.read_all().await.map_err(|e| e.to_string())
}

pub async fn write_control(
    app_state: &AppState,
    family: &str,
    channel: &str,
    values: ControlValues,
) -> Result<(), String> {
    session(app_state, family)?
        .write_control(channel, &values)
        .await
        .map_err(|e| e.to_string())
}

pub async fn reset_controller(app_state: &AppState) -> Result<(), String> {
    app_state
        .session(DeviceFamily::Mppt)
        .reset()
        .await
        .map_err(|e| e.to_string())
}

pub fn known_devices(
    app_state: &AppState,
    family: &str,
) -> Result<Vec<PeripheralDescriptor>, String> {
    Ok(session(app_state, family)?.known_peripherals())
}

pub async fn forget_device(
    app_state: &AppState,
    family: &str,
    device_id: &str,
) -> Result<(), String> {
    session(app_state, family)?
        .forget_peripheral(device_id)
        .await
        .map_err(|e| e.to_string())
}
