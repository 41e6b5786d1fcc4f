#![cfg(any(debug_assertions, feature = "mock"))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cor_bridge_lib::commands;
use cor_bridge_lib::config::AppConfig;
use cor_bridge_lib::core::bluetooth::mock::MockTransport;
use cor_bridge_lib::core::bluetooth::{ConnectionState, SessionEvent};
use cor_bridge_lib::core::codec::ControlValues;
use cor_bridge_lib::core::registry::*;
use cor_bridge_lib::error::{SessionError, TransportError};
use cor_bridge_lib::state::AppState;
use cor_bridge_lib::storage::TelemetryRecord;
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

const COR_ID: &str = "cor-hub-1";
const MPPT_ID: &str = "mppt-1";

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("cor-bridge-flow-{}", Uuid::new_v4()))
}

fn config(data_dir: &PathBuf, owner_id: Option<&str>) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.data_dir = data_dir.clone();
    config.storage.owner_id = owner_id.map(str::to_string);
    config
}

/// COR and MPPT share telemetry UUIDs, so every payload belongs to one peripheral.
const PAYLOADS: &[(&str, Uuid, Uuid, &[u8])] = &[
    (COR_ID, COR_SERVICE, COR_SOC_CHAR, &[0x00, 0x07, 0, 0x32, 0, 0x64, 0, 0, 0, 0]),
    (COR_ID, COR_SERVICE, COR_POWER_VOLTAGE_CHAR, &[0x00, 0x07, 0x04, 0xB0, 0xFF, 0x9C]),
    (COR_ID, COR_SERVICE, COR_TEMPERATURE_CHAR, &[0x00, 0x07, 20, 31, 0, 0, 0, 0, 0, 0]),
    (COR_ID, COR_CONTROLS_SERVICE, COR_LED_CHAR, &[0x00, 0x07, 80]),
    (COR_ID, COR_CONTROLS_SERVICE, COR_LCD_CHAR, &[0x00, 0x07, 40]),
    (COR_ID, COR_CONTROLS_SERVICE, COR_CURRENT_CHAR, &[0x00, 0x07, 0x00]),
    (MPPT_ID, MPPT_SERVICE, MPPT_POWER_VOLTAGE_CHAR, &[0x00, 0x09, 0x00, 0x2A, 0x00, 0x7B]),
    (MPPT_ID, MPPT_SERVICE, MPPT_TEMPERATURE_CHAR, &[0x00, 0x09, 0x02, 0x8A, 0x00, 0x00]),
    (MPPT_ID, MPPT_CONTROL_SERVICE, MPPT_ON_OFF_CHAR, &[0x00, 0x09, 1, 0]),
];

fn transport() -> Arc<MockTransport> {
    let transport = MockTransport::new()
        .with_advertisement(COR_ID, "COR2-0042", -48)
        .with_advertisement("cor-hub-2", "COR2-0077", -71)
        .with_advertisement(MPPT_ID, "MPPT Solar", -60)
        .with_services(&[COR_SERVICE, COR_CONTROLS_SERVICE, MPPT_SERVICE, MPPT_CONTROL_SERVICE]);
    for &(peripheral_id, service, characteristic, payload) in PAYLOADS {
        transport.set_payload_for(peripheral_id, service, characteristic, payload);
    }
    Arc::new(transport)
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test(start_paused = true)]
async fn scan_lists_only_matching_family() {
    let dir = temp_dir();
    let app_state = AppState::new(config(&dir, None), transport());

    let found = commands::scan_devices(&app_state, "cor").await.unwrap();
    let ids: Vec<_> = found.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec![COR_ID, "cor-hub-2"]);
    assert_eq!(found[0].family, DeviceFamily::Cor);

    let found = commands::scan_devices(&app_state, "mppt").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].display_name, "MPPT Solar");

    assert!(commands::scan_devices(&app_state, "inverter").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn second_connect_while_connecting_is_rejected() {
    let dir = temp_dir();
    let transport = transport();
    transport.set_connect_delay(Duration::from_millis(500));
    let app_state = AppState::new(config(&dir, None), transport.clone());
    let session = app_state.session(DeviceFamily::Cor);

    let (first, second) = tokio::join!(session.connect(COR_ID), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.connect("cor-hub-2").await
    });

    assert_eq!(first.unwrap().peripheral_id, COR_ID);
    assert!(matches!(second, Err(SessionError::AlreadyConnecting(id)) if id == COR_ID));
    assert_eq!(transport.connect_count(), 1);

    // Connected still counts as busy.
    assert!(matches!(
        session.connect("cor-hub-2").await,
        Err(SessionError::AlreadyConnecting(_))
    ));
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test(start_paused = true)]
async fn polling_stops_after_disconnect() {
    let dir = temp_dir();
    let transport = transport();
    let app_state = AppState::new(config(&dir, None), transport.clone());
    let session = app_state.session(DeviceFamily::Cor);

    let mut events = session.subscribe();
    commands::connect_to_device(&app_state, "cor", COR_ID).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let readings = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::Reading { .. }))
        .count();
    assert!(readings >= 6);
    assert_eq!(session.latest("power_voltage", "power"), Some(-100.0));

    commands::disconnect(&app_state, "cor", COR_ID).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    let mut after = session.subscribe();
    let reads = transport.read_count();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(after.try_recv().unwrap_err(), TryRecvError::Empty);
    assert_eq!(transport.read_count(), reads);
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test(start_paused = true)]
async fn link_loss_returns_slot_to_disconnected() {
    let dir = temp_dir();
    let transport = transport();
    let app_state = AppState::new(config(&dir, None), transport.clone());
    let session = app_state.session(DeviceFamily::Cor);

    session.connect(COR_ID).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut events = session.subscribe();

    transport.drop_link(COR_ID);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(session.state(), ConnectionState::Disconnected);
    let events = drain(&mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::LinkLost { peripheral_id, .. } if peripheral_id == COR_ID
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::StateChanged { state: ConnectionState::Disconnected, .. }
    )));

    let reads = transport.read_count();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.read_count(), reads);

    // The slot can be used again.
    session.connect(COR_ID).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test(start_paused = true)]
async fn known_peripherals_survive_restart() {
    let dir = temp_dir();
    let app_state = AppState::new(config(&dir, None), transport());

    commands::scan_devices(&app_state, "cor").await.unwrap();
    commands::connect_to_device(&app_state, "cor", COR_ID).await.unwrap();
    commands::disconnect(&app_state, "cor", COR_ID).await.unwrap();

    let json = std::fs::read_to_string(dir.join("known_cor.json")).unwrap();
    assert!(json.contains("knownPeripherals"));
    assert!(json.contains("COR2-0042"));

    let restarted = AppState::new(config(&dir, None), transport());
    assert!(commands::known_devices(&restarted, "cor").unwrap().is_empty());
    restarted.load_known_peripherals().await;
    let known = commands::known_devices(&restarted, "cor").unwrap();
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].display_name, "COR2-0042");
    assert!(commands::known_devices(&restarted, "mppt").unwrap().is_empty());

    commands::forget_device(&restarted, "cor", COR_ID).await.unwrap();
    assert!(commands::known_devices(&restarted, "cor").unwrap().is_empty());
    let json = std::fs::read_to_string(dir.join("known_cor.json")).unwrap();
    assert!(!json.contains(COR_ID));
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test(start_paused = true)]
async fn mppt_session_records_history_and_resets() {
    let dir = temp_dir();
    let transport = transport();
    let app_state = AppState::new(config(&dir, Some("owner-7")), transport.clone());

    commands::connect_to_device(&app_state, "mppt", MPPT_ID).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let session = app_state.session(DeviceFamily::Mppt);
    assert_eq!(session.latest("temperature", "temperature1"), Some(25.0));
    assert_eq!(session.latest("temperature", "temperature2"), Some(0.0));
    assert_eq!(session.latest("power_voltage", "voltage"), Some(12.3));

    let history = std::fs::read_to_string(dir.join("telemetry.jsonl")).unwrap();
    let records: Vec<TelemetryRecord> = history
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.owner_id == "owner-7" && r.family == DeviceFamily::Mppt));
    assert_eq!(records.last().unwrap().temperature1, 25.0);

    commands::reset_controller(&app_state).await.unwrap();
    let writes = transport.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].characteristic, MPPT_RESET_CHAR);
    assert_eq!(writes[0].data, vec![0x00, 0x09, 0x01, 0x02]);

    let values: ControlValues = [("mode".to_string(), 3)].into_iter().collect();
    commands::write_control(&app_state, "mppt", "on_off", values).await.unwrap();
    assert_eq!(transport.writes()[1].data, vec![0x00, 0x09, 0x01, 0x03]);
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test(start_paused = true)]
async fn guarded_cor_controls_respect_system_power() {
    let dir = temp_dir();
    let transport = transport();
    let app_state = AppState::new(config(&dir, None), transport.clone());

    commands::connect_to_device(&app_state, "cor", COR_ID).await.unwrap();
    commands::read_all(&app_state, "cor").await.unwrap();

    let brightness: ControlValues = [("brightness".to_string(), 10)].into_iter().collect();
    commands::write_control(&app_state, "cor", "lcd", brightness).await.unwrap();
    assert!(transport.writes().is_empty());

    let err = commands::reset_controller(&app_state).await.unwrap_err();
    assert!(err.contains("no active connection"));
    assert_eq!(
        commands::connection_state(&app_state, "cor").unwrap(),
        ConnectionState::Connected
    );
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test(start_paused = true)]
async fn mppt_history_never_records_unread_power() {
    let dir = temp_dir();
    let transport = transport();
    let app_state = AppState::new(config(&dir, Some("owner-7")), transport.clone());

    commands::connect_to_device(&app_state, "mppt", MPPT_ID).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    commands::disconnect(&app_state, "mppt", MPPT_ID).await.unwrap();

    let history = std::fs::read_to_string(dir.join("telemetry.jsonl")).unwrap();
    let records: Vec<TelemetryRecord> = history
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    // Power and voltage are on the slow cadence but are read as soon as the link is up.
    assert!(records.len() >= 4);
    for record in &records {
        assert_eq!(record.power, 42.0);
        assert_eq!(record.voltage, 12.3);
        assert_eq!(record.temperature1, 25.0);
    }
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test(start_paused = true)]
async fn both_families_share_one_transport() {
    let dir = temp_dir();
    let transport = transport();
    let app_state = AppState::new(config(&dir, None), transport.clone());

    commands::connect_to_device(&app_state, "cor", COR_ID).await.unwrap();
    commands::connect_to_device(&app_state, "mppt", MPPT_ID).await.unwrap();
    let cor = commands::read_all(&app_state, "cor").await.unwrap();
    let mppt = commands::read_all(&app_state, "mppt").await.unwrap();

    assert_eq!(cor[0].channel, "soc");
    assert_eq!(cor[0].get("soc"), Some(50.0));
    assert_eq!(cor[1].get("power"), Some(-100.0));
    assert_eq!(cor[1].get("voltage"), Some(1200.0));

    assert_eq!(mppt[0].channel, "power_voltage");
    assert_eq!(mppt[0].get("power"), Some(42.0));
    assert_eq!(mppt[0].get("voltage"), Some(12.3));
    assert_eq!(mppt[1].get("temperature1"), Some(25.0));

    let cor_session = app_state.session(DeviceFamily::Cor);
    let mppt_session = app_state.session(DeviceFamily::Mppt);
    assert_eq!(cor_session.latest("power_voltage", "power"), Some(-100.0));
    assert_eq!(mppt_session.latest("power_voltage", "power"), Some(42.0));
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_during_discovery_closes_the_link() {
    let dir = temp_dir();
    let transport = transport();
    let mut config = config(&dir, None);
    config.bridge.connect_timeout_ms = 500;
    config.bridge.service_discovery_delay_ms = 900;
    let app_state = AppState::new(config, transport.clone());
    let session = app_state.session(DeviceFamily::Cor);

    let err = session.connect(COR_ID).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Timeout { operation: "connect", .. })
    ));
    assert_eq!(session.state(), ConnectionState::Error);
    assert!(!transport.is_connected(COR_ID));

    session.abandon().unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!transport.is_connected(COR_ID));
    std::fs::remove_dir_all(dir).ok();
}
