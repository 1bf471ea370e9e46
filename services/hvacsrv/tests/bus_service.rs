//! Bus mode end to end: telemetry aggregation, debounced broadcast and the
//! publish-based command path, driven through the JSON-line command server.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hvacsrv::bus::BusEvent;
use hvacsrv::command::CommandReply;
use hvacsrv::config::{Config, DeviceConfig, RegisterMap, TopicOverride};
use hvacsrv::runtime::{serve_commands, start_bus};
use hvacsrv::state::Parameter;
use hvacsrv::test_utils::{MockBus, RecordingBroadcaster};
use hvacsrv::{DeviceId, OperatingMode, ServiceMode};

fn config() -> Config {
    let mut config = Config::default();
    config.service.mode = ServiceMode::Bus;
    config.devices = vec![
        DeviceConfig {
            id: 1,
            name: Some("lobby".to_string()),
            registers: RegisterMap::default(),
            topics: Vec::new(),
        },
        DeviceConfig {
            id: 2,
            name: None,
            registers: RegisterMap::default(),
            topics: vec![TopicOverride {
                parameter: Parameter::AirTemperature,
                topic: "site/ahu2/return_air".to_string(),
                command_topic: None,
            }],
        },
    ];
    config
}

fn message(topic: &str, payload: &str) -> BusEvent {
    BusEvent::Message {
        topic: topic.to_string(),
        payload: payload.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_burst_is_broadcast_once() {
    let bus = Arc::new(MockBus::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let (tx, rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let handle = start_bus(&config(), bus.clone(), rx, broadcaster.clone(), cancel.clone())
        .await
        .unwrap();

    assert!(bus
        .subscriptions()
        .contains(&"site/ahu2/return_air".to_string()));
    assert!(!bus
        .subscriptions()
        .contains(&"hvac/2/air_temperature".to_string()));

    for event in [
        message("hvac/1/mode", "1"),
        message("hvac/1/setpoint", "22"),
        message("hvac/1/pump", "true"),
        message("site/ahu2/return_air", "90"),
        message("hvac/2/valve", "0"),
        message("hvac/2/fan_speed", "fast"),
    ] {
        tx.send(event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(broadcaster.full_pushes().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let pushes = broadcaster.full_pushes();
    assert_eq!(pushes.len(), 1);

    let lobby = &pushes[0][0];
    assert_eq!(lobby.name, "lobby");
    assert!(lobby.online);
    assert_eq!(lobby.mode, OperatingMode::Cool);
    assert!(lobby.power);
    assert_eq!(lobby.setpoint, 22);
    assert!(lobby.pump_running);

    let second = &pushes[0][1];
    assert!(second.online);
    assert_eq!(second.air_temperature, 25.0);
    assert!(!second.valve_open);
    // Unparseable payload left the field alone
    assert_eq!(second.fan_speed, 0);

    cancel.cancel();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_publish_and_flush() {
    let bus = Arc::new(MockBus::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let (tx, rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let handle = start_bus(&config(), bus.clone(), rx, broadcaster.clone(), cancel.clone())
        .await
        .unwrap();

    tx.send(message("hvac/2/mode", "2")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(broadcaster.full_pushes().len(), 1);

    let input = [
        r#"{"device":"hvac_2","command":"set_fan_speed","value":2}"#,
        r#"{"device":"hvac_2","command":"power","value":true}"#,
        r#"{"device":"hvac_1","command":"set_mode","value":"fan"}"#,
        r#"{"device":"hvac_1","command":"set_temperature","value":12}"#,
        r#"{"device":"hvac_5","command":"power","value":true}"#,
    ]
    .join("\n");

    let mut output = Vec::new();
    serve_commands(
        &handle,
        BufReader::new(input.as_bytes()),
        &mut output,
        cancel.clone(),
    )
    .await
    .unwrap();

    // Replies arrive in completion order
    let mut outcomes: Vec<(String, String, bool)> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<CommandReply>(line).unwrap())
        .map(|r| {
            if r.device == "hvac_5" {
                assert_eq!(
                    r.error.as_deref(),
                    Some("command rejected: unknown device hvac_5")
                );
            }
            (r.device, r.command, r.success)
        })
        .collect();
    outcomes.sort();
    let expected = [
        ("hvac_1", "set_mode", true),
        ("hvac_1", "set_temperature", false),
        ("hvac_2", "power", true),
        ("hvac_2", "set_fan_speed", true),
        ("hvac_5", "power", false),
    ];
    assert_eq!(
        outcomes,
        expected
            .iter()
            .map(|(d, c, ok)| (d.to_string(), c.to_string(), *ok))
            .collect::<Vec<_>>()
    );

    let mut published = bus.published();
    published.sort();
    assert_eq!(
        published,
        vec![
            ("hvac/1/set/mode".to_string(), "3".to_string()),
            ("hvac/2/set/fan_speed".to_string(), "2".to_string()),
            ("hvac/2/set/mode".to_string(), "2".to_string()),
        ]
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    // One forced flush per accepted command, on top of the debounced one
    assert_eq!(broadcaster.full_pushes().len(), 4);
    // The bus path reports state from telemetry, not from the command itself
    assert_eq!(handle.registry().get(DeviceId(2)).unwrap().fan_speed, 0);

    cancel.cancel();
    handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_is_reported_downstream() {
    let bus = Arc::new(MockBus::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let handle = start_bus(&config(), bus.clone(), rx, broadcaster.clone(), cancel.clone())
        .await
        .unwrap();

    tx.send(BusEvent::Disconnected("connection reset".to_string()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        broadcaster.errors(),
        vec!["bus connection lost: connection reset".to_string()]
    );

    bus.set_connected(false);
    let reply = handle
        .handle_command(&hvacsrv::command::CommandRequest {
            device: "hvac_1".to_string(),
            command: "set_fan_speed".to_string(),
            value: serde_json::json!(1),
        })
        .await;
    assert!(!reply.success);
    assert!(reply.error.unwrap().contains("not connected"));

    cancel.cancel();
    handle.join().await;
}
