//! End-to-end scenarios over the in-memory bus simulator

use std::sync::Arc;
use std::time::Duration;

use flowsrv::protocols::propar::codec::{encode_frame, FrameDecoder};
use flowsrv::protocols::propar::message::{build_read_request, build_write_request};
use flowsrv::protocols::propar::simulator::{BusSimulator, NodeConfig, SimLinkFactory};
use flowsrv::{
    AsyncCommand, Command, CommandKind, CommandPriority, EventSink, Parameter, ParameterType,
    ParameterValue, PollerConfig, PortRegistry, PriorityCommand, SerialConfig, TelemetryEvent,
};
use tokio::sync::mpsc;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sim_config() -> SerialConfig {
    SerialConfig {
        port: "SIM0".to_string(),
        response_timeout_ms: 100,
        ..Default::default()
    }
}

fn drain(rx: &mut mpsc::Receiver<TelemetryEvent>) -> Vec<TelemetryEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Scenario: reading fMeasure (DDE 205, proc 33 parm 0, Float) from node 3.
#[test]
fn read_request_wire_image() {
    let parm = Parameter::new(33, 0, ParameterType::Float).with_node(3);
    let body = build_read_request(1, 3, &[parm]).unwrap();
    assert_eq!(body, vec![0x01, 0x03, 0x03, 0x04, 0x21, 0x40]);
}

/// Scenario: writing setpoint 32000 (DDE 9, Int16) to node 3 with ack.
#[test]
fn write_request_wire_image() {
    let parm = Parameter::new(1, 1, ParameterType::Int16)
        .with_node(3)
        .with_value(ParameterValue::Int16(32000));
    let body = build_write_request(2, 3, Command::SendWithAck, &[parm]).unwrap();
    assert_eq!(body, vec![0x02, 0x03, 0x05, 0x01, 0x01, 0x21, 0x7D, 0x00]);
}

/// Scenario: DLE stuffing of the body {10 02}.
#[test]
fn dle_stuffing_wire_image() {
    let frame = encode_frame(&[0x10, 0x02]);
    assert_eq!(frame, vec![0x10, 0x02, 0x10, 0x10, 0x02, 0x10, 0x03]);

    let mut decoder = FrameDecoder::new();
    assert_eq!(decoder.feed(&frame), vec![vec![0x10, 0x02]]);
}

/// Scenario: a float read over the full stack returns the instrument value.
#[tokio::test]
async fn read_float_end_to_end() {
    init_tracing();
    let sim = BusSimulator::new();
    sim.add_node(3, NodeConfig::flow_meter("AiR", 100.0)).await;
    sim.set_value(3, 33, 0, ParameterValue::Float(45.67)).await;

    let registry = PortRegistry::new(EventSink::disconnected(), PollerConfig::default());
    registry
        .open_port_with_factory(Arc::new(SimLinkFactory::new("SIM0", sim.clone())), sim_config())
        .unwrap();

    let value = registry.read_dde("SIM0", 3, 205).await.unwrap();
    assert_eq!(value, ParameterValue::Float(45.67));
    registry.close_all().await;
}

/// Scenario: one swallowed reply costs one failed attempt, then the retry
/// lands and the caller sees success.
#[tokio::test(start_paused = true)]
async fn timeout_then_retry_succeeds() {
    init_tracing();
    let sim = BusSimulator::new();
    sim.add_node(3, NodeConfig::flow_meter("AiR", 100.0)).await;
    sim.drop_next_replies(3, 1).await;

    let registry = PortRegistry::new(EventSink::disconnected(), PollerConfig::default());
    registry
        .open_port_with_factory(Arc::new(SimLinkFactory::new("SIM0", sim.clone())), sim_config())
        .unwrap();

    registry
        .write_dde("SIM0", 3, 9, ParameterValue::Int16(32000))
        .await
        .unwrap();
    assert_eq!(
        sim.get_value(3, 1, 1).await,
        Some(ParameterValue::Int16(32000))
    );

    let stats = registry.stats("SIM0").unwrap();
    assert_eq!(stats.failed_operations, 1);
    assert_eq!(stats.successful_operations, 1);
    registry.close_all().await;
}

/// Scan, poll, command and recover over one simulated port.
#[tokio::test(start_paused = true)]
async fn full_lifecycle() {
    init_tracing();
    let sim = BusSimulator::new();
    sim.add_node(3, NodeConfig::flow_meter("AiR", 100.0)).await;
    sim.add_node(7, NodeConfig::flow_meter("N2", 50.0).with_ident(8))
        .await;
    sim.set_value(3, 33, 0, ParameterValue::Float(12.0)).await;
    sim.set_value(7, 33, 0, ParameterValue::Float(6.0)).await;

    let (sink, mut events) = EventSink::channel(4096);
    let registry = PortRegistry::new(sink, PollerConfig::default());
    let entry = registry
        .open_port_with_factory(Arc::new(SimLinkFactory::new("SIM0", sim.clone())), sim_config())
        .unwrap();

    // Discovery finds both instruments and enters them into rotation.
    let found = registry.scan("SIM0").await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].address, 3);
    assert_eq!(found[0].fluid, "AiR");
    assert_eq!(found[1].address, 7);

    // Periodic polling produces measurements for both addresses.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let measured: Vec<u8> = drain(&mut events)
        .iter()
        .filter_map(|e| match e {
            TelemetryEvent::Measurement(m) => Some(m.address),
            _ => None,
        })
        .collect();
    assert!(measured.contains(&3));
    assert!(measured.contains(&7));

    // A critical setpoint command lands ahead of polling.
    registry
        .queue_priority(
            "SIM0",
            PriorityCommand {
                address: 3,
                kind: CommandKind::SetFlow(42.0),
                priority: CommandPriority::Critical,
            },
        )
        .unwrap();
    // An async command follows, gated on its reply latch.
    registry
        .queue_async(
            "SIM0",
            AsyncCommand {
                address: 7,
                kind: CommandKind::SetPercent(50.0),
                timeout: Duration::from_millis(400),
            },
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        sim.get_value(3, 33, 3).await,
        Some(ParameterValue::Float(42.0))
    );
    assert_eq!(
        sim.get_value(7, 1, 1).await,
        Some(ParameterValue::Int16(16000))
    );

    // Forced reconnection bumps the epoch and credits one recovery per node.
    let epoch_before = entry.manager.epoch();
    drain(&mut events);
    registry.force_reconnect("SIM0").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(entry.manager.epoch() > epoch_before);
    let recoveries: Vec<(u8, u64)> = drain(&mut events)
        .iter()
        .filter_map(|e| match e {
            TelemetryEvent::ConnectionRecovery(r) => Some((r.address, r.recoveries_total)),
            _ => None,
        })
        .collect();
    assert!(recoveries.contains(&(3, 1)));
    assert!(recoveries.contains(&(7, 1)));

    // Polling keeps running on the rebuilt port.
    drain(&mut events);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, TelemetryEvent::Measurement(_))));

    registry.close_all().await;
}

/// A severed link surfaces as a rebuilt driver, not a dead port.
#[tokio::test]
async fn usb_disconnect_recovers() {
    init_tracing();
    let sim = BusSimulator::new();
    sim.add_node(3, NodeConfig::flow_meter("AiR", 100.0)).await;
    sim.set_value(3, 33, 0, ParameterValue::Float(1.25)).await;

    let registry = PortRegistry::new(EventSink::disconnected(), PollerConfig::default());
    let entry = registry
        .open_port_with_factory(Arc::new(SimLinkFactory::new("SIM0", sim.clone())), sim_config())
        .unwrap();

    assert_eq!(
        registry.read_dde("SIM0", 3, 205).await.unwrap(),
        ParameterValue::Float(1.25)
    );
    let epoch_before = entry.manager.epoch();

    // Yank the adapter.
    sim.disconnect_links();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The next operation rebuilds the driver behind the retry budget.
    assert_eq!(
        registry.read_dde("SIM0", 3, 205).await.unwrap(),
        ParameterValue::Float(1.25)
    );
    assert!(entry.manager.epoch() > epoch_before);
    registry.close_all().await;
}
