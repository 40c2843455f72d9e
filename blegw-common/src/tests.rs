use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::address::Address;
use crate::config::GatewayConfig;
use crate::error::{Error, TransportError};
use crate::gateway::{
    GatewayManager, GatewaySnapshot, Handle, Peripheral, PeripheralState, ScanResult, Service,
    ServiceState, TransportEvent,
};
use crate::transport::Transport;

const SENSOR: Address = Address([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
const BEACON: Address = Address([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);

const ENV_SERVICE: Uuid = Uuid::from_u128(0x0000_181a_0000_1000_8000_0080_5f9b_34fb);
const TEMPERATURE: Uuid = Uuid::from_u128(0x0000_2a6e_0000_1000_8000_0080_5f9b_34fb);
const HUMIDITY: Uuid = Uuid::from_u128(0x0000_2a6f_0000_1000_8000_0080_5f9b_34fb);
const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);
const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

/// Requests issued through the transport, in order
#[derive(Clone, Debug, PartialEq)]
enum Issued {
    Scan,
    Connect(Handle),
    Disconnect(Handle),
    DiscoverServices(Handle),
    DiscoverCharacteristics(Handle, Uuid),
    Read(Handle, Uuid, Uuid),
    Subscribe(Handle, Uuid, Uuid),
}

#[derive(Default)]
struct RecordingTransport {
    issued: Vec<Issued>,
}

impl RecordingTransport {
    fn take(&mut self) -> Vec<Issued> {
        std::mem::take(&mut self.issued)
    }
}

impl Transport for RecordingTransport {
    fn scan(&mut self) {
        self.issued.push(Issued::Scan);
    }

    fn connect(&mut self, handle: Handle) {
        self.issued.push(Issued::Connect(handle));
    }

    fn disconnect(&mut self, handle: Handle) {
        self.issued.push(Issued::Disconnect(handle));
    }

    fn discover_services(&mut self, handle: Handle) {
        self.issued.push(Issued::DiscoverServices(handle));
    }

    fn discover_characteristics(&mut self, handle: Handle, service: Uuid) {
        self.issued.push(Issued::DiscoverCharacteristics(handle, service));
    }

    fn read(&mut self, handle: Handle, service: Uuid, characteristic: Uuid) {
        self.issued.push(Issued::Read(handle, service, characteristic));
    }

    fn subscribe(&mut self, handle: Handle, service: Uuid, characteristic: Uuid) {
        self.issued.push(Issued::Subscribe(handle, service, characteristic));
    }
}

fn config() -> GatewayConfig {
    let json = format!(
        r#"{{
            "peripherals": [
                {{
                    "address": "{SENSOR}",
                    "name": "sensor",
                    "stay_connected": true,
                    "services": [
                        {{
                            "uuid": "{ENV_SERVICE}",
                            "characteristics": [
                                {{ "uuid": "{TEMPERATURE}", "notify": true }},
                                {{ "uuid": "{HUMIDITY}", "read_freq_secs": 5 }}
                            ]
                        }},
                        {{
                            "uuid": "{BATTERY_SERVICE}",
                            "characteristics": [{{ "uuid": "{BATTERY_LEVEL}", "read_freq_secs": 60 }}]
                        }}
                    ]
                }},
                {{
                    "address": "{BEACON}",
                    "services": [
                        {{
                            "uuid": "{BATTERY_SERVICE}",
                            "characteristics": [{{ "uuid": "{BATTERY_LEVEL}", "read_freq_secs": 10 }}]
                        }}
                    ]
                }}
            ],
            "retry": {{ "max_attempts": 2, "base_delay_ms": 100, "max_delay_ms": 1000 }}
        }}"#
    );

    GatewayConfig::from_json(&json).unwrap()
}

fn later() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

fn setup() -> (GatewayManager, RecordingTransport) {
    (GatewayManager::new(&config()), RecordingTransport::default())
}

/// Drives `address` from a scan match up to characteristic discovery of `services`
fn connect(
    manager: &mut GatewayManager,
    transport: &mut RecordingTransport,
    address: Address,
    services: &[Uuid],
) -> Handle {
    manager.handle_event(TransportEvent::Discovered { address }, transport);
    let handle = manager.find_peripheral(&address).unwrap().handle().unwrap();

    manager.handle_event(TransportEvent::Connected { handle }, transport);
    manager.handle_event(
        TransportEvent::ServicesDiscovered {
            handle,
            services: services.to_vec(),
        },
        transport,
    );
    handle
}

fn discover_env(manager: &mut GatewayManager, transport: &mut RecordingTransport, handle: Handle) {
    manager.handle_event(
        TransportEvent::CharacteristicsDiscovered {
            handle,
            service: ENV_SERVICE,
            characteristics: vec![TEMPERATURE, HUMIDITY],
        },
        transport,
    );
}

#[test]
fn unknown_device_is_ignored() {
    let (mut manager, mut transport) = setup();
    let stranger = Address([1, 2, 3, 4, 5, 6]);

    let value = manager.handle_event(TransportEvent::Discovered { address: stranger }, &mut transport);

    assert!(value.is_none());
    assert!(transport.take().is_empty());
}

#[test]
fn scan_match_binds_handle_and_connects() {
    let (mut manager, mut transport) = setup();

    manager.scan(&mut transport);
    manager.scan(&mut transport);
    assert!(manager.is_scanning());

    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);
    manager.handle_event(TransportEvent::ScanStopped, &mut transport);

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    let handle = Handle::new(SENSOR, 1);
    assert_eq!(sensor.state(), PeripheralState::Connecting);
    assert_eq!(sensor.handle(), Some(handle));
    assert!(!manager.is_scanning());
    assert_eq!(transport.take(), vec![Issued::Scan, Issued::Connect(handle)]);
}

#[test]
fn full_discovery_subscribes_and_schedules_reads() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE, BATTERY_SERVICE]);

    assert_eq!(
        transport.take(),
        vec![
            Issued::Connect(handle),
            Issued::DiscoverServices(handle),
            Issued::DiscoverCharacteristics(handle, ENV_SERVICE),
            Issued::DiscoverCharacteristics(handle, BATTERY_SERVICE),
        ]
    );

    discover_env(&mut manager, &mut transport, handle);
    assert_eq!(
        transport.take(),
        vec![Issued::Subscribe(handle, ENV_SERVICE, TEMPERATURE)]
    );

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::DiscoveredServices);
    let env = sensor.find_service(&ENV_SERVICE).unwrap();
    assert_eq!(env.state(), ServiceState::DiscoveredCharacteristics);
    assert_eq!(env.characteristic_uuids(), vec![TEMPERATURE, HUMIDITY]);
    assert_eq!(
        sensor.find_service(&BATTERY_SERVICE).unwrap().state(),
        ServiceState::DiscoveringCharacteristics
    );

    // Only the periodic characteristic of the discovered service is due
    manager.poll(Instant::now(), &mut transport);
    assert_eq!(
        transport.take(),
        vec![Issued::Read(handle, ENV_SERVICE, HUMIDITY)]
    );
}

#[test]
fn unconfigured_and_duplicate_uuids_are_skipped() {
    let (mut manager, mut transport) = setup();
    let stray = Uuid::from_u128(0xdead_beef);
    let handle = connect(&mut manager, &mut transport, SENSOR, &[stray, ENV_SERVICE]);

    manager.handle_event(
        TransportEvent::CharacteristicsDiscovered {
            handle,
            service: ENV_SERVICE,
            characteristics: vec![HUMIDITY, stray, HUMIDITY],
        },
        &mut transport,
    );

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.service_uuids(), vec![ENV_SERVICE]);
    assert_eq!(
        sensor.find_service(&ENV_SERVICE).unwrap().characteristic_uuids(),
        vec![HUMIDITY]
    );
}

#[test]
fn service_keeps_exactly_the_configured_characteristics() {
    let config = config();
    let mut transport = RecordingTransport::default();
    let handle = Handle::new(SENSOR, 1);
    let mut service = Service::new(SENSOR, config.peripherals[0].services[0].clone(), 2);

    service.discover_characteristics(handle, &mut transport).unwrap();
    service
        .on_discover_characteristics_success(
            &[TEMPERATURE, HUMIDITY, Uuid::from_u128(0x1234)],
            handle,
            &mut transport,
        )
        .unwrap();

    assert_eq!(service.state(), ServiceState::DiscoveredCharacteristics);
    assert_eq!(service.characteristics().len(), 2);
    assert!(service
        .characteristics()
        .iter()
        .all(|c| c.service == ENV_SERVICE));
}

#[test]
fn empty_service_discovery_is_a_valid_outcome() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[]);

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::DiscoveredServices);
    assert!(sensor.services().is_empty());
    assert_eq!(
        transport.take(),
        vec![Issued::Connect(handle), Issued::DiscoverServices(handle)]
    );
    assert_eq!(manager.next_deadline(), None);
}

#[test]
fn out_of_state_operations_are_rejected_without_mutation() {
    let config = config();
    let mut transport = RecordingTransport::default();
    let mut peripheral = Peripheral::from_config(
        config.peripherals[0].clone(),
        config.retry,
        config.max_service_retries,
    );

    let result = peripheral.on_connect_success(&mut transport);
    assert!(matches!(result, Err(Error::InvalidState { .. })));
    assert!(matches!(
        peripheral.on_disconnect(None),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        peripheral.prepare_for_read(),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        peripheral.read(&ENV_SERVICE, &HUMIDITY, &mut transport),
        Err(Error::InvalidState { .. })
    ));

    assert_eq!(peripheral.state(), PeripheralState::Unconnected);
    assert_eq!(peripheral.handle(), None);
    assert_eq!(peripheral.retry_at(), None);
    assert!(transport.take().is_empty());

    let handle = Handle::new(SENSOR, 7);
    let mut service =
        Service::new(SENSOR, config.peripherals[0].services[0].clone(), 2);
    service.discover_characteristics(handle, &mut transport).unwrap();
    assert!(matches!(
        service.discover_characteristics(handle, &mut transport),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        service.on_read_complete(&HUMIDITY, vec![1]),
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(service.state(), ServiceState::DiscoveringCharacteristics);
    assert_eq!(
        transport.take(),
        vec![Issued::DiscoverCharacteristics(handle, ENV_SERVICE)]
    );
}

#[test]
fn disconnect_resets_tree_and_schedules_reconnect() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    discover_env(&mut manager, &mut transport, handle);
    manager.handle_event(
        TransportEvent::Subscribed {
            handle,
            service: ENV_SERVICE,
            characteristic: TEMPERATURE,
        },
        &mut transport,
    );
    transport.take();

    manager.handle_event(
        TransportEvent::Disconnected {
            handle,
            error: Some(TransportError::new("link lost")),
        },
        &mut transport,
    );

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::Unconnected);
    assert_eq!(sensor.handle(), None);
    assert!(sensor.retry_at().is_some());
    assert_eq!(sensor.attempts(), 1);

    let env = sensor.find_service(&ENV_SERVICE).unwrap();
    assert_eq!(env.state(), ServiceState::Sleep);
    assert!(!env.find_characteristic(&TEMPERATURE).unwrap().is_subscribed());
    assert!(!env.any_pending_responses());
    assert!(transport.take().is_empty());

    // Reconnect reuses the service objects and issues a fresh handle
    manager.poll(later(), &mut transport);
    let handle = Handle::new(SENSOR, 2);
    assert_eq!(transport.take(), vec![Issued::Connect(handle)]);
}

#[test]
fn disconnect_from_any_connected_state_falls_back() {
    let (mut manager, mut transport) = setup();

    // From Connecting
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);
    let first = Handle::new(SENSOR, 1);
    manager.handle_event(
        TransportEvent::Disconnected {
            handle: first,
            error: None,
        },
        &mut transport,
    );

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::Unconnected);
    assert_eq!(sensor.handle(), None);
    assert!(sensor.retry_at().is_some());

    // From DiscoveringServices
    manager.poll(later(), &mut transport);
    let second = Handle::new(SENSOR, 2);
    manager.handle_event(TransportEvent::Connected { handle: second }, &mut transport);
    assert_eq!(
        manager.find_peripheral(&SENSOR).unwrap().state(),
        PeripheralState::DiscoveringServices
    );
    manager.handle_event(
        TransportEvent::Disconnected {
            handle: second,
            error: Some(TransportError::new("link lost")),
        },
        &mut transport,
    );

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::Unconnected);
    assert_eq!(sensor.attempts(), 2);
    assert!(sensor.retry_at().is_some());

    // Without stay_connected nothing is scheduled
    manager.handle_event(TransportEvent::Discovered { address: BEACON }, &mut transport);
    manager.handle_event(
        TransportEvent::Disconnected {
            handle: Handle::new(BEACON, 1),
            error: None,
        },
        &mut transport,
    );
    assert!(manager.find_peripheral(&BEACON).unwrap().is_dormant());
}

#[test]
fn success_callbacks_only_accepted_in_their_source_state() {
    let config = config();
    let mut transport = RecordingTransport::default();
    let mut peripheral = Peripheral::from_config(
        config.peripherals[0].clone(),
        config.retry,
        config.max_service_retries,
    );

    peripheral.on_discovered(SENSOR, &mut transport).unwrap();
    transport.take();
    assert!(matches!(
        peripheral.on_discover_services_success(&[ENV_SERVICE], &mut transport),
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(peripheral.state(), PeripheralState::Connecting);
    assert!(peripheral.services().is_empty());
    assert!(transport.take().is_empty());

    peripheral.on_connect_success(&mut transport).unwrap();
    peripheral
        .on_discover_services_success(&[ENV_SERVICE], &mut transport)
        .unwrap();
    transport.take();

    assert!(matches!(
        peripheral.on_discover_services_success(&[ENV_SERVICE, BATTERY_SERVICE], &mut transport),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        peripheral.on_connect_success(&mut transport),
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(peripheral.state(), PeripheralState::DiscoveredServices);
    assert_eq!(peripheral.service_uuids(), vec![ENV_SERVICE]);
    assert!(transport.take().is_empty());

    let handle = Handle::new(SENSOR, 1);
    let mut service = Service::new(SENSOR, config.peripherals[0].services[0].clone(), 2);
    assert!(matches!(
        service.on_discover_characteristics_success(&[TEMPERATURE], handle, &mut transport),
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(service.state(), ServiceState::Sleep);
    assert!(service.characteristics().is_empty());
    assert!(transport.take().is_empty());
}

#[test]
fn notify_subscription_is_renewed_after_reconnect() {
    let (mut manager, mut transport) = setup();
    let first = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    discover_env(&mut manager, &mut transport, first);
    manager.handle_event(
        TransportEvent::Subscribed {
            handle: first,
            service: ENV_SERVICE,
            characteristic: TEMPERATURE,
        },
        &mut transport,
    );
    manager.handle_event(
        TransportEvent::Disconnected {
            handle: first,
            error: None,
        },
        &mut transport,
    );
    transport.take();

    manager.poll(later(), &mut transport);
    let second = Handle::new(SENSOR, 2);
    manager.handle_event(TransportEvent::Connected { handle: second }, &mut transport);
    manager.handle_event(
        TransportEvent::ServicesDiscovered {
            handle: second,
            services: vec![ENV_SERVICE],
        },
        &mut transport,
    );
    discover_env(&mut manager, &mut transport, second);

    assert_eq!(
        transport.take(),
        vec![
            Issued::Connect(second),
            Issued::DiscoverServices(second),
            Issued::DiscoverCharacteristics(second, ENV_SERVICE),
            Issued::Subscribe(second, ENV_SERVICE, TEMPERATURE),
        ]
    );
    let env = manager
        .find_peripheral(&SENSOR)
        .unwrap()
        .find_service(&ENV_SERVICE)
        .unwrap();
    assert!(!env.find_characteristic(&TEMPERATURE).unwrap().is_subscribed());
}

#[test]
fn disconnect_without_stay_connected_waits_for_scan() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, BEACON, &[BATTERY_SERVICE]);

    manager.handle_event(TransportEvent::Disconnected { handle, error: None }, &mut transport);

    let beacon = manager.find_peripheral(&BEACON).unwrap();
    assert!(beacon.is_dormant());
    assert_eq!(beacon.attempts(), 0);

    transport.take();
    manager.poll(later(), &mut transport);
    assert!(transport.take().is_empty());
    assert!(manager.needs_scan());
}

#[test]
fn exhausted_retries_go_dormant_until_next_scan_match() {
    let (mut manager, mut transport) = setup();
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);

    // One initial attempt plus two retries
    for epoch in 1..=3 {
        let handle = Handle::new(SENSOR, epoch);
        manager.handle_event(
            TransportEvent::ConnectFailed {
                handle,
                error: TransportError::new("timeout"),
            },
            &mut transport,
        );
        manager.poll(later(), &mut transport);
    }

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert!(sensor.is_dormant());
    assert_eq!(sensor.attempts(), 3);
    assert_eq!(
        transport.take(),
        vec![
            Issued::Connect(Handle::new(SENSOR, 1)),
            Issued::Connect(Handle::new(SENSOR, 2)),
            Issued::Connect(Handle::new(SENSOR, 3)),
        ]
    );

    // Same scan, already reported
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);
    assert!(manager.find_peripheral(&SENSOR).unwrap().is_dormant());
    assert!(manager.needs_scan());

    manager.scan(&mut transport);
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::Connecting);
    assert_eq!(sensor.attempts(), 0);
    assert_eq!(
        transport.take(),
        vec![Issued::Scan, Issued::Connect(Handle::new(SENSOR, 4))]
    );
}

#[test]
fn scan_matches_during_backoff_do_not_reconnect() {
    let (mut manager, mut transport) = setup();
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);

    for _ in 0..10 {
        if let Some(handle) = manager.find_peripheral(&SENSOR).unwrap().handle() {
            manager.handle_event(
                TransportEvent::ConnectFailed {
                    handle,
                    error: TransportError::new("timeout"),
                },
                &mut transport,
            );
        }

        // A fresh scan every round, only the pending backoff holds the peripheral back
        manager.handle_event(TransportEvent::ScanStopped, &mut transport);
        manager.scan(&mut transport);
        manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);
    }

    let connects = transport
        .take()
        .into_iter()
        .filter(|issued| matches!(issued, Issued::Connect(_)))
        .count();
    assert_eq!(connects, 1);

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::Unconnected);
    assert_eq!(sensor.attempts(), 1);
    assert!(sensor.retry_at().is_some());
}

#[test]
fn repeated_reports_in_one_scan_count_once() {
    let (mut manager, mut transport) = setup();
    manager.scan(&mut transport);
    manager.handle_event(TransportEvent::Discovered { address: BEACON }, &mut transport);
    manager.handle_event(
        TransportEvent::ConnectFailed {
            handle: Handle::new(BEACON, 1),
            error: TransportError::new("refused"),
        },
        &mut transport,
    );
    assert!(manager.find_peripheral(&BEACON).unwrap().is_dormant());

    for _ in 0..5 {
        manager.handle_event(TransportEvent::Discovered { address: BEACON }, &mut transport);
    }
    assert_eq!(manager.scan_results().len(), 1);
    assert_eq!(
        transport.take(),
        vec![Issued::Scan, Issued::Connect(Handle::new(BEACON, 1))]
    );

    manager.handle_event(TransportEvent::ScanStopped, &mut transport);
    manager.scan(&mut transport);
    manager.handle_event(TransportEvent::Discovered { address: BEACON }, &mut transport);

    assert_eq!(
        transport.take(),
        vec![Issued::Scan, Issued::Connect(Handle::new(BEACON, 2))]
    );
}

#[test]
fn scan_results_list_every_reported_device() {
    let (mut manager, mut transport) = setup();
    let stranger = Address([1, 2, 3, 4, 5, 6]);

    manager.scan(&mut transport);
    for address in [SENSOR, stranger, SENSOR] {
        manager.handle_event(TransportEvent::Discovered { address }, &mut transport);
    }

    assert_eq!(
        manager.scan_results(),
        &[
            ScanResult {
                address: SENSOR,
                name: Some("sensor".to_owned()),
                configured: true,
            },
            ScanResult {
                address: stranger,
                name: None,
                configured: false,
            },
        ]
    );

    manager.handle_event(TransportEvent::ScanStopped, &mut transport);
    manager.scan(&mut transport);
    assert!(manager.scan_results().is_empty());
}

#[test]
fn stopped_peripheral_ignores_scan_matches_until_started() {
    let (mut manager, mut transport) = setup();
    connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    manager.stop(&SENSOR, &mut transport).unwrap();
    manager.stop(&BEACON, &mut transport).unwrap();
    transport.take();

    assert!(manager.find_peripheral(&SENSOR).unwrap().is_stopped());
    assert!(!manager.needs_scan());

    manager.scan(&mut transport);
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);

    assert_eq!(
        manager.find_peripheral(&SENSOR).unwrap().state(),
        PeripheralState::Unconnected
    );
    assert_eq!(transport.take(), vec![Issued::Scan]);

    manager.start(&SENSOR, &mut transport).unwrap();

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert!(!sensor.is_stopped());
    assert_eq!(sensor.state(), PeripheralState::Connecting);
    assert_eq!(transport.take(), vec![Issued::Connect(Handle::new(SENSOR, 2))]);
    assert!(!manager.needs_scan());
}

#[test]
fn retry_backoff_grows_between_attempts() {
    let (mut manager, mut transport) = setup();
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);
    let error = TransportError::new("refused");

    manager.handle_event(
        TransportEvent::ConnectFailed {
            handle: Handle::new(SENSOR, 1),
            error: error.clone(),
        },
        &mut transport,
    );
    let first = manager.find_peripheral(&SENSOR).unwrap().retry_at().unwrap();

    // Not due yet
    manager.poll(Instant::now(), &mut transport);
    assert_eq!(
        manager.find_peripheral(&SENSOR).unwrap().state(),
        PeripheralState::Unconnected
    );

    manager.poll(later(), &mut transport);
    let before = Instant::now();
    manager.handle_event(
        TransportEvent::ConnectFailed {
            handle: Handle::new(SENSOR, 2),
            error,
        },
        &mut transport,
    );
    let second = manager.find_peripheral(&SENSOR).unwrap().retry_at().unwrap();

    assert!(second >= before + Duration::from_millis(200));
    assert!(second > first);
    assert_eq!(manager.next_deadline(), Some(second));
}

#[test]
fn stale_completion_is_discarded() {
    let (mut manager, mut transport) = setup();
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);
    let stale = Handle::new(SENSOR, 1);
    manager.handle_event(
        TransportEvent::ConnectFailed {
            handle: stale,
            error: TransportError::new("timeout"),
        },
        &mut transport,
    );
    manager.poll(later(), &mut transport);
    transport.take();

    manager.handle_event(TransportEvent::Connected { handle: stale }, &mut transport);

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::Connecting);
    assert_eq!(sensor.handle(), Some(Handle::new(SENSOR, 2)));
    assert!(transport.take().is_empty());
}

#[test]
fn service_discovery_failure_drops_connection() {
    let (mut manager, mut transport) = setup();
    manager.handle_event(TransportEvent::Discovered { address: SENSOR }, &mut transport);
    let handle = Handle::new(SENSOR, 1);
    manager.handle_event(TransportEvent::Connected { handle }, &mut transport);
    transport.take();

    manager.handle_event(
        TransportEvent::ServicesFailed {
            handle,
            error: TransportError::new("gatt error"),
        },
        &mut transport,
    );

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::Unconnected);
    assert!(sensor.retry_at().is_some());
    assert_eq!(transport.take(), vec![Issued::Disconnect(handle)]);
}

#[test]
fn characteristic_discovery_retries_locally_then_escalates() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    transport.take();
    let failure = || TransportEvent::CharacteristicsFailed {
        handle,
        service: ENV_SERVICE,
        error: TransportError::new("busy"),
    };

    for _ in 0..2 {
        manager.handle_event(failure(), &mut transport);
        assert_eq!(
            transport.take(),
            vec![Issued::DiscoverCharacteristics(handle, ENV_SERVICE)]
        );
        assert_eq!(
            manager.find_peripheral(&SENSOR).unwrap().state(),
            PeripheralState::DiscoveredServices
        );
    }

    manager.handle_event(failure(), &mut transport);

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::Unconnected);
    assert_eq!(sensor.attempts(), 1);
    assert_eq!(transport.take(), vec![Issued::Disconnect(handle)]);
}

#[test]
fn only_one_read_outstanding_per_characteristic() {
    let config = config();
    let mut transport = RecordingTransport::default();
    let mut peripheral = Peripheral::from_config(
        config.peripherals[0].clone(),
        config.retry,
        config.max_service_retries,
    );
    peripheral.on_discovered(SENSOR, &mut transport).unwrap();
    peripheral.on_connect_success(&mut transport).unwrap();
    peripheral
        .on_discover_services_success(&[ENV_SERVICE], &mut transport)
        .unwrap();
    peripheral
        .on_discover_characteristics_success(&ENV_SERVICE, &[TEMPERATURE, HUMIDITY], &mut transport)
        .unwrap();
    peripheral.on_subscribed(&ENV_SERVICE, &TEMPERATURE).unwrap();
    let handle = peripheral.handle().unwrap();
    assert!(!peripheral.any_pending_responses());
    transport.take();

    assert!(peripheral.read(&ENV_SERVICE, &TEMPERATURE, &mut transport).unwrap());
    assert!(!peripheral.read(&ENV_SERVICE, &TEMPERATURE, &mut transport).unwrap());
    assert!(peripheral.any_pending_responses());
    assert_eq!(
        transport.take(),
        vec![Issued::Read(handle, ENV_SERVICE, TEMPERATURE)]
    );

    let received = peripheral
        .on_read_complete(&ENV_SERVICE, &TEMPERATURE, vec![0x10, 0x09])
        .unwrap();
    assert_eq!(received.peripheral, SENSOR);
    assert_eq!(received.service, ENV_SERVICE);
    assert_eq!(received.characteristic, TEMPERATURE);
    assert_eq!(received.value, vec![0x10, 0x09]);

    assert!(!peripheral.any_pending_responses());
    assert!(peripheral.read(&ENV_SERVICE, &TEMPERATURE, &mut transport).unwrap());
}

#[test]
fn overdue_periodic_read_is_issued_again() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    discover_env(&mut manager, &mut transport, handle);
    transport.take();

    let now = Instant::now();
    manager.poll(now, &mut transport);
    manager.poll(now + Duration::from_secs(1), &mut transport);
    manager.poll(now + Duration::from_secs(5), &mut transport);

    assert_eq!(
        transport.take(),
        vec![
            Issued::Read(handle, ENV_SERVICE, HUMIDITY),
            Issued::Read(handle, ENV_SERVICE, HUMIDITY),
        ]
    );

    let env = manager
        .find_peripheral(&SENSOR)
        .unwrap()
        .find_service(&ENV_SERVICE)
        .unwrap();
    assert!(env.find_characteristic(&HUMIDITY).unwrap().is_read_pending());
    assert_eq!(
        env.next_read(),
        Some(now + Duration::from_secs(10))
    );
}

#[test]
fn read_completion_and_notification_are_forwarded() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    discover_env(&mut manager, &mut transport, handle);
    manager.poll(Instant::now(), &mut transport);

    let read = manager
        .handle_event(
            TransportEvent::ReadComplete {
                handle,
                service: ENV_SERVICE,
                characteristic: HUMIDITY,
                value: vec![42],
            },
            &mut transport,
        )
        .unwrap();
    assert_eq!(read.characteristic, HUMIDITY);
    assert_eq!(read.value, vec![42]);

    let notified = manager
        .handle_event(
            TransportEvent::Notification {
                handle,
                service: ENV_SERVICE,
                characteristic: TEMPERATURE,
                value: vec![1, 2],
            },
            &mut transport,
        )
        .unwrap();
    assert_eq!(notified.peripheral, SENSOR);
    assert_eq!(notified.characteristic, TEMPERATURE);

    let env = manager
        .find_peripheral(&SENSOR)
        .unwrap()
        .find_service(&ENV_SERVICE)
        .unwrap();
    assert!(env.find_characteristic(&TEMPERATURE).unwrap().last_value_at().is_some());
    assert!(!env.find_characteristic(&HUMIDITY).unwrap().is_read_pending());
}

#[test]
fn failed_subscription_is_retried_on_next_poll() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    discover_env(&mut manager, &mut transport, handle);

    // Still pending, nothing new goes out
    let now = Instant::now();
    manager.poll(now, &mut transport);
    transport.take();

    manager.handle_event(
        TransportEvent::SubscribeFailed {
            handle,
            service: ENV_SERVICE,
            characteristic: TEMPERATURE,
            error: TransportError::new("not permitted"),
        },
        &mut transport,
    );
    manager.poll(now, &mut transport);

    assert_eq!(
        transport.take(),
        vec![Issued::Subscribe(handle, ENV_SERVICE, TEMPERATURE)]
    );
}

#[test]
fn notification_before_characteristics_are_known_is_rejected() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);

    let value = manager.handle_event(
        TransportEvent::Notification {
            handle,
            service: ENV_SERVICE,
            characteristic: TEMPERATURE,
            value: vec![1],
        },
        &mut transport,
    );

    assert!(value.is_none());
    assert_eq!(
        manager
            .find_peripheral(&SENSOR)
            .unwrap()
            .find_service(&ENV_SERVICE)
            .unwrap()
            .state(),
        ServiceState::DiscoveringCharacteristics
    );
}

#[test]
fn prepare_for_read_rearms_every_periodic_read() {
    let (mut manager, mut transport) = setup();
    assert!(matches!(
        manager.prepare_for_read(&SENSOR),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        manager.prepare_for_read(&Address([0; 6])),
        Err(Error::NotFound(_))
    ));

    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    discover_env(&mut manager, &mut transport, handle);
    manager.handle_event(
        TransportEvent::Subscribed {
            handle,
            service: ENV_SERVICE,
            characteristic: TEMPERATURE,
        },
        &mut transport,
    );
    manager.poll(Instant::now(), &mut transport);
    transport.take();

    manager.prepare_for_read(&SENSOR).unwrap();
    assert!(!manager
        .find_peripheral(&SENSOR)
        .unwrap()
        .any_pending_responses());

    manager.poll(later(), &mut transport);
    assert_eq!(
        transport.take(),
        vec![Issued::Read(handle, ENV_SERVICE, HUMIDITY)]
    );
}

#[test]
fn stop_disconnects_and_stays_down() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    transport.take();

    manager.stop(&SENSOR, &mut transport).unwrap();

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert!(sensor.is_dormant());
    assert_eq!(
        sensor.find_service(&ENV_SERVICE).unwrap().state(),
        ServiceState::Sleep
    );
    assert_eq!(transport.take(), vec![Issued::Disconnect(handle)]);

    // Completions of the cancelled discovery arrive late and are dropped
    discover_env(&mut manager, &mut transport, handle);
    manager.handle_event(TransportEvent::Disconnected { handle, error: None }, &mut transport);
    manager.poll(later(), &mut transport);

    let sensor = manager.find_peripheral(&SENSOR).unwrap();
    assert_eq!(sensor.state(), PeripheralState::Unconnected);
    assert_eq!(sensor.retry_at(), None);
    assert!(transport.take().is_empty());
}

#[test]
fn stop_all_only_touches_active_peripherals() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    transport.take();

    manager.stop_all(&mut transport);

    assert_eq!(transport.take(), vec![Issued::Disconnect(handle)]);
    assert!(manager.peripherals().iter().all(|p| p.is_dormant()));
}

#[test]
fn snapshot_reflects_tree() {
    let (mut manager, mut transport) = setup();
    let handle = connect(&mut manager, &mut transport, SENSOR, &[ENV_SERVICE]);
    discover_env(&mut manager, &mut transport, handle);

    let snapshot = manager.snapshot();

    assert_eq!(snapshot.peripherals.len(), 2);
    let sensor = &snapshot.peripherals[0];
    assert_eq!(sensor.address, SENSOR);
    assert_eq!(sensor.state, PeripheralState::DiscoveredServices);
    assert_eq!(sensor.services[0].characteristics.len(), 2);
    assert!(sensor.services[0].characteristics[0].pending);

    let rendered = snapshot.to_string();
    assert!(rendered.contains(&SENSOR.to_string()));
    assert!(rendered.contains(&HUMIDITY.to_string()));

    let json = serde_json::to_string(&snapshot).unwrap();
    let back: GatewaySnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(back, snapshot);
}
