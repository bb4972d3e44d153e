//! End-to-end enrollment tests: two enrollment tasks joined by an
//! in-process layer-management flow that the tests pump explicitly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use rina_core::PortId;
use rina_enrollment::cdap::{obj, CdapMessage, CdapOp, DataTransferConstants, DftEntry, QosCube};
use rina_enrollment::rib::OperationalStatus;
use rina_enrollment::{
    AllowAll, CdapSender, EnrollmentConfig, EnrollmentError, EnrollmentEvent, EnrollmentTask,
    FlowAllocator, NamespaceManager, Neighbor, Rib, SecurityPolicy,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestWire {
    outbox: Mutex<Vec<(PortId, CdapMessage)>>,
}

impl TestWire {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn drain(&self) -> Vec<(PortId, CdapMessage)> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }

    fn is_empty(&self) -> bool {
        self.outbox.lock().unwrap().is_empty()
    }
}

impl CdapSender for TestWire {
    fn send_cdap(&self, port: PortId, msg: CdapMessage) -> Result<(), EnrollmentError> {
        self.outbox.lock().unwrap().push((port, msg));
        Ok(())
    }
}

#[derive(Default)]
struct TestFlows {
    next_handle: AtomicU64,
    fail_allocation: AtomicBool,
    deallocated: Mutex<Vec<u32>>,
}

impl TestFlows {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl FlowAllocator for TestFlows {
    fn allocate_flow(&self, _local: &str, _remote: &str, _dif: &str)
        -> Result<u64, EnrollmentError> {
        if self.fail_allocation.load(Ordering::SeqCst) {
            return Err(EnrollmentError::FlowAllocation("no n-1 dif".into()));
        }
        Ok(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn deallocate_flow(&self, port: PortId) {
        self.deallocated.lock().unwrap().push(port.value());
    }
}

struct TestNsm;

impl NamespaceManager for TestNsm {
    fn is_valid_address(&self, address: u32, _ap_name: &str) -> bool {
        address != 0 && address < 100
    }

    fn allocate_address(&self, _ap_name: &str) -> Option<u32> {
        Some(42)
    }
}

struct DenyAll;

impl SecurityPolicy for DenyAll {
    fn allowed_to_join(&self, _ap_name: &str) -> bool {
        false
    }
}

struct Endpoint {
    task: Arc<EnrollmentTask>,
    events: Receiver<EnrollmentEvent>,
    wire: Arc<TestWire>,
    flows: Arc<TestFlows>,
}

fn endpoint(name: &str, rib: Rib, config: EnrollmentConfig) -> Endpoint {
    endpoint_with_security(name, rib, config, Arc::new(AllowAll))
}

fn endpoint_with_security(
    name: &str,
    rib: Rib,
    config: EnrollmentConfig,
    security: Arc<dyn SecurityPolicy>,
) -> Endpoint {
    let wire = TestWire::new();
    let flows = TestFlows::new();
    let (task, events) = EnrollmentTask::new(
        config,
        name,
        Arc::new(Mutex::new(rib)),
        wire.clone() as Arc<dyn CdapSender>,
        flows.clone() as Arc<dyn FlowAllocator>,
        Arc::new(TestNsm),
        security,
    );
    Endpoint {
        task,
        events,
        wire,
        flows,
    }
}

/// A RIB as a long-standing DIF member would have it.
fn member_rib() -> Rib {
    let mut rib = Rib::new("testdif");
    rib.address = 1;
    rib.operational = OperationalStatus::AssignedToDif;
    rib.constants = Some(DataTransferConstants::default());
    rib.qos_cubes = vec![QosCube {
        id: 1,
        name: "reliable".into(),
        ordered: true,
        partial_delivery: false,
        max_allowable_gap: 0,
    }];
    rib.dft_entries = vec![DftEntry {
        app_name: "rina.apps.echo".into(),
        address: 1,
    }];
    rib
}

/// Move pending messages from `from`'s wire into `to`'s task.
fn pump(from: &Endpoint, to: &Endpoint) -> usize {
    let msgs = from.wire.drain();
    let count = msgs.len();
    for (port, msg) in msgs {
        let _ = to.task.handle_cdap(port, msg);
    }
    count
}

fn pump_until_quiet(a: &Endpoint, b: &Endpoint) {
    while !a.wire.is_empty() || !b.wire.is_empty() {
        pump(a, b);
        pump(b, a);
    }
}

const PORT: PortId = PortId::new(7);

/// Drive endpoint `a` through flow allocation into the CONNECT exchange.
fn start_enrollment(a: &Endpoint) -> u64 {
    let handle = a.task.enroll_to_dif("ipcp-b", "ethdif").unwrap();
    a.task.flow_allocated(handle, PORT).unwrap();
    handle
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[test]
fn enrollment_happy_path() {
    let a = endpoint("ipcp-a", Rib::new("testdif"), EnrollmentConfig::default());
    let b = endpoint("ipcp-b", member_rib(), EnrollmentConfig::default());

    start_enrollment(&a);
    pump_until_quiet(&a, &b);

    // The enrollee got an address from the enroller's namespace manager
    // and a full copy of the static and dynamic DIF state.
    {
        let rib = a.task.rib().lock().unwrap();
        assert_eq!(rib.address, 42);
        assert_eq!(rib.operational, OperationalStatus::AssignedToDif);
        assert!(rib.constants.is_some());
        assert_eq!(rib.qos_cubes.len(), 1);
        assert_eq!(rib.dft_entries.len(), 1);
        let peer = rib.neighbor("ipcp-b").expect("enroller in neighbor set");
        assert!(peer.enrolled);
        assert_eq!(peer.underlying_port_id, PORT);
    }
    assert!(a.task.is_enrolled_to("ipcp-b"));
    assert!(b.task.is_enrolled_to("ipcp-a"));

    // Both sides told their IPC manager.
    let ev = a.events.try_recv().unwrap();
    assert_eq!(
        ev,
        EnrollmentEvent::Completed {
            peer: "ipcp-b".into(),
            port: PORT,
            enrollee: true,
            address: 42,
            dif_name: "testdif".into(),
        }
    );
    let ev = b.events.try_recv().unwrap();
    assert!(matches!(
        ev,
        EnrollmentEvent::Completed { enrollee: false, address: 42, .. }
    ));

    // The enroller recorded the assigned address and supporting DIF.
    {
        let rib = b.task.rib().lock().unwrap();
        let peer = rib.neighbor("ipcp-a").unwrap();
        assert_eq!(peer.address, 42);
        assert_eq!(peer.supporting_difs, vec!["ethdif".to_string()]);
    }
}

#[test]
fn member_keeps_existing_address() {
    let mut rib_a = Rib::new("testdif");
    rib_a.address = 9; // valid per TestNsm
    let a = endpoint("ipcp-a", rib_a, EnrollmentConfig::default());
    let b = endpoint("ipcp-b", member_rib(), EnrollmentConfig::default());

    start_enrollment(&a);
    pump_until_quiet(&a, &b);

    assert_eq!(a.task.rib().lock().unwrap().address, 9);
    assert_eq!(b.task.rib().lock().unwrap().neighbor("ipcp-a").unwrap().address, 9);
    assert!(a.task.is_enrolled_to("ipcp-b"));
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[test]
fn timeout_aborts_and_releases_the_flow() {
    let config = EnrollmentConfig {
        enrollment_timeout_ms: 20,
        ..EnrollmentConfig::default()
    };
    let a = endpoint("ipcp-a", Rib::new("testdif"), config);

    start_enrollment(&a);
    // Never pump: the CONNECT response timeout fires.
    thread::sleep(Duration::from_millis(120));
    a.task.process_internal_events();

    let ev = a.events.try_recv().unwrap();
    assert!(matches!(
        ev,
        EnrollmentEvent::Failed { ref peer, port, .. } if peer == "ipcp-b" && port == PORT
    ));
    assert!(!a.task.is_enrolled_to("ipcp-b"));
    assert_eq!(*a.flows.deallocated.lock().unwrap(), vec![PORT.value()]);
}

#[test]
fn security_rejection_fails_both_sides() {
    let a = endpoint("ipcp-a", Rib::new("testdif"), EnrollmentConfig::default());
    let b = endpoint_with_security(
        "ipcp-b",
        member_rib(),
        EnrollmentConfig::default(),
        Arc::new(DenyAll),
    );

    start_enrollment(&a);
    pump_until_quiet(&a, &b);

    assert!(matches!(
        b.events.try_recv().unwrap(),
        EnrollmentEvent::Failed { .. }
    ));
    assert!(matches!(
        a.events.try_recv().unwrap(),
        EnrollmentEvent::Failed { .. }
    ));
    assert!(!a.task.is_enrolled_to("ipcp-b"));
    assert!(!b.task.is_enrolled_to("ipcp-a"));
}

#[test]
fn out_of_order_message_aborts() {
    let a = endpoint("ipcp-a", Rib::new("testdif"), EnrollmentConfig::default());
    start_enrollment(&a);
    a.wire.drain();

    // A STOP in WAIT_CONNECT_RESPONSE is a protocol violation.
    let stop = CdapMessage::request(
        CdapOp::Stop,
        1,
        obj::ENROLLMENT_INFO_CLASS,
        obj::ENROLLMENT_INFO_NAME,
        rina_enrollment::ObjValue::EnrollmentInfo(rina_enrollment::EnrollmentInformation {
            address: None,
            allowed_to_start_early: true,
            supporting_difs: Vec::new(),
        }),
    )
    .between("ipcp-b", "ipcp-a");
    assert!(a.task.handle_cdap(PORT, stop).is_err());

    assert!(matches!(
        a.events.try_recv().unwrap(),
        EnrollmentEvent::Failed { .. }
    ));
    assert!(!a.task.is_enrolled_to("ipcp-b"));
}

#[test]
fn flow_allocation_failure_reports_to_manager() {
    let a = endpoint("ipcp-a", Rib::new("testdif"), EnrollmentConfig::default());
    let handle = a.task.enroll_to_dif("ipcp-b", "ethdif").unwrap();
    a.task.flow_allocation_failed(handle);
    assert!(matches!(
        a.events.try_recv().unwrap(),
        EnrollmentEvent::Failed { ref reason, .. } if reason.contains("flow allocation")
    ));
}

#[test]
fn failed_allocator_propagates() {
    let a = endpoint("ipcp-a", Rib::new("testdif"), EnrollmentConfig::default());
    a.flows.fail_allocation.store(true, Ordering::SeqCst);
    assert!(matches!(
        a.task.enroll_to_dif("ipcp-b", "ethdif"),
        Err(EnrollmentError::FlowAllocation(_))
    ));
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

#[test]
fn watchdog_probes_quiet_neighbors_and_measures_rtt() {
    let a = endpoint("ipcp-a", Rib::new("testdif"), EnrollmentConfig::default());
    {
        let mut rib = a.task.rib().lock().unwrap();
        let mut n = Neighbor::new("ipcp-b");
        n.enrolled = true;
        n.underlying_port_id = PORT;
        n.last_heard_from_ms = 1_000;
        rib.upsert_neighbor(n);
    }

    // Quiet past the period but well inside the dead interval: probe.
    let now = 1_000 + 30_000 + 1;
    a.task.watchdog_tick(now);
    let probes = a.wire.drain();
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].0, PORT);
    assert_eq!(probes[0].1.op, CdapOp::Read);
    assert_eq!(probes[0].1.obj_class, obj::ADDRESS_CLASS);

    // The reply updates liveness and the RTT estimate.
    a.task.watchdog_read_response("ipcp-b", now + 25);
    let rib = a.task.rib().lock().unwrap();
    let n = rib.neighbor("ipcp-b").unwrap();
    assert_eq!(n.average_rtt_ms, 25);
    assert_eq!(n.last_heard_from_ms, now + 25);
}

#[test]
fn watchdog_declares_dead_neighbor_and_releases_flow() {
    let a = endpoint("ipcp-a", Rib::new("testdif"), EnrollmentConfig::default());
    {
        let mut rib = a.task.rib().lock().unwrap();
        let mut n = Neighbor::new("ipcp-b");
        n.enrolled = true;
        n.underlying_port_id = PORT;
        n.last_heard_from_ms = 1_000;
        rib.upsert_neighbor(n);
    }

    let now = 1_000 + 120_000 + 30_000 + 1;
    a.task.watchdog_tick(now);

    assert_eq!(
        a.events.try_recv().unwrap(),
        EnrollmentEvent::NeighborDeclaredDead {
            name: "ipcp-b".into()
        }
    );
    assert_eq!(*a.flows.deallocated.lock().unwrap(), vec![PORT.value()]);
    assert!(!a.task.rib().lock().unwrap().neighbor("ipcp-b").unwrap().enrolled);
}

// ---------------------------------------------------------------------------
// Neighbor enroller loop
// ---------------------------------------------------------------------------

#[test]
fn neighbor_enroller_retries_with_remaining_attempts() {
    let a = endpoint("ipcp-a", Rib::new("testdif"), EnrollmentConfig::default());
    {
        let mut rib = a.task.rib().lock().unwrap();
        let mut n = Neighbor::new("ipcp-b");
        n.supporting_difs = vec!["ethdif".into()];
        rib.upsert_neighbor(n);
    }

    a.task.neighbor_enroller_pass();

    let rib = a.task.rib().lock().unwrap();
    assert_eq!(rib.neighbor("ipcp-b").unwrap().enrollment_attempts, 1);
}

#[test]
fn neighbor_enroller_drops_exhausted_neighbor() {
    let a = endpoint("ipcp-a", Rib::new("testdif"), EnrollmentConfig::default());
    {
        let mut rib = a.task.rib().lock().unwrap();
        let mut n = Neighbor::new("ipcp-b");
        n.enrollment_attempts = 3;
        rib.upsert_neighbor(n);
    }

    a.task.neighbor_enroller_pass();

    assert!(a.task.rib().lock().unwrap().neighbor("ipcp-b").is_none());
}
