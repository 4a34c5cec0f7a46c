use quoter::{
    BillRecord, BillSink, NullBillSink, QuoterService, QuoterTree, ResourceConfig, SessionEvent,
};
use std::sync::{Arc, Mutex};

const SECOND: u64 = 1_000_000;

fn consume_all(tree: &mut QuoterTree, client: u64, resource_id: u64, now: u64) {
    tree.update_consumption_state(client, resource_id, true, 1e18, now)
        .expect("session exists");
}

fn allocated_sum(events: &[SessionEvent], client: u64) -> f64 {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Allocated { client: c, amount, .. } if *c == client => Some(*amount),
            _ => None,
        })
        .sum()
}

#[test]
fn single_session_is_limited_to_the_resource_rate() {
    let mut tree = QuoterTree::default();
    let root = tree.add_resource("Root", ResourceConfig::with_rate(100.0)).unwrap();
    tree.subscribe(1, "Root").unwrap();
    consume_all(&mut tree, 1, root, 0);

    tree.run_until(2 * SECOND);

    let total = allocated_sum(&tree.take_events(), 1);
    // 10 Hz ticks, 10 units per tick, 20 ticks.
    assert!((total - 200.0).abs() < 1e-3, "total = {total}");
}

#[test]
fn weighted_children_share_proportionally() {
    // Two resources with weights 1 and 3 under a 400 units/sec parent, both
    // with a continuously-consuming session: 1 second delivers ~100 and ~300.
    let mut tree = QuoterTree::default();
    tree.add_resource("Root", ResourceConfig::with_rate(400.0)).unwrap();
    let first = tree.add_resource("Root/first", ResourceConfig::default().with_weight(1)).unwrap();
    let second = tree.add_resource("Root/second", ResourceConfig::default().with_weight(3)).unwrap();

    tree.subscribe(1, "Root/first").unwrap();
    tree.subscribe(2, "Root/second").unwrap();
    consume_all(&mut tree, 1, first, 0);
    consume_all(&mut tree, 2, second, 0);

    tree.run_until(SECOND);

    let events = tree.take_events();
    let a = allocated_sum(&events, 1);
    let b = allocated_sum(&events, 2);
    assert!((a - 100.0).abs() < 1e-3, "a = {a}");
    assert!((b - 300.0).abs() < 1e-3, "b = {b}");
    assert!(a + b <= 400.0 + 1e-3);
}

#[test]
fn child_rate_is_clamped_by_parent() {
    let mut tree = QuoterTree::default();
    tree.add_resource("Root", ResourceConfig::with_rate(100.0)).unwrap();
    let leaf = tree.add_resource("Root/leaf", ResourceConfig::with_rate(1000.0)).unwrap();

    let effective = tree.effective_config(leaf).unwrap();
    assert_eq!(effective.max_units_per_second, Some(100.0));

    tree.subscribe(1, "Root/leaf").unwrap();
    consume_all(&mut tree, 1, leaf, 0);
    tree.run_until(SECOND);

    let total = allocated_sum(&tree.take_events(), 1);
    assert!(total <= 100.0 + 1e-3, "total = {total}");
    assert!((total - 100.0).abs() < 1e-3, "total = {total}");
}

#[test]
fn bounded_request_stops_at_the_requested_amount() {
    let mut tree = QuoterTree::default();
    let root = tree.add_resource("Root", ResourceConfig::with_rate(100.0)).unwrap();
    tree.subscribe(1, "Root").unwrap();
    tree.update_consumption_state(1, root, true, 25.0, 0).unwrap();

    tree.run_until(10 * SECOND);

    let total = allocated_sum(&tree.take_events(), 1);
    assert!((total - 25.0).abs() < 1e-3, "total = {total}");

    // The session auto-deactivated and the tree went fully idle.
    tree.run_until(20 * SECOND);
    assert!(tree.take_events().is_empty());
    assert_eq!(tree.next_tick_at(), None);
}

#[test]
fn stop_consuming_halts_delivery() {
    let mut tree = QuoterTree::default();
    let root = tree.add_resource("Root", ResourceConfig::with_rate(100.0)).unwrap();
    tree.subscribe(1, "Root").unwrap();
    consume_all(&mut tree, 1, root, 0);

    tree.run_until(SECOND);
    let burst_total = allocated_sum(&tree.take_events(), 1);
    assert!(burst_total > 0.0);

    tree.update_consumption_state(1, root, false, 0.0, SECOND).unwrap();
    tree.run_until(5 * SECOND);
    assert_eq!(allocated_sum(&tree.take_events(), 1), 0.0);
}

#[test]
fn resource_lifecycle_errors() {
    let mut tree = QuoterTree::default();
    tree.add_resource("Root", ResourceConfig::with_rate(10.0)).unwrap();
    tree.add_resource("Root/a", ResourceConfig::default()).unwrap();

    assert!(matches!(
        tree.add_resource("Root", ResourceConfig::with_rate(10.0)),
        Err(quoter::Error::ResourceAlreadyExists(_)),
    ));
    assert!(matches!(
        tree.add_resource("Other/a", ResourceConfig::default()),
        Err(quoter::Error::ParentNotFound(_)),
    ));
    assert!(matches!(
        tree.add_resource("Root/bad path", ResourceConfig::default()),
        Err(quoter::Error::InvalidPath(_)),
    ));
    assert!(matches!(
        tree.delete_resource("Root"),
        Err(quoter::Error::HasChildren(_)),
    ));
    assert!(matches!(
        tree.delete_resource("Root/missing"),
        Err(quoter::Error::ResourceNotFound(_)),
    ));
    // Root resources must carry a rate.
    assert!(matches!(
        tree.add_resource("Orphan", ResourceConfig::default()),
        Err(quoter::Error::InvalidConfig(_)),
    ));
}

#[test]
fn deleting_a_resource_closes_its_sessions() {
    let mut tree = QuoterTree::default();
    tree.add_resource("Root", ResourceConfig::with_rate(10.0)).unwrap();
    let leaf = tree.add_resource("Root/leaf", ResourceConfig::default()).unwrap();
    tree.subscribe(7, "Root/leaf").unwrap();
    consume_all(&mut tree, 7, leaf, 0);

    tree.delete_resource("Root/leaf").unwrap();

    let events = tree.take_events();
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::Closed { client: 7, status: proto_tablet::StatusCode::NotFound, .. }
    )));
    assert!(matches!(
        tree.update_consumption_state(7, leaf, true, 1.0, 0),
        Err(quoter::Error::SessionNotFound { .. }),
    ));
}

#[test]
fn disconnect_closes_all_client_sessions() {
    let mut tree = QuoterTree::default();
    tree.add_resource("Root", ResourceConfig::with_rate(10.0)).unwrap();
    tree.add_resource("Root/a", ResourceConfig::default()).unwrap();
    tree.add_resource("Root/b", ResourceConfig::default()).unwrap();
    tree.subscribe(1, "Root/a").unwrap();
    tree.subscribe(1, "Root/b").unwrap();
    tree.subscribe(2, "Root/a").unwrap();

    tree.disconnect_client(1);

    let events = tree.take_events();
    let closed: Vec<_> = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                SessionEvent::Closed { client: 1, status: proto_tablet::StatusCode::BadSession, .. }
            )
        })
        .collect();
    assert_eq!(closed.len(), 2);

    // Client 2 is untouched.
    let a = tree.resource_id("Root/a").unwrap();
    assert!(tree.update_consumption_state(2, a, true, 1.0, 0).is_ok());
}

#[test]
fn props_update_is_sent_with_the_next_allocation() {
    let mut tree = QuoterTree::default();
    let root = tree.add_resource("Root", ResourceConfig::with_rate(100.0)).unwrap();
    tree.subscribe(1, "Root").unwrap();
    consume_all(&mut tree, 1, root, 0);

    tree.run_until(SECOND / 10);
    for event in tree.take_events() {
        if let SessionEvent::Allocated { effective, .. } = event {
            assert!(effective.is_none());
        }
    }

    tree.update_resource("Root", ResourceConfig::with_rate(50.0)).unwrap();
    tree.run_until(2 * SECOND / 10);

    let events = tree.take_events();
    let with_props: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Allocated { effective: Some(props), .. } => Some(props),
            _ => None,
        })
        .collect();
    assert_eq!(with_props.len(), 1);
    assert_eq!(with_props[0].max_units_per_second, Some(50.0));
}

struct RecordingSink(Mutex<Vec<BillRecord>>);

impl BillSink for RecordingSink {
    fn bill(&self, record: &BillRecord) {
        self.0.lock().expect("sink lock").push(record.clone());
    }
}

#[test]
fn reported_usage_is_billed_periodically() {
    let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
    let mut tree = QuoterTree::new("Root", sink.clone() as Arc<dyn BillSink>);

    let mut props = ResourceConfig::with_rate(1.0);
    props.accounting = Some(quoter::AccountingConfig {
        enabled: true,
        provisioned: quoter::MeteringConfig { enabled: true, ..Default::default() },
        on_demand: quoter::MeteringConfig { enabled: true, ..Default::default() },
        overshoot: quoter::MeteringConfig { enabled: true, ..Default::default() },
        ..Default::default()
    });
    let root = tree.add_resource("Root", props).unwrap();
    tree.subscribe(1, "Root").unwrap();

    tree.report(1, root, 0, SECOND, &[30.0, 30.0, 40.0], SECOND).unwrap();
    // Accounting keeps the resource ticking without any token traffic.
    assert!(tree.next_tick_at().is_some());

    tree.run_until(62 * SECOND);

    let records = sink.0.lock().unwrap();
    assert!(!records.is_empty(), "expected billing records");
    let provisioned: u64 = records
        .iter()
        .filter(|r| r.category == quoter::BillCategory::Provisioned)
        .map(|r| r.quantity)
        .sum();
    let on_demand: u64 = records
        .iter()
        .filter(|r| r.category == quoter::BillCategory::OnDemand)
        .map(|r| r.quantity)
        .sum();
    // 100 units against a provisioned cap of 60 and overshoot threshold 66.
    assert_eq!(provisioned, 60);
    assert_eq!(on_demand, 6);
}

#[tokio::test(start_paused = true)]
async fn service_delivers_allocations_over_time() -> anyhow::Result<()> {
    use tracing_subscriber::{filter::LevelFilter, EnvFilter};
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();

    let handle = QuoterService::spawn("Root", Arc::new(NullBillSink));
    handle.add_resource("Root", ResourceConfig::with_rate(100.0)).await?;

    let mut session = handle.subscribe(1, "Root").await?;
    assert_eq!(session.effective.max_units_per_second, Some(100.0));

    handle.update_consumption(1, session.resource_id, true, 1e18).await?;

    let mut total = 0.0;
    for _ in 0..10 {
        match session.events.recv().await.expect("event stream open") {
            SessionEvent::Allocated { amount, .. } => total += amount,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!((total - 100.0).abs() < 1e-3, "total = {total}");

    handle.disconnect(1).await?;
    Ok(())
}
