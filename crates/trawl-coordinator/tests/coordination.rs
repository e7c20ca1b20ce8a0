use std::collections::BTreeMap;

use trawl_coordinator::state::{CollectorConfig, CollectorState, RegisterError, WorkError};
use trawl_core::config::CollectionPlan;
use trawl_core::types::{CellUnit, ClientId, Identity, IdentityKey, WorkItem, WorkItemId};

fn plan(items: &[&str], relays: &[&str], samples: u32) -> CollectionPlan {
    CollectionPlan {
        work_items: items
            .iter()
            .map(|id| WorkItem {
                id: WorkItemId(id.to_string()),
                pages: vec![format!("https://{id}.example/")],
            })
            .collect(),
        identities: relays
            .iter()
            .map(|relay| Identity {
                key: IdentityKey::for_relay(relay, false),
                relay: relay.to_string(),
                daita: false,
            })
            .collect(),
        samples_per_cell: samples,
    }
}

fn state(items: &[&str], relays: &[&str], samples: u32) -> CollectorState {
    CollectorState::new(&plan(items, relays, samples), CollectorConfig::default(), 0)
}

fn client(id: &str) -> ClientId {
    ClientId(id.to_string())
}

#[test]
fn two_identities_share_a_work_item_without_colliding() {
    let mut state = state(&["x"], &["a", "b"], 2);
    let c1 = client("c1");
    let c2 = client("c2");

    let id1 = state.register(&c1).unwrap();
    let id2 = state.register(&c2).unwrap();
    assert_ne!(id1.key, id2.key);

    // Same work item, same sequence: distinct because the identity differs.
    let (item1, lease1) = state.request_work(&c1, &id1.key, 0).unwrap();
    let (item2, lease2) = state.request_work(&c2, &id2.key, 0).unwrap();
    assert_eq!(item1.id, WorkItemId("x".to_string()));
    assert_eq!(item2.id, WorkItemId("x".to_string()));
    assert_eq!(lease1.sequence, 1);
    assert_eq!(lease2.sequence, 1);

    state
        .settle_report(&c1, &id1.key, &item1.id, lease1.sequence)
        .unwrap();
    let snapshot = state.status_snapshot(0);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.required, 4);
}

#[test]
fn expired_lease_frees_the_cell_with_the_same_sequence() {
    let mut state = state(&["x"], &["a"], 2);
    let c1 = client("c1");
    let id = state.register(&c1).unwrap();

    let (_, lease) = state.request_work(&c1, &id.key, 0).unwrap();
    assert_eq!(lease.sequence, 1);

    // Before expiry the cell stays locked to the lease holder.
    let err = state.request_work(&c1, &id.key, 1_000).unwrap_err();
    assert_eq!(err, WorkError::NoWorkRemaining(id.key.0.clone()));

    let ttl = CollectorConfig::default().lease_ttl_ms;
    assert_eq!(state.sweep_expired(ttl + 1_000), 1);

    // Never completed, so the very same cell and sequence come back.
    let (item, lease) = state.request_work(&c1, &id.key, ttl + 2_000).unwrap();
    assert_eq!(item.id, WorkItemId("x".to_string()));
    assert_eq!(lease.sequence, 1);
}

#[test]
fn late_report_after_expiry_is_a_conflict() {
    let mut state = state(&["x"], &["a"], 2);
    let c1 = client("c1");
    let c2 = client("c2");
    let id = state.register(&c1).unwrap();

    let (item, lease) = state.request_work(&c1, &id.key, 0).unwrap();
    let ttl = CollectorConfig::default().lease_ttl_ms;
    state.sweep_expired(ttl + 1);

    // The identity stays with c1 (session-scoped), but the work lease is
    // gone, so the late report must be discarded.
    assert_eq!(state.register(&c2).unwrap_err(), RegisterError::Busy);
    state
        .check_report(&c1, &id.key, &item.id, lease.sequence)
        .unwrap_err();
    state
        .settle_report(&c1, &id.key, &item.id, lease.sequence)
        .unwrap_err();
    assert_eq!(state.status_snapshot(0).completed, 0);
}

#[test]
fn invalidated_cell_becomes_assignable_again() {
    let mut state = state(&["x"], &["a"], 1);
    let c1 = client("c1");
    let id = state.register(&c1).unwrap();

    let (item, lease) = state.request_work(&c1, &id.key, 0).unwrap();
    state
        .settle_report(&c1, &id.key, &item.id, lease.sequence)
        .unwrap();
    assert!(state.is_complete());

    let unit = CellUnit {
        work_item: item.id.clone(),
        identity: id.key.clone(),
        sequence: lease.sequence,
    };
    assert_eq!(state.invalidate(&[unit.clone()]), 1);
    assert!(!state.is_complete());
    // Replaying the same verdict must not decrement twice.
    assert_eq!(state.invalidate(&[unit]), 0);

    let (item, lease) = state.request_work(&c1, &id.key, 0).unwrap();
    assert_eq!(item.id, WorkItemId("x".to_string()));
    assert_eq!(lease.sequence, 1);
}

#[test]
fn assignment_prefers_the_largest_remainder() {
    let mut state = state(&["x", "y"], &["a"], 2);
    let c1 = client("c1");
    let id = state.register(&c1).unwrap();

    // Ties break lexically: x first.
    let (item, lease) = state.request_work(&c1, &id.key, 0).unwrap();
    assert_eq!(item.id, WorkItemId("x".to_string()));
    state
        .settle_report(&c1, &id.key, &item.id, lease.sequence)
        .unwrap();

    // y now has the larger remainder.
    let (item, lease) = state.request_work(&c1, &id.key, 0).unwrap();
    assert_eq!(item.id, WorkItemId("y".to_string()));
    state
        .settle_report(&c1, &id.key, &item.id, lease.sequence)
        .unwrap();
}

#[test]
fn pause_blocks_intake_but_not_inflight_reports() {
    let mut state = state(&["x"], &["a"], 2);
    let c1 = client("c1");
    let id = state.register(&c1).unwrap();
    let (item, lease) = state.request_work(&c1, &id.key, 0).unwrap();

    state.pause();
    assert_eq!(
        state.request_work(&c1, &id.key, 0).unwrap_err(),
        WorkError::Paused
    );

    // The in-flight visit settles normally and the lease survives pause.
    state
        .settle_report(&c1, &id.key, &item.id, lease.sequence)
        .unwrap();
    assert_eq!(state.status_snapshot(0).completed, 1);

    state.resume();
    state.request_work(&c1, &id.key, 0).unwrap();
}

#[test]
fn exhausted_identity_routes_through_re_register() {
    let mut state = state(&["x"], &["a", "b"], 1);
    let c1 = client("c1");

    let id = state.register(&c1).unwrap();
    let (item, lease) = state.request_work(&c1, &id.key, 0).unwrap();
    state
        .settle_report(&c1, &id.key, &item.id, lease.sequence)
        .unwrap();

    // This identity is done; the client is told to get a new one.
    let err = state.request_work(&c1, &id.key, 0).unwrap_err();
    assert_eq!(err, WorkError::NoWorkRemaining(id.key.0.clone()));

    let next = state.register(&c1).unwrap();
    assert_ne!(next.key, id.key);

    // The old identity is free again but has no work, so a second client
    // gets nothing rather than a useless grant.
    assert_eq!(state.register(&client("c2")).unwrap_err(), RegisterError::Busy);
}

#[test]
fn collection_runs_to_completion() {
    // 2 identities x 2 work items x 2 samples = 8 units.
    let mut state = state(&["x", "y"], &["a", "b"], 2);
    let clients = [client("c1"), client("c2")];
    let mut held: BTreeMap<ClientId, Option<IdentityKey>> = clients
        .iter()
        .map(|c| (c.clone(), None))
        .collect();

    for _ in 0..100 {
        let mut progressed = false;
        for c in &clients {
            let key = match held.get(c).cloned().flatten() {
                Some(key) => key,
                None => match state.register(c) {
                    Ok(identity) => {
                        held.insert(c.clone(), Some(identity.key.clone()));
                        identity.key
                    }
                    Err(RegisterError::Busy) => continue,
                },
            };
            match state.request_work(c, &key, 0) {
                Ok((item, lease)) => {
                    state
                        .settle_report(c, &key, &item.id, lease.sequence)
                        .unwrap();
                    progressed = true;
                }
                Err(WorkError::NoWorkRemaining(_)) => {
                    held.insert(c.clone(), None);
                }
                Err(err) => panic!("unexpected: {err}"),
            }
        }
        if !progressed && state.is_complete() {
            break;
        }
    }

    let snapshot = state.status_snapshot(0);
    assert_eq!(snapshot.completed, 8);
    assert_eq!(snapshot.required, 8);
    assert!(state.is_complete());
    assert_eq!(snapshot.outstanding_leases, 0);
}

#[test]
fn no_two_outstanding_leases_share_a_cell() {
    let mut state = state(&["x"], &["a", "b"], 3);
    let c1 = client("c1");
    let c2 = client("c2");
    let id1 = state.register(&c1).unwrap();
    let id2 = state.register(&c2).unwrap();

    let (_, l1) = state.request_work(&c1, &id1.key, 0).unwrap();
    let (_, l2) = state.request_work(&c2, &id2.key, 0).unwrap();
    assert_ne!(l1.cell, l2.cell);

    // With x/a leased out, c1's identity has nothing else to offer even
    // though the cell still has remaining samples.
    assert_eq!(
        state.request_work(&c1, &id1.key, 0).unwrap_err(),
        WorkError::NoWorkRemaining(id1.key.0.clone())
    );
}
