use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gatehouse::Error;
use gatehouse::backend::{BackendDescriptor, BackendId, LoadBalancer, Policy, SelectedBackend};

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

fn warm_lb(policy: Policy, n: u8) -> LoadBalancer {
    let lb = LoadBalancer::new(policy, Duration::from_secs(5));
    for i in 0..n {
        lb.add_backend(BackendDescriptor::warm(ip(i + 1), 9000, 10));
    }
    lb
}

/// A selection result for a specific backend, found through affinity
/// lookups so no counter is touched.
fn handle_for(lb: &LoadBalancer, id: BackendId) -> SelectedBackend {
    (0..10_000)
        .map(|k| lb.select_by_origin(format!("origin-{k}").as_bytes()).unwrap())
        .find(|s| s.id == id)
        .unwrap()
}

#[test]
fn test_round_robin_visits_each_once() {
    let lb = warm_lb(Policy::RoundRobin, 4);
    let first: Vec<BackendId> = (0..4).map(|_| lb.select_backend(None).unwrap().id).collect();
    let distinct: HashSet<BackendId> = first.iter().copied().collect();
    assert_eq!(distinct.len(), 4);

    let second: Vec<BackendId> = (0..4).map(|_| lb.select_backend(None).unwrap().id).collect();
    assert_eq!(first, second);
}

#[test]
fn test_least_connections_picks_minimum() {
    let lb = warm_lb(Policy::LeastConnections, 3);
    let handles: Vec<SelectedBackend> = (0..3).map(|i| handle_for(&lb, BackendId(i))).collect();
    for (sel, load) in handles.iter().zip([3, 0, 5]) {
        for _ in 0..load {
            lb.incr_conn_count(sel);
        }
    }

    let chosen = lb.select_backend(None).unwrap();
    assert_eq!(chosen.id, BackendId(1));

    for _ in 0..4 {
        lb.incr_conn_count(&chosen);
    }
    // [3, 4, 5]
    assert_eq!(lb.select_backend(None).unwrap().id, BackendId(0));
    assert_eq!(lb.total_live_connections(), 12);
}

#[test]
fn test_warming_backend_excluded_for_grace() {
    let grace = Duration::from_secs(5);
    for policy in [
        Policy::RoundRobin,
        Policy::LeastConnections,
        Policy::ResourceAware,
        Policy::Affinity,
    ] {
        let lb = LoadBalancer::new(policy, grace);
        let warm = lb.add_backend(BackendDescriptor::warm(ip(1), 9000, 10));
        let cold_desc = BackendDescriptor::new(ip(2), 9000, 10);
        let started = cold_desc.warmup_started;
        let cold = lb.add_backend(cold_desc);

        for k in 0..50u32 {
            let key = k.to_be_bytes();
            let sel = lb
                .select_backend_at(Some(&key), started + Duration::from_secs(4))
                .unwrap();
            assert_eq!(sel.id, warm, "{policy}");
        }
        assert_eq!(lb.backend(cold).unwrap().effective_weight, 0);

        let after = started + grace;
        let seen: HashSet<BackendId> = (0..50u32)
            .map(|k| lb.select_backend_at(Some(&k.to_be_bytes()), after).unwrap().id)
            .collect();
        let restored = lb.backend(cold).unwrap();
        assert!(!restored.warming_up);
        assert_eq!(restored.effective_weight, 10);
        if policy != Policy::LeastConnections && policy != Policy::ResourceAware {
            assert!(seen.contains(&cold), "{policy}");
        }
    }
}

#[test]
fn test_all_warming_is_no_eligible_backend() {
    let lb = LoadBalancer::new(Policy::RoundRobin, Duration::from_secs(5));
    let desc = BackendDescriptor::new(ip(1), 9000, 1);
    let started = desc.warmup_started;
    lb.add_backend(desc);

    let err = lb.select_backend_at(None, started).unwrap_err();
    assert!(matches!(err, Error::NoEligibleBackend));
    assert!(err.is_retriable());
    lb.select_backend_at(None, started + Duration::from_secs(5)).unwrap();
}

#[test]
fn test_affinity_is_sticky_and_spreads() {
    let lb = warm_lb(Policy::Affinity, 4);

    let mut per_backend: HashMap<BackendId, usize> = HashMap::new();
    for k in 0..1000 {
        let key = format!("client-{k}");
        let a = lb.select_backend(Some(key.as_bytes())).unwrap().id;
        let b = lb.select_backend(Some(key.as_bytes())).unwrap().id;
        assert_eq!(a, b);
        *per_backend.entry(a).or_default() += 1;
    }
    assert_eq!(per_backend.len(), 4);
    for (&id, &n) in &per_backend {
        assert!((150..=350).contains(&n), "backend {id} got {n} of 1000");
    }
}

#[test]
fn test_select_by_origin_ignores_policy() {
    let lb = warm_lb(Policy::RoundRobin, 3);
    let a = lb.select_by_origin(b"10.1.2.3").unwrap().id;
    for _ in 0..5 {
        assert_eq!(lb.select_by_origin(b"10.1.2.3").unwrap().id, a);
    }
}

#[test]
fn test_unmatched_decrement_flagged() {
    let lb = warm_lb(Policy::RoundRobin, 1);
    let sel = lb.select_backend(None).unwrap();

    assert!(matches!(lb.decr_conn_count(&sel), Err(Error::InvariantViolation(_))));
    assert_eq!(lb.live_connections(sel.id).unwrap(), 0);

    lb.incr_conn_count(&sel);
    lb.decr_conn_count(&sel).unwrap();
    assert!(lb.decr_conn_count(&sel).is_err());
    assert_eq!(lb.live_connections(sel.id).unwrap(), 0);
    assert_eq!(lb.total_live_connections(), 0);
}

#[test]
fn test_concurrent_counters_balance() {
    let lb = Arc::new(warm_lb(Policy::LeastConnections, 4));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let lb = Arc::clone(&lb);
            thread::spawn(move || {
                for _ in 0..500 {
                    let sel = lb.select_backend(None).unwrap();
                    lb.incr_conn_count(&sel);
                    lb.decr_conn_count(&sel).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(lb.total_live_connections(), 0);
    for status in lb.snapshot() {
        assert_eq!(status.live_connections, 0);
    }
}

#[test]
fn test_total_tracks_backend_counters_under_contention() {
    let lb = Arc::new(warm_lb(Policy::RoundRobin, 3));
    let held: Vec<SelectedBackend> = (0..3)
        .map(|i| {
            let sel = handle_for(&lb, BackendId(i));
            lb.incr_conn_count(&sel);
            sel
        })
        .collect();

    let threads: Vec<_> = (0..6)
        .map(|t| {
            let lb = Arc::clone(&lb);
            let sel = handle_for(&lb, BackendId(t % 3));
            thread::spawn(move || {
                for _ in 0..1_000 {
                    lb.incr_conn_count(&sel);
                    lb.decr_conn_count(&sel).unwrap();
                    let total = lb.total_live_connections();
                    assert!(total >= 3, "total dropped below held connections: {total}");
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let sum: usize = lb.snapshot().iter().map(|s| s.live_connections).sum();
    assert_eq!(lb.total_live_connections(), sum);
    assert_eq!(sum, 3);
    for sel in &held {
        lb.decr_conn_count(sel).unwrap();
    }
    assert_eq!(lb.total_live_connections(), 0);
}

#[test]
fn test_selection_with_telemetry_feed() {
    let lb = Arc::new(warm_lb(Policy::ResourceAware, 2));
    lb.update_telemetry(BackendId(0), 0.5, 0.8).unwrap();
    assert_eq!(lb.select_backend(None).unwrap().id, BackendId(1));

    let feed = {
        let lb = Arc::clone(&lb);
        thread::spawn(move || {
            lb.update_telemetry(BackendId(1), 0.5, 0.95).unwrap();
        })
    };
    feed.join().unwrap();

    let start = Instant::now();
    assert_eq!(lb.select_backend(None).unwrap().id, BackendId(0));
    assert!(start.elapsed() < Duration::from_secs(1));
}
