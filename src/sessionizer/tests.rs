use super::*;
use chrono::TimeZone;

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn pair() -> PairKey {
    PairKey::new("AA:BB:CC:DD:EE:01", "11:22:33:44:55:66")
}

#[test]
fn gap_rule_splits_sessions() {
    let sessionizer = Sessionizer::new(Duration::seconds(15), 8);
    let key = pair();

    let updates: Vec<_> = [0, 5, 12, 30, 32]
        .into_iter()
        .map(|s| sessionizer.observe(&key, t(s)))
        .collect();

    assert!(matches!(updates[0], SessionUpdate::Opened(_)));
    assert!(matches!(updates[1], SessionUpdate::Extended(_)));
    assert!(matches!(updates[2], SessionUpdate::Extended(_)));
    match &updates[3] {
        SessionUpdate::Rotated { closed, opened } => {
            assert_eq!((closed.start, closed.end, closed.samples), (t(0), t(12), 3));
            assert_eq!(opened.start, t(30));
        }
        other => panic!("expected rotation, got {:?}", other),
    }

    let current = sessionizer.current(&key).unwrap();
    assert_eq!((current.start, current.end, current.samples), (t(30), t(32), 2));
}

#[test]
fn offline_recompute_matches_live() {
    let gap = Duration::seconds(15);
    let spans = sessionize(&[t(30), t(0), t(12), t(32), t(5)], gap);
    assert_eq!(
        spans,
        vec![
            Span { start: t(0), end: t(12), samples: 3 },
            Span { start: t(30), end: t(32), samples: 2 },
        ]
    );
}

#[test]
fn gap_equal_to_threshold_extends() {
    let sessionizer = Sessionizer::new(Duration::seconds(15), 8);
    let key = pair();
    sessionizer.observe(&key, t(0));
    let update = sessionizer.observe(&key, t(15));
    assert!(matches!(update, SessionUpdate::Extended(_)));
    let update = sessionizer.observe(&key, t(31));
    assert!(matches!(update, SessionUpdate::Rotated { .. }));
}

#[test]
fn late_reading_counts_without_rewinding() {
    let sessionizer = Sessionizer::new(Duration::seconds(15), 8);
    let key = pair();
    sessionizer.observe(&key, t(0));
    sessionizer.observe(&key, t(10));

    let update = sessionizer.observe(&key, t(4));
    match update {
        SessionUpdate::Late(session) => {
            assert_eq!(session.end, t(10));
            assert_eq!(session.samples, 3);
            assert_eq!(session.late_samples, 1);
        }
        other => panic!("expected late update, got {:?}", other),
    }
}

#[test]
fn late_reading_never_reopens_closed_session() {
    let sessionizer = Sessionizer::new(Duration::seconds(15), 8);
    let key = pair();
    sessionizer.observe(&key, t(0));
    sessionizer.observe(&key, t(100));

    // belongs to the closed [0,0] session by time, but is folded into the open one
    let update = sessionizer.observe(&key, t(2));
    assert!(matches!(update, SessionUpdate::Late(_)));
    let current = sessionizer.current(&key).unwrap();
    assert_eq!(current.start, t(100));
    assert_eq!(current.end, t(100));
}

#[test]
fn pairs_are_independent() {
    let sessionizer = Sessionizer::new(Duration::seconds(15), 8);
    let a = PairKey::new("AA:AA:AA:AA:AA:AA", "GW");
    let b = PairKey::new("BB:BB:BB:BB:BB:BB", "GW");
    sessionizer.observe(&a, t(0));
    sessionizer.observe(&b, t(100));
    let update = sessionizer.observe(&a, t(10));
    assert!(matches!(update, SessionUpdate::Extended(_)));
    assert_eq!(sessionizer.pair_count(), 2);
}

#[test]
fn history_is_bounded_and_reported() {
    let sessionizer = Sessionizer::new(Duration::seconds(15), 2);
    let key = pair();
    for i in 0..5 {
        sessionizer.observe(&key, t(i * 100));
    }

    let snapshot = sessionizer.snapshot(Some(&key.tag), None, t(405));
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].active);
    assert_eq!(snapshot[0].recent.len(), 2);
    assert_eq!(snapshot[0].recent[1].start, t(300));

    assert!(sessionizer.snapshot(Some("00:00:00:00:00:00"), None, t(405)).is_empty());
    let stale = sessionizer.snapshot(None, Some(&key.device), t(1000));
    assert!(!stale[0].active);
}

#[test]
fn idle_pairs_are_evicted() {
    let sessionizer = Sessionizer::new(Duration::seconds(15), 2);
    sessionizer.observe(&PairKey::new("A", "GW"), t(0));
    sessionizer.observe(&PairKey::new("B", "GW"), t(1000));

    let evicted = sessionizer.evict_idle(t(1010), Duration::seconds(600));
    assert_eq!(evicted, 1);
    assert!(sessionizer.current(&PairKey::new("A", "GW")).is_none());
    assert!(sessionizer.current(&PairKey::new("B", "GW")).is_some());
}

#[test]
fn pairs_grouped_offline() {
    let gap = Duration::seconds(15);
    let samples = vec![
        (("tag1", "gw1"), t(0)),
        (("tag2", "gw1"), t(1)),
        (("tag1", "gw1"), t(40)),
        (("tag1", "gw1"), t(50)),
    ];
    let result = sessionize_pairs(samples, gap);
    assert_eq!(result[&("tag1", "gw1")].len(), 2);
    assert_eq!(result[&("tag1", "gw1")][1].samples, 2);
    assert_eq!(result[&("tag2", "gw1")].len(), 1);
}
