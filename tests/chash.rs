use std::collections::{HashMap, HashSet};

use grove::chash::{ChashError, ConsistentHash, DEFAULT_REPLICAS};

fn ring(nodes: &[(&str, f64)]) -> ConsistentHash<String> {
    let mut ring = ConsistentHash::new(DEFAULT_REPLICAS);
    for (name, weight) in nodes {
        ring.insert(name.to_string(), name, *weight);
    }
    ring
}

#[test]
fn empty_ring_and_empty_key_are_errors() {
    let empty: ConsistentHash<String> = ConsistentHash::new(DEFAULT_REPLICAS);
    assert!(empty.is_empty());
    assert_eq!(empty.lookup("/a").unwrap_err(), ChashError::Empty);

    let ring = ring(&[("a", 1.0)]);
    assert_eq!(ring.lookup("").unwrap_err(), ChashError::EmptyKey);
}

#[test]
fn lookups_are_stable() {
    let ring = ring(&[("parent-a", 1.0), ("parent-b", 1.0), ("parent-c", 1.0)]);
    for i in 0..100 {
        let key = format!("/objects/{i}");
        let first = ring.lookup_failover(&key, 0).unwrap().clone();
        let second = ring.lookup_failover(&key, 0).unwrap().clone();
        assert_eq!(first, second);
    }
}

#[test]
fn weight_scales_share_of_keys() {
    let ring = ring(&[("heavy", 2.0), ("light", 1.0)]);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for i in 0..3000 {
        let node = ring.lookup_failover(&format!("/k/{i}"), 0).unwrap();
        *counts.entry(node.to_string()).or_default() += 1;
    }
    let heavy = counts.get("heavy").copied().unwrap_or(0);
    let light = counts.get("light").copied().unwrap_or(0);
    assert!(heavy > light, "heavy {heavy} light {light}");
}

#[test]
fn zero_weight_node_gets_no_points() {
    let ring = ring(&[("a", 1.0), ("never", 0.0)]);
    assert_eq!(ring.len(), DEFAULT_REPLICAS);
    for i in 0..200 {
        assert_eq!(ring.lookup_failover(&format!("/k/{i}"), 0).unwrap().as_str(), "a");
    }
}

#[test]
fn failover_walks_clockwise_and_wraps() {
    let ring = ring(&[("a", 1.0), ("b", 1.0)]);
    let (start, _) = ring.lookup("/some/key").unwrap();
    let mut cursor = start;
    let mut wrapped = false;
    for _ in 0..ring.len() {
        let (next, w) = ring.next(cursor).unwrap();
        wrapped |= w;
        cursor = next;
    }
    assert!(wrapped);
    assert_eq!(cursor, start);

    let seen: HashSet<String> = (0..64)
        .map(|failures| ring.lookup_failover("/some/key", failures).unwrap().to_string())
        .collect();
    assert_eq!(seen.len(), 2);
}

#[test]
fn hash_is_siphash_2_4_with_a_zero_key() {
    assert_eq!(grove::chash::hash(""), 0x1e92_4b9d_7377_00d7);
    assert_eq!(grove::chash::hash("a"), 0x96c2_0860_cd93_a249);
    assert_eq!(grove::chash::hash("0-parent-a"), 0x8858_5259_c138_2958);
    assert_eq!(grove::chash::hash("http://cdn.test/img/a.png"), 0x4ef7_847d_a7da_1836);
}

#[test]
fn realistic_urls_hash_apart() {
    let urls = [
        "http://cdn.test/",
        "http://cdn.test/index.html",
        "http://cdn.test/img/a.png",
        "http://cdn.test/img/b.png",
        "http://cdn.test/video/seg-0001.ts",
        "http://cdn.test/video/seg-0002.ts",
        "http://origin.example.com/api/v1/items?page=2",
        "http://cdn.test/css/site.css",
    ];
    let hashes: HashSet<u64> = urls.iter().map(|u| grove::chash::hash(u)).collect();
    assert_eq!(hashes.len(), urls.len());
}

#[test]
fn placement_is_pinned_to_replica_keys() {
    let ring = ring(&[("parent-a", 1.0), ("parent-b", 1.0), ("parent-c", 1.0)]);
    let expected = [
        ("http://cdn.test/", "parent-a"),
        ("http://cdn.test/index.html", "parent-b"),
        ("http://cdn.test/img/a.png", "parent-a"),
        ("http://cdn.test/img/b.png", "parent-c"),
        ("http://cdn.test/video/seg-0001.ts", "parent-c"),
        ("http://cdn.test/video/seg-0002.ts", "parent-b"),
        ("http://origin.example.com/api/v1/items?page=2", "parent-c"),
        ("http://cdn.test/css/site.css", "parent-b"),
    ];
    for (key, parent) in expected {
        assert_eq!(ring.lookup_failover(key, 0).unwrap().as_str(), parent, "{key}");
    }
}
