//! State Module Tests
//!
//! ## Test Scopes
//! - **Registry**: full-state snapshots, routing of parts, unknown keys.
//! - **Channel**: gossip versus oversize unicast, queue overflow.
//! - **Convergence**: replicas exchanging g-set state in any order agree.

#[cfg(test)]
mod tests {
    use crate::metrics::{NoopMetrics, OversizeOutcome};
    use crate::state::{Channel, FullState, GSet, Part, State, StateRegistry};
    use crate::testing::{CountingMetrics, FakeTransport, node};
    use crate::transport::LocalState;
    use anyhow::anyhow;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct BrokenState;

    impl State for BrokenState {
        fn encode(&self) -> anyhow::Result<Vec<u8>> {
            Err(anyhow!("cannot encode"))
        }

        fn merge(&self, _bytes: &[u8]) -> anyhow::Result<()> {
            Err(anyhow!("cannot merge"))
        }
    }

    fn set_with(items: &[&str]) -> Arc<GSet> {
        let set = Arc::new(GSet::new());
        for item in items {
            set.add(*item);
        }
        set
    }

    fn part(key: &str, items: &[&str]) -> Vec<u8> {
        let items: Vec<String> = items.iter().map(|i| i.to_string()).collect();
        bincode::serialize(&Part {
            key: key.to_string(),
            data: GSet::delta(&items).unwrap(),
        })
        .unwrap()
    }

    // ============================================================
    // REGISTRY TESTS
    // ============================================================

    #[test]
    fn test_full_state_is_sorted_by_key() {
        let registry = StateRegistry::new();
        registry.register("zeta", set_with(&["z"]));
        registry.register("alpha", set_with(&["a"]));
        registry.register("mid", set_with(&[]));

        let full = registry.full_state();
        let keys: Vec<&str> = full.parts.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
        assert_eq!(registry.keys(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_encode_failure_skips_only_that_key() {
        let registry = StateRegistry::new();
        registry.register("good", set_with(&["x"]));
        registry.register("broken", Arc::new(BrokenState));

        let full = registry.full_state();
        assert_eq!(full.parts.len(), 1);
        assert_eq!(full.parts[0].key, "good");
    }

    #[test]
    fn test_remote_state_merges_known_keys_only() {
        let local = StateRegistry::new();
        let local_set = set_with(&["mine"]);
        local.register("members", local_set.clone());

        let remote = StateRegistry::new();
        remote.register("members", set_with(&["theirs"]));
        remote.register("unknown", set_with(&["ignored"]));

        local.merge_remote_state(&remote.local_state());

        assert_eq!(local_set.items(), vec!["mine", "theirs"]);
        assert_eq!(local.len(), 1);
    }

    #[test]
    fn test_merge_error_does_not_stop_other_parts() {
        let registry = StateRegistry::new();
        let good = set_with(&[]);
        registry.register("a-broken", Arc::new(BrokenState));
        registry.register("b-good", good.clone());

        let full = FullState {
            parts: vec![
                Part {
                    key: "a-broken".to_string(),
                    data: vec![1, 2, 3],
                },
                Part {
                    key: "b-good".to_string(),
                    data: GSet::delta(&["x".to_string()]).unwrap(),
                },
            ],
        };
        registry.merge_remote_state(&bincode::serialize(&full).unwrap());

        assert!(good.contains("x"));
    }

    #[test]
    fn test_notify_msg_routes_by_key() {
        let registry = StateRegistry::new();
        let first = set_with(&[]);
        let second = set_with(&[]);
        registry.register("first", first.clone());
        registry.register("second", second.clone());

        registry.notify_msg(&part("second", &["hello"]));
        registry.notify_msg(&part("missing", &["lost"]));
        registry.notify_msg(b"not a part");

        assert!(first.is_empty());
        assert_eq!(second.items(), vec!["hello"]);
    }

    #[test]
    fn test_gset_merge_rejects_garbage() {
        let set = GSet::new();
        assert!(set.merge(&[0xff]).is_err());
        assert!(set.is_empty());
    }

    // ============================================================
    // CHANNEL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_small_payload_is_gossiped() {
        let (transport, _tx, _rx) = FakeTransport::new(node("me", "127.0.0.1:1"));
        let stop = CancellationToken::new();
        let channel = Channel::new("members", transport.clone(), Arc::new(NoopMetrics), stop.clone());

        channel.broadcast(b"small".to_vec());

        let queued = transport.broadcasts.lock().clone();
        assert_eq!(queued.len(), 1);
        let part: Part = bincode::deserialize(&queued[0]).unwrap();
        assert_eq!(part.key, channel.key());
        assert_eq!(part.data, b"small".to_vec());
        assert!(transport.reliable.lock().is_empty());

        stop.cancel();
    }

    #[tokio::test]
    async fn test_oversize_payload_goes_to_every_other_member() {
        let me = node("me", "127.0.0.1:1");
        let (transport, _tx, _rx) = FakeTransport::new(me.clone());
        transport.set_members(vec![
            me,
            node("b", "127.0.0.1:2"),
            node("c", "127.0.0.1:3"),
        ]);
        transport.make_unreachable("127.0.0.1:3");
        let metrics = Arc::new(CountingMetrics::default());
        let stop = CancellationToken::new();
        let channel = Channel::new("big", transport.clone(), metrics.clone(), stop.clone());

        channel.broadcast(vec![7; 1000]);

        tokio::time::timeout(Duration::from_secs(5), async {
            while CountingMetrics::get(&metrics.oversize_sends) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("oversize worker never finished");

        assert!(transport.broadcasts.lock().is_empty());
        let sent = transport.reliable.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.id.as_str(), "b");
        let part: Part = bincode::deserialize(&sent[0].1).unwrap();
        assert_eq!(part.data.len(), 1000);

        let outcomes = metrics.oversize.lock().clone();
        assert!(outcomes.contains(&("big".to_string(), OversizeOutcome::Queued)));
        assert!(outcomes.contains(&("big".to_string(), OversizeOutcome::SendFailed)));

        stop.cancel();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_oversize_queue_drops() {
        let (transport, _tx, _rx) = FakeTransport::new(node("me", "127.0.0.1:1"));
        let metrics = Arc::new(CountingMetrics::default());
        let stop = CancellationToken::new();
        let channel = Channel::new("big", transport, metrics.clone(), stop.clone());

        // The worker cannot run before we yield, so the queue fills up.
        for _ in 0..201 {
            channel.broadcast(vec![1; 1000]);
        }

        let outcomes = metrics.oversize.lock().clone();
        let dropped = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == OversizeOutcome::Dropped)
            .count();
        assert_eq!(dropped, 1);

        stop.cancel();
    }

    // ============================================================
    // CONVERGENCE
    // ============================================================

    proptest! {
        #[test]
        fn prop_gset_replicas_converge(
            a in proptest::collection::vec("[a-e]{1,3}", 0..8),
            b in proptest::collection::vec("[a-e]{1,3}", 0..8),
            a_first in any::<bool>(),
        ) {
            let left = StateRegistry::new();
            let left_set = Arc::new(GSet::new());
            left.register("x", left_set.clone());
            let right = StateRegistry::new();
            let right_set = Arc::new(GSet::new());
            right.register("x", right_set.clone());

            for item in &a {
                left_set.add(item.clone());
            }
            for item in &b {
                right_set.add(item.clone());
            }

            let from_left = left.local_state();
            let from_right = right.local_state();
            if a_first {
                right.merge_remote_state(&from_left);
                left.merge_remote_state(&from_right);
            } else {
                left.merge_remote_state(&from_right);
                right.merge_remote_state(&from_left);
            }
            // Duplicate delivery changes nothing.
            right.merge_remote_state(&from_left);

            prop_assert_eq!(left.local_state(), right.local_state());
            prop_assert_eq!(left_set.len(), a.iter().chain(b.iter()).collect::<std::collections::BTreeSet<_>>().len());
        }
    }
}
