//! Resolver Module Tests
//!
//! ## Test Scopes
//! - **Lookup outcomes**: literal IPs, failed lookups, empty answers.
//! - **Waiting**: retry cadence and cancellation with a paused clock.
//! - **Self-exclusion**: the advertised address never comes back.

#[cfg(test)]
mod tests {
    use crate::error::ClusterError;
    use crate::resolver::{RETRY_INTERVAL, resolve_peers};
    use crate::testing::{Answer, StaticResolver};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn peers(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    // ============================================================
    // LOOKUP OUTCOMES
    // ============================================================

    #[tokio::test]
    async fn test_hostnames_expand_to_every_ip() {
        let resolver = StaticResolver::new().ips("peers.local", &["10.0.0.1", "10.0.0.2"]);
        let cancel = CancellationToken::new();

        let resolved = resolve_peers(
            &peers(&["peers.local:9094"]),
            "10.0.0.9:9094",
            &resolver,
            false,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(resolved, peers(&["10.0.0.1:9094", "10.0.0.2:9094"]));
    }

    #[tokio::test]
    async fn test_ipv6_results_are_bracketed() {
        let resolver = StaticResolver::new().ips("v6.local", &["fd00::1"]);
        let cancel = CancellationToken::new();

        let resolved = resolve_peers(&peers(&["v6.local:9094"]), "", &resolver, false, &cancel)
            .await
            .unwrap();

        assert_eq!(resolved, peers(&["[fd00::1]:9094"]));
    }

    #[tokio::test]
    async fn test_failed_lookup_passes_input_through() {
        let resolver = StaticResolver::new();
        let cancel = CancellationToken::new();

        let resolved = resolve_peers(
            &peers(&["example.invalid:7000"]),
            "127.0.0.1:7001",
            &resolver,
            false,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(resolved, peers(&["example.invalid:7000"]));
    }

    #[tokio::test]
    async fn test_empty_answer_without_waiting_contributes_nothing() {
        let resolver = StaticResolver::new()
            .answer("empty.local", vec![Answer::Ips(vec![])])
            .ips("full.local", &["10.0.0.3"]);
        let cancel = CancellationToken::new();

        let resolved = resolve_peers(
            &peers(&["empty.local:1", "full.local:2"]),
            "",
            &resolver,
            false,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(resolved, peers(&["10.0.0.3:2"]));
    }

    #[tokio::test]
    async fn test_unsplittable_peer_is_a_configuration_error() {
        let resolver = StaticResolver::new();
        let cancel = CancellationToken::new();

        let err = resolve_peers(&peers(&["no-port"]), "", &resolver, false, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::InvalidAddress { .. }));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_duplicates_keep_first_seen_order() {
        let resolver = StaticResolver::new()
            .ips("a.local", &["10.0.0.2", "10.0.0.1"])
            .ips("b.local", &["10.0.0.1", "10.0.0.3"]);
        let cancel = CancellationToken::new();

        let resolved = resolve_peers(
            &peers(&["a.local:9", "b.local:9", "10.0.0.2:9"]),
            "",
            &resolver,
            false,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(resolved, peers(&["10.0.0.2:9", "10.0.0.1:9", "10.0.0.3:9"]));
    }

    // ============================================================
    // WAITING
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_host_resolves() {
        let resolver = StaticResolver::new().answer(
            "slow.local",
            vec![
                Answer::Ips(vec![]),
                Answer::Ips(vec![]),
                Answer::Ips(vec!["10.0.0.7".parse().unwrap()]),
            ],
        );
        let cancel = CancellationToken::new();

        let started = tokio::time::Instant::now();
        let resolved = resolve_peers(&peers(&["slow.local:9094"]), "", &resolver, true, &cancel)
            .await
            .unwrap();

        assert_eq!(resolved, peers(&["10.0.0.7:9094"]));
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= RETRY_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_while_waiting_is_an_error() {
        let resolver = Arc::new(
            StaticResolver::new().answer("never.local", vec![Answer::Ips(vec![])]),
        );
        let cancel = CancellationToken::new();

        let task = {
            let resolver = resolver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                resolve_peers(&peers(&["never.local:1"]), "", resolver.as_ref(), true, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(7)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ClusterError::Resolve(_)));
        assert!(resolver.lookups.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_self_counts_as_empty_when_waiting() {
        let resolver = StaticResolver::new().answer(
            "self.local",
            vec![
                Answer::Ips(vec!["10.0.0.1".parse().unwrap()]),
                Answer::Ips(vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()]),
            ],
        );
        let cancel = CancellationToken::new();

        let resolved = resolve_peers(
            &peers(&["self.local:9094"]),
            "10.0.0.1:9094",
            &resolver,
            true,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(resolved, peers(&["10.0.0.2:9094"]));
    }

    // ============================================================
    // SELF-EXCLUSION
    // ============================================================

    proptest! {
        #[test]
        fn prop_advertised_address_is_never_returned(
            octets in proptest::collection::vec(1u8..8, 1..12),
            me in 1u8..8,
        ) {
            let ips: Vec<String> = octets.iter().map(|o| format!("10.0.0.{o}")).collect();
            let ip_refs: Vec<&str> = ips.iter().map(String::as_str).collect();
            let resolver = StaticResolver::new().ips("cluster.local", &ip_refs);
            let advertise = format!("10.0.0.{me}:9094");
            let input = vec!["cluster.local:9094".to_string(), advertise.clone()];

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let resolved = runtime
                .block_on(resolve_peers(&input, &advertise, &resolver, false, &CancellationToken::new()))
                .unwrap();

            prop_assert!(!resolved.contains(&advertise));
            let unique: std::collections::HashSet<_> = resolved.iter().collect();
            prop_assert_eq!(unique.len(), resolved.len());
        }
    }
}
