//! Tests for the coordination locks against the in-memory store
//!
//! Covers: single-holder races, non-holder release, TTL expiry, corrupt
//! records, slot bounds, slot adoption after a restart and slot loss.

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::config::{LockConfig, LockStrategy};
    use crate::error::Error;
    use crate::store::{ClusterStore, MemoryStore};
    use chrono::{Duration as ChronoDuration, Utc};
    use k8s_openapi::api::apps::v1::DaemonSet;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
    use kube::api::ObjectMeta;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::time::Duration;

    const NS: &str = "kube-system";
    const DS: &str = "reboot-coordinator";

    fn store_with_daemonset() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_daemonset(DaemonSet {
            metadata: ObjectMeta {
                name: Some(DS.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        store
    }

    fn config() -> LockConfig {
        LockConfig {
            conflict_backoff: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn daemonset_lock(store: &Arc<MemoryStore>, node: &str, config: &LockConfig) -> DaemonSetLock {
        DaemonSetLock::new(store.clone(), node, config)
    }

    fn stored_record(store: &MemoryStore, annotation: &str) -> Option<String> {
        store
            .daemonset(NS, DS)
            .and_then(|ds| ds.metadata.annotations)
            .and_then(|a| a.get(annotation).cloned())
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = store_with_daemonset();
        let config = LockConfig {
            ttl: Some(Duration::from_secs(600)),
            ..config()
        };
        let locks: Vec<Arc<DaemonSetLock>> = (0..8)
            .map(|i| Arc::new(daemonset_lock(&store, &format!("worker-{i}"), &config)))
            .collect();

        let handles: Vec<_> = locks
            .iter()
            .cloned()
            .map(|lock| tokio::spawn(async move { lock.acquire(NodeMeta::new(false)).await }))
            .collect();

        let mut winners = Vec::new();
        let mut reported = BTreeSet::new();
        for (i, handle) in handles.into_iter().enumerate() {
            let acquisition = handle.await.unwrap().unwrap();
            if acquisition.acquired {
                winners.push(format!("worker-{i}"));
            } else {
                reported.insert(acquisition.holder.unwrap());
            }
        }

        assert_eq!(winners.len(), 1);
        // Every loser names the winner
        assert_eq!(reported.into_iter().collect::<Vec<_>>(), winners);
    }

    #[tokio::test]
    async fn test_acquire_is_reentrant_for_holder() {
        let store = store_with_daemonset();
        let lock = daemonset_lock(&store, "worker-1", &config());

        assert!(lock.acquire(NodeMeta::new(false)).await.unwrap().acquired);
        assert!(lock.acquire(NodeMeta::new(false)).await.unwrap().acquired);
        assert!(lock.test().await.unwrap());
    }

    #[tokio::test]
    async fn test_reacquire_restamps_own_record() {
        let store = store_with_daemonset();
        let config = LockConfig {
            ttl: Some(Duration::from_secs(600)),
            ..config()
        };
        let lock = daemonset_lock(&store, "worker-1", &config);

        lock.acquire(NodeMeta::new(true)).await.unwrap();
        let first = LockRecord::parse(&stored_record(&store, &config.annotation).unwrap()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lock.acquire(NodeMeta::new(false)).await.unwrap().acquired);
        let second = LockRecord::parse(&stored_record(&store, &config.annotation).unwrap()).unwrap();

        assert_eq!(second.holder_id, "worker-1");
        assert!(!second.metadata.unschedulable);
        assert!(second.metadata.expires_at.unwrap() > first.metadata.expires_at.unwrap());
    }

    #[tokio::test]
    async fn test_own_expired_record_is_not_held() {
        let store = store_with_daemonset();
        let config = LockConfig {
            ttl: Some(Duration::from_millis(100)),
            ..config()
        };
        let holder = daemonset_lock(&store, "worker-1", &config);
        let other = daemonset_lock(&store, "worker-2", &config);

        holder.acquire(NodeMeta::new(false)).await.unwrap();
        assert!(holder.test().await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!holder.test().await.unwrap());

        // Another node takes over the lapsed record
        assert!(other.acquire(NodeMeta::new(false)).await.unwrap().acquired);
        assert!(!holder.test().await.unwrap());
        assert!(matches!(holder.release().await, Err(Error::NotLockHolder(_))));
    }

    #[tokio::test]
    async fn test_release_by_non_holder_fails_and_keeps_record() {
        let store = store_with_daemonset();
        let holder = daemonset_lock(&store, "worker-1", &config());
        let other = daemonset_lock(&store, "worker-2", &config());

        holder.acquire(NodeMeta::new(true)).await.unwrap();
        let before = stored_record(&store, &config().annotation);

        let err = other.release().await.unwrap_err();
        assert!(matches!(err, Error::NotLockHolder(_)));
        assert_eq!(stored_record(&store, &config().annotation), before);
        assert!(holder.test().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_of_unheld_lock_fails() {
        let store = store_with_daemonset();
        let lock = daemonset_lock(&store, "worker-1", &config());
        assert!(matches!(
            lock.release().await,
            Err(Error::NotLockHolder(_))
        ));
    }

    #[tokio::test]
    async fn test_release_removes_record() {
        let store = store_with_daemonset();
        let lock = daemonset_lock(&store, "worker-1", &config());

        lock.acquire(NodeMeta::new(false)).await.unwrap();
        lock.release().await.unwrap();

        assert!(stored_record(&store, &config().annotation).is_none());
        assert!(!lock.test().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_record_is_acquirable() {
        let store = store_with_daemonset();
        let config = config();

        let expired = LockRecord::new(
            "worker-gone",
            NodeMeta {
                unschedulable: false,
                expires_at: Some(Utc::now() - ChronoDuration::seconds(1)),
            },
        );
        let mut ds = store.daemonset(NS, DS).unwrap();
        ds.metadata.annotations = Some(BTreeMap::from([(
            config.annotation.clone(),
            expired.to_json().unwrap(),
        )]));
        store.replace_daemonset(&ds).await.unwrap();

        let lock = daemonset_lock(&store, "worker-1", &config);
        let acquisition = lock.acquire(NodeMeta::new(false)).await.unwrap();
        assert_eq!(acquisition, Acquisition::granted("worker-1"));
    }

    #[tokio::test]
    async fn test_ttl_is_recorded() {
        let store = store_with_daemonset();
        let config = LockConfig {
            ttl: Some(Duration::from_secs(600)),
            ..config()
        };
        let lock = daemonset_lock(&store, "worker-1", &config);
        lock.acquire(NodeMeta::new(true)).await.unwrap();

        let record = LockRecord::parse(&stored_record(&store, &config.annotation).unwrap()).unwrap();
        assert_eq!(record.holder_id, "worker-1");
        assert!(record.metadata.unschedulable);
        let expires_at = record.metadata.expires_at.unwrap();
        assert!(expires_at > Utc::now() + ChronoDuration::seconds(590));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_fatal() {
        let store = store_with_daemonset();
        let config = config();
        let mut ds = store.daemonset(NS, DS).unwrap();
        ds.metadata.annotations = Some(BTreeMap::from([(
            config.annotation.clone(),
            "garbage".to_string(),
        )]));
        store.replace_daemonset(&ds).await.unwrap();

        let lock = daemonset_lock(&store, "worker-1", &config);
        assert!(matches!(lock.test().await, Err(Error::CorruptLock(_))));
        assert!(matches!(
            lock.acquire(NodeMeta::new(false)).await,
            Err(Error::CorruptLock(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store_surfaces_error() {
        let store = store_with_daemonset();
        let lock = daemonset_lock(&store, "worker-1", &config());
        store.set_unreachable(true);
        assert!(lock.acquire(NodeMeta::new(false)).await.is_err());
        assert!(lock.test().await.is_err());
    }

    fn slot_config(concurrency: u32) -> LockConfig {
        LockConfig {
            strategy: LockStrategy::Leases,
            concurrency,
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_millis(200),
            retry_period: Duration::from_millis(20),
            ..config()
        }
    }

    #[tokio::test]
    async fn test_slot_lock_bounds_holders() {
        let store = Arc::new(MemoryStore::new());
        let config = slot_config(2);
        let locks: Vec<Arc<SlotLock>> = (0..5)
            .map(|i| Arc::new(SlotLock::new(store.clone(), &format!("worker-{i}"), &config)))
            .collect();

        let handles: Vec<_> = locks
            .iter()
            .cloned()
            .map(|lock| tokio::spawn(async move { lock.acquire(NodeMeta::new(false)).await }))
            .collect();
        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().acquired {
                acquired += 1;
            }
        }
        assert!(acquired <= 2);
        assert!(acquired >= 1);

        let mut holding = 0;
        for lock in &locks {
            if lock.test().await.unwrap() {
                holding += 1;
            }
        }
        assert_eq!(holding, acquired);
    }

    #[tokio::test]
    async fn test_slot_lock_holds_a_single_slot() {
        let store = Arc::new(MemoryStore::new());
        let lock = SlotLock::new(store.clone(), "worker-1", &slot_config(3));

        assert!(lock.acquire(NodeMeta::new(false)).await.unwrap().acquired);
        let held: Vec<_> = (0..3)
            .filter_map(|i| store.lease("kube-system", &format!("reboot-coordinator-{i}")))
            .filter(|l| {
                l.spec.as_ref().and_then(|s| s.holder_identity.as_deref()) == Some("worker-1")
            })
            .collect();
        assert_eq!(held.len(), 1);
        assert!(lock.held_slot().await.is_some());
    }

    #[tokio::test]
    async fn test_slot_release_frees_slot_for_others() {
        let store = Arc::new(MemoryStore::new());
        let config = slot_config(1);
        let first = SlotLock::new(store.clone(), "worker-1", &config);
        let second = SlotLock::new(store.clone(), "worker-2", &config);

        assert!(first.acquire(NodeMeta::new(false)).await.unwrap().acquired);
        let denied = second.acquire(NodeMeta::new(false)).await.unwrap();
        assert_eq!(denied, Acquisition::denied(Some("worker-1".to_string())));

        assert!(matches!(second.release().await, Err(Error::NotLockHolder(_))));
        first.release().await.unwrap();
        assert!(second.acquire(NodeMeta::new(false)).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_slot_lock_found_again_after_restart() {
        let store = Arc::new(MemoryStore::new());
        let config = slot_config(2);
        let before = SlotLock::new(store.clone(), "worker-1", &config);
        before.acquire(NodeMeta::new(false)).await.unwrap();
        drop(before);

        let after = SlotLock::new(store.clone(), "worker-1", &config);
        assert!(after.test().await.unwrap());
        after.release().await.unwrap();
        assert!(!after.test().await.unwrap());
    }

    fn short_slot_config() -> LockConfig {
        LockConfig {
            lease_duration: Duration::from_secs(1),
            ..slot_config(1)
        }
    }

    /// Overwrite the holder of a slot lease, retrying over renewal conflicts
    async fn steal_slot(store: &Arc<MemoryStore>, index: usize, thief: &str) {
        loop {
            let mut lease = store
                .lease("kube-system", &format!("reboot-coordinator-{index}"))
                .unwrap();
            let spec = lease.spec.get_or_insert_with(Default::default);
            spec.holder_identity = Some(thief.to_string());
            spec.renew_time = Some(MicroTime(Utc::now()));
            match store.replace_lease(&lease).await {
                Ok(_) => return,
                Err(e) if e.is_conflict() => continue,
                Err(e) => panic!("unexpected store error: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn test_slot_found_after_restart_keeps_being_renewed() {
        let store = Arc::new(MemoryStore::new());
        let config = short_slot_config();
        let before = SlotLock::new(store.clone(), "worker-1", &config);
        before.acquire(NodeMeta::new(false)).await.unwrap();
        drop(before);

        let after = SlotLock::new(store.clone(), "worker-1", &config);
        assert!(after.test().await.unwrap());
        assert_eq!(after.held_slot().await, Some(0));

        // Well past the lease duration the slot is still ours
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let other = SlotLock::new(store.clone(), "worker-2", &config);
        let denied = other.acquire(NodeMeta::new(false)).await.unwrap();
        assert_eq!(denied, Acquisition::denied(Some("worker-1".to_string())));

        after.release().await.unwrap();
        assert!(other.acquire(NodeMeta::new(false)).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_expired_slot_is_reclaimed_on_restart() {
        let store = Arc::new(MemoryStore::new());
        let config = short_slot_config();
        let before = SlotLock::new(store.clone(), "worker-1", &config);
        before.acquire(NodeMeta::new(false)).await.unwrap();
        drop(before);

        // Nobody renews while the node is down
        tokio::time::sleep(Duration::from_millis(2200)).await;

        let after = SlotLock::new(store.clone(), "worker-1", &config);
        assert!(after.test().await.unwrap());
        let other = SlotLock::new(store.clone(), "worker-2", &config);
        assert!(!other.acquire(NodeMeta::new(false)).await.unwrap().acquired);
        after.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_slot_taken_over_while_down_is_not_held() {
        let store = Arc::new(MemoryStore::new());
        let config = short_slot_config();
        let before = SlotLock::new(store.clone(), "worker-1", &config);
        before.acquire(NodeMeta::new(false)).await.unwrap();
        drop(before);

        steal_slot(&store, 0, "worker-2").await;

        let after = SlotLock::new(store.clone(), "worker-1", &config);
        assert!(!after.test().await.unwrap());
        assert_eq!(after.held_slot().await, None);
        assert!(matches!(after.release().await, Err(Error::NotLockHolder(_))));
    }

    #[tokio::test]
    async fn test_slot_taken_over_while_held_signals_loss() {
        let store = Arc::new(MemoryStore::new());
        let lock = SlotLock::new(store.clone(), "worker-1", &slot_config(1));
        assert!(lock.acquire(NodeMeta::new(false)).await.unwrap().acquired);

        steal_slot(&store, 0, "worker-2").await;
        tokio::time::timeout(Duration::from_secs(5), lock.lost())
            .await
            .expect("lock loss not signalled");
        assert!(!lock.test().await.unwrap());
    }

    #[tokio::test]
    async fn test_slot_loss_is_signalled() {
        let store = Arc::new(MemoryStore::new());
        let lock = SlotLock::new(store.clone(), "worker-1", &slot_config(1));
        assert!(lock.acquire(NodeMeta::new(false)).await.unwrap().acquired);

        // Renewals start failing; the loss fires once the renew deadline passes
        store.set_unreachable(true);
        tokio::time::timeout(Duration::from_secs(5), lock.lost())
            .await
            .expect("lock loss not signalled");
    }

    #[tokio::test]
    async fn test_build_lock_selects_strategy() {
        let store = store_with_daemonset();
        let lock = build_lock(&config(), store.clone(), "worker-1");
        assert_eq!(lock.node_id(), "worker-1");
        assert!(lock.acquire(NodeMeta::new(false)).await.unwrap().acquired);
        assert!(stored_record(&store, &config().annotation).is_some());
    }
}
