//! Session orchestrator (C7) — §4.7: for a set of recipient users,
//! fetch bundles, ensure sessions, and report readiness.

use async_trait::async_trait;

use dl_store::{IdentityRecord, SecureStore};

use crate::identity::{verify_device_bundle, PreKeyBundleList};
use crate::ratchet_session::{init_as_initiator, init_self_session};

/// External collaborator: resolves a user's published pre-key bundle
/// list. Out of scope per §1 ("server-side pre-key-bundle directory").
#[async_trait]
pub trait BundleResolver: Send + Sync {
    async fn resolve(&self, user_id: u64) -> Option<PreKeyBundleList>;
}

#[derive(Debug, Default)]
pub struct ReadinessReport {
    pub ready_recipients: Vec<(u64, String)>,
    pub pending_user_ids: Vec<u64>,
}

/// `ensureRatchetSessionsForRecipients` — §4.7.
pub async fn ensure_ratchet_sessions_for_recipients(
    store: &dyn SecureStore,
    local: &IdentityRecord,
    local_device_id: &str,
    peer_user_ids: &[u64],
    resolver: &dyn BundleResolver,
) -> ReadinessReport {
    let mut report = ReadinessReport::default();
    let mut seen = std::collections::HashSet::new();

    for &peer_user_id in peer_user_ids {
        if peer_user_id == 0 || !seen.insert(peer_user_id) {
            continue;
        }

        if peer_user_id == local.user_id {
            ensure_self_fanout(store, local, local_device_id, resolver, &mut report).await;
            continue;
        }

        let Some(bundle_list) = resolver.resolve(peer_user_id).await else {
            report.pending_user_ids.push(peer_user_id);
            continue;
        };
        if bundle_list.devices.is_empty() {
            report.pending_user_ids.push(peer_user_id);
            continue;
        }

        let mut any_ready = false;
        for device in &bundle_list.devices {
            if try_ensure_session(store, local, local_device_id, peer_user_id, &device.device_id, Some(device))
                .await
                .is_some()
            {
                report.ready_recipients.push((peer_user_id, device.device_id.clone()));
                any_ready = true;
            }
        }
        if !any_ready {
            report.pending_user_ids.push(peer_user_id);
        }
    }

    report
}

async fn ensure_self_fanout(
    store: &dyn SecureStore,
    local: &IdentityRecord,
    local_device_id: &str,
    resolver: &dyn BundleResolver,
    report: &mut ReadinessReport,
) {
    let has_self_session = matches!(
        store.read_session(local.user_id, local_device_id, local.user_id, local_device_id).await,
        Ok(Some(_))
    );
    if has_self_session {
        report.ready_recipients.push((local.user_id, local_device_id.to_string()));
    } else {
        let self_session = init_self_session(local);
        if store.write_session(&self_session).await.is_ok() {
            report.ready_recipients.push((local.user_id, local_device_id.to_string()));
        }
    }

    let Some(bundle_list) = resolver.resolve(local.user_id).await else {
        return;
    };

    let mut any_other_ready = false;
    let mut has_other_devices = false;
    for device in &bundle_list.devices {
        if device.device_id == local_device_id {
            continue;
        }
        has_other_devices = true;
        if try_ensure_session(store, local, local_device_id, local.user_id, &device.device_id, Some(device))
            .await
            .is_some()
        {
            report.ready_recipients.push((local.user_id, device.device_id.clone()));
            any_other_ready = true;
        }
    }
    if has_other_devices && !any_other_ready {
        report.pending_user_ids.push(local.user_id);
    }
}

async fn try_ensure_session(
    store: &dyn SecureStore,
    local: &IdentityRecord,
    local_device_id: &str,
    peer_user_id: u64,
    peer_device_id: &str,
    bundle: Option<&crate::identity::DeviceBundle>,
) -> Option<()> {
    if let Ok(Some(_)) = store
        .read_session(local.user_id, local_device_id, peer_user_id, peer_device_id)
        .await
    {
        return Some(());
    }

    let bundle = bundle?;
    if verify_device_bundle(bundle).is_err() {
        tracing::warn!(target: "dl_proto::orchestrator", peer_user_id, peer_device_id, "bundle signature invalid, skipping device");
        return None;
    }
    let session = init_as_initiator(local, bundle).ok()?;
    store.write_session(&session).await.ok()?;
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{load_or_create_identity, to_signal_pre_key_bundle_upload};
    use dl_store::MemoryStore;

    struct FixedResolver {
        lists: std::collections::HashMap<u64, PreKeyBundleList>,
    }

    #[async_trait]
    impl BundleResolver for FixedResolver {
        async fn resolve(&self, user_id: u64) -> Option<PreKeyBundleList> {
            self.lists.get(&user_id).cloned()
        }
    }

    #[tokio::test]
    async fn ensures_sessions_for_each_peer_device() {
        let store = MemoryStore::new();
        let alice = load_or_create_identity(&store, 201, Some("alice-mobile")).await.unwrap();
        let bob = load_or_create_identity(&store, 202, Some("bob-phone")).await.unwrap();
        let bob_bundle = to_signal_pre_key_bundle_upload(&bob).unwrap();

        let resolver = FixedResolver {
            lists: [(
                202,
                PreKeyBundleList {
                    user_id: 202,
                    username: None,
                    devices: vec![bob_bundle],
                    updated_at: None,
                },
            )]
            .into_iter()
            .collect(),
        };

        let report = ensure_ratchet_sessions_for_recipients(&store, &alice, "alice-mobile", &[202], &resolver).await;
        assert_eq!(report.ready_recipients, vec![(202, "bob-phone".to_string())]);
        assert!(report.pending_user_ids.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_peer_is_pending() {
        let store = MemoryStore::new();
        let alice = load_or_create_identity(&store, 201, Some("alice-mobile")).await.unwrap();
        let resolver = FixedResolver { lists: Default::default() };
        let report = ensure_ratchet_sessions_for_recipients(&store, &alice, "alice-mobile", &[999], &resolver).await;
        assert_eq!(report.pending_user_ids, vec![999]);
    }
}
