use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Taint};
use mcm_core::retry::retry_async;
use mcm_core::{McmError, Result};
use tracing::{debug, info};

use crate::api::ClusterApi;

/// Attempts of the read-merge-replace loop before a conflict is surfaced.
pub const TAINT_ATTEMPTS: u32 = 5;
const TAINT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Merge `new` into `existing`.
///
/// Taints are matched on key and effect. A match with the same value is a
/// no-op, a match with another value is overwritten, and without a match the
/// taint is appended. Returns the merged set and whether it changed.
pub fn merge_taint(existing: &[Taint], new: &Taint) -> (Vec<Taint>, bool) {
    let mut merged = existing.to_vec();
    match merged
        .iter_mut()
        .find(|t| t.key == new.key && t.effect == new.effect)
    {
        Some(t) if t.value == new.value => (merged, false),
        Some(t) => {
            t.value = new.value.clone();
            t.time_added = new.time_added.clone();
            (merged, true)
        }
        None => {
            merged.push(new.clone());
            (merged, true)
        }
    }
}

pub fn node_taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or_default()
}

/// Whether the node carries a taint with the key, value and effect of `taint`.
pub fn node_has_taint(node: &Node, taint: &Taint) -> bool {
    node_taints(node)
        .iter()
        .any(|t| t.key == taint.key && t.value == taint.value && t.effect == taint.effect)
}

/// Add or update a taint on a node, retrying on version conflicts.
pub async fn taint_node(cluster: &dyn ClusterApi, name: &str, taint: &Taint) -> Result<()> {
    let label = format!("taint node {}", name);
    retry_async(
        TAINT_ATTEMPTS,
        TAINT_RETRY_DELAY,
        &label,
        McmError::is_conflict,
        || async move {
            let mut node = cluster
                .get_node(name)
                .await?
                .ok_or_else(|| McmError::not_found(format!("node {}", name)))?;
            let (merged, changed) = merge_taint(node_taints(&node), taint);
            if !changed {
                debug!(node = name, key = %taint.key, "taint already present");
                return Ok(());
            }
            node.spec.get_or_insert_with(Default::default).taints = Some(merged);
            cluster.replace_node(&node).await?;
            info!(node = name, key = %taint.key, effect = %taint.effect, "node tainted");
            Ok(())
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeCluster;
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::Ordering;

    fn taint(key: &str, value: &str, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: Some(value.to_string()),
            effect: effect.to_string(),
            ..Default::default()
        }
    }

    fn node(name: &str, taints: Vec<Taint>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: Some(taints),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_appends_new_key() {
        let existing = vec![taint("a", "1", "NoSchedule")];
        let (merged, changed) = merge_taint(&existing, &taint("b", "2", "NoSchedule"));
        assert!(changed);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_same_value_is_noop() {
        let existing = vec![taint("a", "1", "NoSchedule")];
        let (merged, changed) = merge_taint(&existing, &taint("a", "1", "NoSchedule"));
        assert!(!changed);
        assert_eq!(merged, existing);
    }

    #[test]
    fn test_merge_overwrites_value() {
        let existing = vec![taint("a", "1", "NoSchedule"), taint("c", "3", "NoExecute")];
        let (merged, changed) = merge_taint(&existing, &taint("a", "9", "NoSchedule"));
        assert!(changed);
        assert_eq!(merged, vec![taint("a", "9", "NoSchedule"), taint("c", "3", "NoExecute")]);
    }

    #[test]
    fn test_merge_different_effect_is_separate() {
        let existing = vec![taint("a", "1", "NoSchedule")];
        let (merged, changed) = merge_taint(&existing, &taint("a", "1", "NoExecute"));
        assert!(changed);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_twice_equals_once() {
        let t = taint("k", "v", "NoSchedule");
        let (once, _) = merge_taint(&[], &t);
        let (twice, changed) = merge_taint(&once, &t);
        assert!(!changed);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_node_has_taint() {
        let n = node("n1", vec![taint("a", "1", "NoSchedule")]);
        assert!(node_has_taint(&n, &taint("a", "1", "NoSchedule")));
        assert!(!node_has_taint(&n, &taint("a", "2", "NoSchedule")));
        assert!(!node_has_taint(&Node::default(), &taint("a", "1", "NoSchedule")));
    }

    #[tokio::test]
    async fn test_taint_node_retries_conflict() {
        let cluster = FakeCluster::default().with_node(node("n1", vec![taint("x", "1", "NoExecute")]));
        cluster.conflicts.store(1, Ordering::SeqCst);

        let t = taint("mcm", "net-test", "NoSchedule");
        taint_node(&cluster, "n1", &t).await.unwrap();

        let stored = cluster.get_node("n1").await.unwrap().unwrap();
        assert_eq!(
            node_taints(&stored),
            &[taint("x", "1", "NoExecute"), t.clone()]
        );
        assert_eq!(cluster.node_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_taint_node_gives_up_after_attempts() {
        let cluster = FakeCluster::default().with_node(node("n1", vec![]));
        cluster.conflicts.store(TAINT_ATTEMPTS as usize, Ordering::SeqCst);
        let err = taint_node(&cluster, "n1", &taint("a", "1", "NoSchedule"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_taint_node_twice_writes_once() {
        let cluster = FakeCluster::default().with_node(node("n1", vec![]));
        let t = taint("a", "1", "NoSchedule");
        taint_node(&cluster, "n1", &t).await.unwrap();
        taint_node(&cluster, "n1", &t).await.unwrap();
        assert_eq!(cluster.node_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_taint_missing_node() {
        let cluster = FakeCluster::default();
        let err = taint_node(&cluster, "ghost", &taint("a", "1", "NoSchedule"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
