//! Decides which registered templates apply to a Pod.
use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::core::v1::Pod;

use crate::{
    registry::{SnapshotEntry, TemplateRegistry},
    template::{Template, TemplateKey},
};

/// A template selected for a Pod, together with the key it is registered
/// under.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchedTemplate {
    pub key: TemplateKey,
    pub template: Arc<Template>,
}

/// Matches Pods against the current state of a [`TemplateRegistry`].
#[derive(Clone, Debug)]
pub struct Matcher {
    registry: Arc<TemplateRegistry>,
}

impl Matcher {
    pub fn new(registry: Arc<TemplateRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the templates which apply to `pod`, ordered by key.
    ///
    /// The namespace is taken from the Pod metadata. Use
    /// [`Matcher::matches_labels`] if the namespace is only known from the
    /// surrounding request.
    pub fn matches(&self, pod: &Pod) -> Vec<MatchedTemplate> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let labels = pod.metadata.labels.clone().unwrap_or_default();

        self.matches_labels(namespace, &labels)
    }

    pub fn matches_labels(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Vec<MatchedTemplate> {
        match_snapshot(&self.registry.snapshot(), namespace, labels)
    }
}

/// Selects the entries of `snapshot` which apply to a Pod in `namespace` with
/// the given `labels`. The snapshot order is kept.
pub fn match_snapshot(
    snapshot: &[SnapshotEntry],
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Vec<MatchedTemplate> {
    snapshot
        .iter()
        .filter(|entry| is_eligible(entry, namespace, labels))
        .map(|entry| MatchedTemplate {
            key: entry.key.clone(),
            template: entry.template.clone(),
        })
        .collect()
}

// NOTE: The rule is deliberately asymmetric and kept for compatibility:
// an empty selector never matches, and a template with neither a namespace nor
// a selector never matches anything either.
fn is_eligible(entry: &SnapshotEntry, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
    let scope_namespace = entry.template.scope_namespace();

    if scope_namespace.is_some_and(|scope| scope != namespace) {
        return false;
    }

    match &entry.selector {
        Some(selector) => !selector.is_empty() && selector.matches(labels),
        None => scope_namespace == Some(namespace),
    }
}
