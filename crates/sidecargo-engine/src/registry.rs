//! The process-wide store of sidecar [`Template`]s.
//!
//! The registry keeps two maps: the templates themselves and the compiled
//! [`Selector`] of every template which has a selector configured. Both maps
//! live behind a single [`RwLock`], so readers always observe them in sync.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use snafu::{ResultExt, Snafu};

use crate::{
    selector::{Selector, SelectorError},
    template::{Template, TemplateError, TemplateKey},
};

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum RegistryError {
    #[snafu(display("failed to compile label selector of template {key}"))]
    InvalidSelector {
        source: SelectorError,
        key: TemplateKey,
    },

    #[snafu(display("template {key} is invalid"))]
    InvalidTemplate {
        source: TemplateError,
        key: TemplateKey,
    },
}

/// A point-in-time view of a single registry entry.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotEntry {
    pub key: TemplateKey,
    pub template: Arc<Template>,

    /// Present if and only if `template.selector` is set.
    pub selector: Option<Arc<Selector>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    templates: BTreeMap<TemplateKey, Arc<Template>>,
    selectors: BTreeMap<TemplateKey, Arc<Selector>>,
}

/// Concurrent store mapping [`TemplateKey`]s to [`Template`]s and their
/// compiled [`Selector`]s.
///
/// Writes ([`put`](Self::put), [`delete`](Self::delete),
/// [`retain`](Self::retain)) exclude all other access, reads
/// ([`snapshot`](Self::snapshot)) may run concurrently. No I/O happens while
/// the lock is held.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    state: RwLock<RegistryState>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the template stored under `key`.
    ///
    /// The template is validated and its selector compiled before the lock is
    /// taken. If either fails, the registry is left untouched and the previous
    /// entry for `key` (if any) stays in place.
    pub fn put(&self, key: TemplateKey, template: Template) -> Result<()> {
        template
            .validate()
            .with_context(|_| InvalidTemplateSnafu { key: key.clone() })?;

        let selector = template
            .selector
            .as_ref()
            .map(Selector::compile)
            .transpose()
            .with_context(|_| InvalidSelectorSnafu { key: key.clone() })?
            .map(Arc::new);

        tracing::debug!(
            template.key = %key,
            template.selector = selector.as_ref().map(ToString::to_string),
            "storing template"
        );

        let mut state = self.write();
        if let Some(selector) = selector {
            state.selectors.insert(key.clone(), selector);
        } else {
            state.selectors.remove(&key);
        }
        state.templates.insert(key, Arc::new(template));

        Ok(())
    }

    /// Removes the template stored under `key` together with its selector.
    ///
    /// Unknown keys are ignored. Returns whether a template was removed.
    pub fn delete(&self, key: &TemplateKey) -> bool {
        let mut state = self.write();
        state.selectors.remove(key);
        let removed = state.templates.remove(key).is_some();

        if removed {
            tracing::debug!(template.key = %key, "removed template");
        }

        removed
    }

    /// Removes every template whose key is not contained in `keys` and returns
    /// the removed keys.
    ///
    /// This is used after the full state has been re-listed from the cluster,
    /// to drop templates whose deletion was missed in between.
    pub fn retain(&self, keys: &BTreeSet<TemplateKey>) -> Vec<TemplateKey> {
        let mut state = self.write();
        let stale = state
            .templates
            .keys()
            .filter(|key| !keys.contains(*key))
            .cloned()
            .collect::<Vec<_>>();

        for key in &stale {
            state.selectors.remove(key);
            state.templates.remove(key);
        }

        stale
    }

    /// Returns a consistent copy of all entries, ordered by key.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        let state = self.read();

        state
            .templates
            .iter()
            .map(|(key, template)| SnapshotEntry {
                key: key.clone(),
                template: template.clone(),
                selector: state.selectors.get(key).cloned(),
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<TemplateKey> {
        self.read().templates.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().templates.is_empty()
    }

    // The state is only ever changed by single map operations, which leave it
    // consistent even if a holder of the lock panicked.
    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::core::v1::Container,
        apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
    };

    use super::*;

    fn template_with_selector(app: &str) -> Template {
        Template {
            selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([("app".to_owned(), app.to_owned())])),
                match_expressions: None,
            }),
            ..Template::default()
        }
    }

    fn invalid_selector_template() -> Template {
        Template {
            selector: Some(LabelSelector {
                match_labels: None,
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: "app".to_owned(),
                    operator: "Matches".to_owned(),
                    values: None,
                }]),
            }),
            ..Template::default()
        }
    }

    #[test]
    fn put_compiles_selector() {
        let registry = TemplateRegistry::new();
        let key = TemplateKey::new("default", "web");
        registry.put(key.clone(), template_with_selector("web")).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, key);
        assert_eq!(
            snapshot[0].selector.as_deref().map(ToString::to_string),
            Some("app=web".to_owned())
        );
    }

    #[test]
    fn put_without_selector_drops_compiled_selector() {
        let registry = TemplateRegistry::new();
        let key = TemplateKey::new("default", "web");
        registry.put(key.clone(), template_with_selector("web")).unwrap();
        registry.put(key.clone(), Template::default()).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].selector.is_none());
        assert!(snapshot[0].template.selector.is_none());
    }

    #[test]
    fn invalid_selector_leaves_registry_untouched() {
        let registry = TemplateRegistry::new();
        let key = TemplateKey::new("default", "web");
        registry.put(key.clone(), template_with_selector("web")).unwrap();
        let before = registry.snapshot();

        let err = registry
            .put(key.clone(), invalid_selector_template())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSelector { .. }));
        assert_eq!(registry.snapshot(), before);

        // Also for keys which were not present before
        let err = registry
            .put(TemplateKey::new("default", "other"), invalid_selector_template())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSelector { .. }));
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn invalid_template_leaves_registry_untouched() {
        let registry = TemplateRegistry::new();
        let template = Template {
            containers: vec![Container::default()],
            ..Template::default()
        };

        let err = registry
            .put(TemplateKey::new("default", "web"), template)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidTemplate {
                source: TemplateError::EmptyContainerName { index: 0 },
                key: TemplateKey::new("default", "web"),
            }
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn delete() {
        let registry = TemplateRegistry::new();
        let key = TemplateKey::new("default", "web");
        registry.put(key.clone(), template_with_selector("web")).unwrap();

        assert!(!registry.delete(&TemplateKey::new("default", "unknown")));
        assert_eq!(registry.len(), 1);

        assert!(registry.delete(&key));
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());

        assert!(!registry.delete(&key));
    }

    #[test]
    fn snapshot_is_ordered_by_key() {
        let registry = TemplateRegistry::new();
        for (namespace, name) in [("b", "x"), ("a", "z"), ("a", "y")] {
            registry
                .put(TemplateKey::new(namespace, name), Template::default())
                .unwrap();
        }

        let keys = registry
            .snapshot()
            .into_iter()
            .map(|entry| entry.key.to_string())
            .collect::<Vec<_>>();
        assert_eq!(keys, ["a/y", "a/z", "b/x"]);
    }

    #[test]
    fn retain_removes_stale_keys() {
        let registry = TemplateRegistry::new();
        for name in ["a", "b", "c"] {
            registry
                .put(TemplateKey::new("default", name), template_with_selector(name))
                .unwrap();
        }

        let keep = BTreeSet::from([
            TemplateKey::new("default", "b"),
            TemplateKey::new("default", "unknown"),
        ]);
        let removed = registry.retain(&keep);

        assert_eq!(
            removed,
            [TemplateKey::new("default", "a"), TemplateKey::new("default", "c")]
        );
        assert_eq!(registry.keys(), [TemplateKey::new("default", "b")]);
        assert!(registry.snapshot()[0].selector.is_some());
    }

    #[test]
    fn concurrent_readers_never_observe_torn_state() {
        let registry = TemplateRegistry::new();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    let key = TemplateKey::new("default", format!("t{}", i % 10));
                    if i % 3 == 0 {
                        registry.delete(&key);
                    } else if i % 2 == 0 {
                        registry.put(key, Template::default()).unwrap();
                    } else {
                        registry.put(key, template_with_selector("web")).unwrap();
                    }
                }
            });

            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        for entry in registry.snapshot() {
                            assert_eq!(entry.selector.is_some(), entry.template.selector.is_some());
                        }
                    }
                });
            }
        });
    }
}
