use std::{collections::BTreeSet, fmt::Display};

use k8s_openapi::{
    api::core::v1::{Container, Volume},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::ResourceExt;
use snafu::{Snafu, ensure};

use crate::crd::{SidecarGo, SidecarGoSpec};

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum TemplateError {
    #[snafu(display("container at index {index} has an empty name"))]
    EmptyContainerName { index: usize },

    #[snafu(display("container name {name:?} is used more than once"))]
    DuplicateContainerName { name: String },

    #[snafu(display("init container at index {index} has an empty name"))]
    EmptyInitContainerName { index: usize },

    #[snafu(display("volume at index {index} has an empty name"))]
    EmptyVolumeName { index: usize },

    #[snafu(display("volume name {name:?} is used more than once"))]
    DuplicateVolumeName { name: String },
}

/// Identifies a [`Template`] by the namespace and name of its owning
/// [`SidecarGo`] resource.
///
/// Keys are ordered by namespace first and name second, which defines the
/// order in which matched templates are merged into a Pod.
///
/// This is not the order of the rendered `namespace/name` strings once one
/// namespace is a prefix of another: `a/z` sorts before `a-b/c` here, while
/// the strings sort the other way round because `-` is smaller than `/`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TemplateKey {
    namespace: String,
    name: String,
}

impl TemplateKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds the key of any namespaced resource. Cluster-scoped resources
    /// get an empty namespace.
    pub fn from_resource<K: ResourceExt>(resource: &K) -> Self {
        Self::new(resource.namespace().unwrap_or_default(), resource.name_any())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for TemplateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A sidecar definition together with the scope of Pods it applies to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Template {
    /// Only Pods in this namespace are candidates. `None` or an empty string
    /// makes the template a cluster-wide candidate.
    pub scope_namespace: Option<String>,

    /// `None` means no selector was configured at all, which is different
    /// from an empty selector.
    pub selector: Option<LabelSelector>,

    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
}

impl Template {
    /// Returns the scope namespace, treating an empty string as unset.
    pub fn scope_namespace(&self) -> Option<&str> {
        self.scope_namespace
            .as_deref()
            .filter(|namespace| !namespace.is_empty())
    }

    /// Checks that every container, init container and volume is named and
    /// that container and volume names are unique within this template.
    pub fn validate(&self) -> Result<(), TemplateError> {
        for (index, container) in self.init_containers.iter().enumerate() {
            ensure!(
                !container.name.is_empty(),
                EmptyInitContainerNameSnafu { index }
            );
        }

        let mut names = BTreeSet::new();
        for (index, container) in self.containers.iter().enumerate() {
            ensure!(!container.name.is_empty(), EmptyContainerNameSnafu { index });
            ensure!(
                names.insert(container.name.as_str()),
                DuplicateContainerNameSnafu {
                    name: &container.name
                }
            );
        }

        let mut names = BTreeSet::new();
        for (index, volume) in self.volumes.iter().enumerate() {
            ensure!(!volume.name.is_empty(), EmptyVolumeNameSnafu { index });
            ensure!(
                names.insert(volume.name.as_str()),
                DuplicateVolumeNameSnafu { name: &volume.name }
            );
        }

        Ok(())
    }
}

impl From<SidecarGoSpec> for Template {
    fn from(spec: SidecarGoSpec) -> Self {
        Self {
            scope_namespace: spec.namespace,
            selector: spec.selector,
            init_containers: spec.init_containers,
            containers: spec.containers,
            volumes: spec.volumes,
        }
    }
}

impl From<&SidecarGo> for Template {
    fn from(sidecar_go: &SidecarGo) -> Self {
        sidecar_go.spec.clone().into()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn container(name: &str) -> Container {
        Container {
            name: name.to_owned(),
            ..Container::default()
        }
    }

    fn volume(name: &str) -> Volume {
        Volume {
            name: name.to_owned(),
            ..Volume::default()
        }
    }

    #[test]
    fn key_display_and_order() {
        let mut keys = vec![
            TemplateKey::new("b", "a"),
            TemplateKey::new("a", "z"),
            TemplateKey::new("a", "b"),
        ];
        keys.sort();

        let keys = keys.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(keys, ["a/b", "a/z", "b/a"]);
    }

    #[test]
    fn key_order_compares_namespace_first() {
        let mut keys = vec![TemplateKey::new("a-b", "c"), TemplateKey::new("a", "z")];
        keys.sort();

        let keys = keys.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(keys, ["a/z", "a-b/c"]);
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some(""), None)]
    #[case(Some("default"), Some("default"))]
    fn scope_namespace(#[case] input: Option<&str>, #[case] expected: Option<&str>) {
        let template = Template {
            scope_namespace: input.map(ToOwned::to_owned),
            ..Template::default()
        };

        assert_eq!(template.scope_namespace(), expected);
    }

    #[rstest]
    #[case(Template { containers: vec![container("a"), container("")], ..Template::default() }, TemplateError::EmptyContainerName { index: 1 })]
    #[case(Template { containers: vec![container("a"), container("a")], ..Template::default() }, TemplateError::DuplicateContainerName { name: "a".to_owned() })]
    #[case(Template { init_containers: vec![container("")], ..Template::default() }, TemplateError::EmptyInitContainerName { index: 0 })]
    #[case(Template { volumes: vec![volume("")], ..Template::default() }, TemplateError::EmptyVolumeName { index: 0 })]
    #[case(Template { volumes: vec![volume("v"), volume("v")], ..Template::default() }, TemplateError::DuplicateVolumeName { name: "v".to_owned() })]
    fn invalid_template(#[case] template: Template, #[case] error: TemplateError) {
        assert_eq!(template.validate().unwrap_err(), error);
    }

    #[test]
    fn duplicate_init_container_names_are_allowed() {
        let template = Template {
            init_containers: vec![container("init"), container("init")],
            containers: vec![container("a"), container("b")],
            volumes: vec![volume("v1"), volume("v2")],
            ..Template::default()
        };

        assert_eq!(template.validate(), Ok(()));
    }
}
