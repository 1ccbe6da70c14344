//! The `SidecarGo` custom resource, which declares a set of sidecars and the
//! scope of Pods they get injected into.
use k8s_openapi::{
    api::core::v1::{Container, Volume},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "apps.togettoyou.com";
pub const VERSION: &str = "v1alpha1";

/// Declares init containers, containers and volumes which are injected into
/// every matching Pod at admission time.
///
/// A Pod matches if it lives in `namespace` (when set) and its labels are
/// selected by a non-empty `selector`. Without a selector, only Pods in the
/// configured `namespace` match.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "apps.togettoyou.com",
    version = "v1alpha1",
    kind = "SidecarGo",
    plural = "sidecargoes",
    shortname = "sg",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SidecarGoSpec {
    /// Restricts injection to Pods in this namespace. Empty means all namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Label selector over Pod labels. A selector without any terms never
    /// matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Init containers appended after the Pod's own init containers.
    #[serde(default)]
    pub init_containers: Vec<Container>,

    /// Containers merged by name into the Pod. Existing containers with the
    /// same name are replaced.
    #[serde(default)]
    pub containers: Vec<Container>,

    /// Volumes merged by name into the Pod. Existing volumes with the same name
    /// are kept.
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[cfg(test)]
mod tests {
    use kube::CustomResourceExt;

    use super::*;

    #[test]
    fn deserialize_sidecar_go() {
        let input = r#"
          apiVersion: apps.togettoyou.com/v1alpha1
          kind: SidecarGo
          metadata:
            name: logging
            namespace: default
          spec:
            namespace: default
            selector:
              matchLabels:
                app: web
            initContainers:
              - name: init-config
                image: busybox
            containers:
              - name: fluent-bit
                image: fluent/fluent-bit
            volumes:
              - name: varlog
                emptyDir: {}
        "#;

        let sidecar_go: SidecarGo = serde_yaml::from_str(input).expect("valid SidecarGo");
        assert_eq!(sidecar_go.spec.namespace.as_deref(), Some("default"));
        assert_eq!(sidecar_go.spec.init_containers.len(), 1);
        assert_eq!(sidecar_go.spec.containers[0].name, "fluent-bit");
        assert_eq!(sidecar_go.spec.volumes[0].name, "varlog");
        assert!(sidecar_go.spec.selector.is_some());
    }

    #[test]
    fn lists_default_to_empty() {
        let input = r#"
          apiVersion: apps.togettoyou.com/v1alpha1
          kind: SidecarGo
          metadata:
            name: empty
            namespace: default
          spec: {}
        "#;

        let sidecar_go: SidecarGo = serde_yaml::from_str(input).expect("valid SidecarGo");
        assert_eq!(sidecar_go.spec, SidecarGoSpec::default());
    }

    #[test]
    fn crd_metadata() {
        let crd = SidecarGo::crd();
        assert_eq!(crd.spec.group, GROUP);
        assert_eq!(crd.spec.names.plural, "sidecargoes");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.versions[0].name, VERSION);
    }
}
