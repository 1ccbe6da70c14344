//! Merges the init containers, containers and volumes of matched templates
//! into a Pod.
//!
//! The three lists follow different rules:
//!
//! - Init containers are appended in match order and never de-duplicated.
//! - Containers are merged by name. A later definition replaces an earlier
//!   one in place, so templates can override containers of the Pod and of
//!   templates matched before them.
//! - Volumes are merged by name as well, but the first definition wins. Pod
//!   volumes are never replaced by template volumes.
use std::collections::BTreeSet;

use indexmap::IndexMap;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Volume};

use crate::template::Template;

/// The merged lists which should replace the ones of the original Pod.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationResult {
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
}

impl MutationResult {
    /// Writes the merged lists onto `pod`.
    ///
    /// A missing [`PodSpec`] is created. Init container and volume lists which
    /// are absent on the Pod stay absent if they are still empty, so that they
    /// don't show up in the resulting patch.
    pub fn apply_to(self, pod: &mut Pod) {
        let spec = pod.spec.get_or_insert_with(PodSpec::default);

        if !self.init_containers.is_empty() || spec.init_containers.is_some() {
            spec.init_containers = Some(self.init_containers);
        }
        spec.containers = self.containers;
        if !self.volumes.is_empty() || spec.volumes.is_some() {
            spec.volumes = Some(self.volumes);
        }
    }

    /// Consumes `pod` and returns it with the merged lists applied.
    pub fn into_pod(self, mut pod: Pod) -> Pod {
        self.apply_to(&mut pod);
        pod
    }
}

/// Containers keyed by name, preserving the position of the first insert.
#[derive(Debug, Default)]
struct ContainerMerger(IndexMap<String, Container>);

impl ContainerMerger {
    /// Replaces a container with the same name in place or appends it.
    fn merge(&mut self, container: Container) {
        self.0.insert(container.name.clone(), container);
    }

    fn into_containers(self) -> Vec<Container> {
        self.0.into_values().collect()
    }
}

/// Volumes in insertion order, where the first volume of a name wins.
#[derive(Debug, Default)]
struct VolumeMerger {
    names: BTreeSet<String>,
    volumes: Vec<Volume>,
}

impl VolumeMerger {
    /// Appends the volume unless one with the same name is already present.
    /// Returns whether the volume was added.
    fn merge(&mut self, volume: Volume) -> bool {
        if !self.names.insert(volume.name.clone()) {
            return false;
        }

        self.volumes.push(volume);
        true
    }
}

/// Computes the init containers, containers and volumes `pod` ends up with
/// after injecting `templates`, applied in the given order.
///
/// The function is pure: the same Pod and the same templates always yield
/// the same result.
pub fn apply<'a, I>(pod: &Pod, templates: I) -> MutationResult
where
    I: IntoIterator<Item = &'a Template>,
{
    let spec = pod.spec.as_ref();

    let mut init_containers = spec
        .and_then(|spec| spec.init_containers.clone())
        .unwrap_or_default();

    let mut containers = ContainerMerger::default();
    for container in spec.map(|spec| spec.containers.clone()).unwrap_or_default() {
        containers.merge(container);
    }

    let mut volumes = VolumeMerger::default();
    for volume in spec
        .and_then(|spec| spec.volumes.clone())
        .unwrap_or_default()
    {
        volumes.merge(volume);
    }

    for template in templates {
        init_containers.extend(template.init_containers.iter().cloned());

        for container in &template.containers {
            containers.merge(container.clone());
        }

        for volume in &template.volumes {
            if !volumes.merge(volume.clone()) {
                tracing::trace!(volume.name = %volume.name, "volume already present, skipping");
            }
        }
    }

    MutationResult {
        init_containers,
        containers: containers.into_containers(),
        volumes: volumes.volumes,
    }
}
