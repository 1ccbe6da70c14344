//! The injection decision engine of SidecarGo.
//!
//! - [`TemplateRegistry`] stores the sidecar [`Template`]s declared by
//!   [`SidecarGo`][crd::SidecarGo] resources, together with their compiled
//!   label [`Selector`]s.
//! - [`Matcher`] selects the templates which apply to a Pod.
//! - [`injector::apply`] merges the matched templates into the Pod.
//!
//! ```
//! use std::sync::Arc;
//!
//! use k8s_openapi::api::core::v1::{Container, Pod};
//! use sidecargo_engine::{Matcher, Template, TemplateKey, TemplateRegistry, injector};
//!
//! let registry = Arc::new(TemplateRegistry::new());
//! registry
//!     .put(
//!         TemplateKey::new("default", "proxy"),
//!         Template {
//!             scope_namespace: Some("default".to_owned()),
//!             containers: vec![Container {
//!                 name: "proxy".to_owned(),
//!                 ..Container::default()
//!             }],
//!             ..Template::default()
//!         },
//!     )
//!     .unwrap();
//!
//! let mut pod = Pod::default();
//! pod.metadata.namespace = Some("default".to_owned());
//!
//! let matched = Matcher::new(registry).matches(&pod);
//! let result = injector::apply(&pod, matched.iter().map(|m| m.template.as_ref()));
//! assert_eq!(result.containers[0].name, "proxy");
//! ```
pub mod crd;
pub mod injector;
pub mod matcher;
pub mod registry;
pub mod selector;
pub mod template;

// Selected re-exports
pub use crate::{
    injector::MutationResult,
    matcher::{MatchedTemplate, Matcher},
    registry::{RegistryError, SnapshotEntry, TemplateRegistry},
    selector::{Selector, SelectorError},
    template::{Template, TemplateError, TemplateKey},
};
