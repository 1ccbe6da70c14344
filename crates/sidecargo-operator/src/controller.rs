//! Keeps the [`TemplateRegistry`] in sync with the `SidecarGo` resources in
//! the cluster.
//!
//! A raw [`watcher`] is used instead of a `kube::runtime::Controller`, because
//! deletions have to reach the registry as well. Every (re)list of the watch
//! replays the complete cluster state, after which templates that were not
//! seen again are dropped.
use std::{collections::BTreeSet, sync::Arc};

use futures::StreamExt;
use kube::{
    Client,
    runtime::{
        WatchStreamExt,
        watcher::{self, Event},
    },
};
use sidecargo_engine::{Template, TemplateKey, TemplateRegistry, crd::SidecarGo};
use tokio::sync::oneshot;

use crate::cli::WatchNamespace;

/// Applies watch events to a [`TemplateRegistry`].
#[derive(Debug)]
pub struct TemplateReconciler {
    registry: Arc<TemplateRegistry>,

    /// Keys seen since the current (re)list started.
    seen: BTreeSet<TemplateKey>,
}

impl TemplateReconciler {
    pub fn new(registry: Arc<TemplateRegistry>) -> Self {
        Self {
            registry,
            seen: BTreeSet::new(),
        }
    }

    /// Applies a single watch event. Returns `true` once a complete (re)list
    /// has been applied.
    pub fn handle_event(&mut self, event: Event<SidecarGo>) -> bool {
        match event {
            Event::Apply(sidecargo) => {
                self.apply(&sidecargo);
                false
            }
            Event::Delete(sidecargo) => {
                self.delete(&sidecargo);
                false
            }
            Event::Init => {
                tracing::debug!("relisting SidecarGo resources");
                self.seen.clear();
                false
            }
            Event::InitApply(sidecargo) => {
                self.seen.insert(TemplateKey::from_resource(&sidecargo));
                self.apply(&sidecargo);
                false
            }
            Event::InitDone => {
                let seen = std::mem::take(&mut self.seen);
                let stale = self.registry.retain(&seen);
                for key in &stale {
                    tracing::info!(template.key = %key, "removed template which no longer exists");
                }

                tracing::info!(
                    templates = self.registry.len(),
                    "synchronized SidecarGo resources"
                );
                true
            }
        }
    }

    fn apply(&self, sidecargo: &SidecarGo) {
        let key = TemplateKey::from_resource(sidecargo);

        // A resource being deleted must not be injected anymore
        if sidecargo.metadata.deletion_timestamp.is_some() {
            self.delete(sidecargo);
            return;
        }

        match self.registry.put(key.clone(), Template::from(sidecargo)) {
            Ok(()) => tracing::info!(template.key = %key, "registered template"),
            Err(err) => tracing::warn!(
                error = &err as &dyn std::error::Error,
                template.key = %key,
                "rejected invalid template, keeping previous state"
            ),
        }
    }

    fn delete(&self, sidecargo: &SidecarGo) {
        let key = TemplateKey::from_resource(sidecargo);
        if self.registry.delete(&key) {
            tracing::info!(template.key = %key, "unregistered template");
        }
    }
}

/// Watches `SidecarGo` resources and feeds them into `registry` until the
/// watch stream ends.
///
/// `ready_tx` is notified once the initial list has been applied, so that
/// admission requests are only served with a complete registry.
pub async fn run(
    client: Client,
    watch_namespace: WatchNamespace,
    registry: Arc<TemplateRegistry>,
    ready_tx: oneshot::Sender<()>,
) {
    let api = watch_namespace.get_api::<SidecarGo>(&client);
    let mut reconciler = TemplateReconciler::new(registry);
    let mut ready_tx = Some(ready_tx);

    tracing::info!(?watch_namespace, "starting SidecarGo watcher");
    let mut stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if reconciler.handle_event(event) {
                    if let Some(ready_tx) = ready_tx.take() {
                        // The receiver only goes away during shutdown
                        let _ = ready_tx.send(());
                    }
                }
            }
            Err(err) => tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to watch SidecarGo resources, retrying"
            ),
        }
    }

    tracing::info!("SidecarGo watcher stopped");
}
