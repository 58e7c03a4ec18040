//! Watch loop and reconciliation workers
//!
//! Every ChartRelease event is turned into a `(namespace, name)` key and
//! handed to the worker selected by the key's hash, so passes for one key
//! never run concurrently and stay in event order. Failed passes are retried
//! after the requeue delay.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    Api, Client, ResourceExt,
    api::ListParams,
    runtime::{WatchStreamExt, watcher},
};
use rudder_kube::Namespaces;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::crd::{CRD_NAME, ChartRelease};
use crate::error::Result;
use crate::reconciler::{DesiredStateSource, Reconciler};

/// Queue depth per worker
const WORKER_QUEUE: usize = 64;

/// Namespaced name of a ChartRelease
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn of(resource: &ChartRelease) -> Option<Self> {
        Some(Self::new(resource.namespace()?, resource.name_any()))
    }
}

/// Worker index for a key, stable for the life of the process
pub fn shard_for(key: &ObjectKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// ChartRelease lookups against the API server
pub struct ClusterDesiredState {
    client: Client,
    definitions: Api<CustomResourceDefinition>,
}

impl ClusterDesiredState {
    pub fn new(client: Client) -> Self {
        Self {
            definitions: Api::all(client.clone()),
            client,
        }
    }
}

#[async_trait]
impl DesiredStateSource for ClusterDesiredState {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ChartRelease>> {
        let api: Api<ChartRelease> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn definition_exists(&self) -> Result<bool> {
        Ok(self.definitions.get_opt(CRD_NAME).await?.is_some())
    }
}

/// Routes keys to workers
#[derive(Clone)]
pub struct Dispatcher {
    workers: Vec<mpsc::Sender<ObjectKey>>,
}

impl Dispatcher {
    /// Spawn `workers` reconciliation workers onto `tasks`
    pub fn spawn(
        reconciler: Arc<Reconciler>,
        workers: usize,
        requeue: Duration,
        tasks: &mut JoinSet<()>,
    ) -> Self {
        let mut senders = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            tasks.spawn(work(index, reconciler.clone(), rx, tx.clone(), requeue));
            senders.push(tx);
        }
        Self { workers: senders }
    }

    /// Queue a key on its worker, waiting while that worker is busy
    pub async fn dispatch(&self, key: ObjectKey) {
        let shard = shard_for(&key, self.workers.len());
        if self.workers[shard].send(key).await.is_err() {
            tracing::error!(shard, "reconciliation worker stopped");
        }
    }
}

async fn work(
    index: usize,
    reconciler: Arc<Reconciler>,
    mut keys: mpsc::Receiver<ObjectKey>,
    requeue_tx: mpsc::Sender<ObjectKey>,
    requeue: Duration,
) {
    while let Some(key) = keys.recv().await {
        match reconciler.reconcile(&key.namespace, &key.name).await {
            Ok(outcome) => {
                tracing::debug!(worker = index, namespace = %key.namespace, name = %key.name, ?outcome, "reconciled");
            }
            Err(e) => {
                tracing::warn!(
                    worker = index,
                    namespace = %key.namespace,
                    name = %key.name,
                    error = %e,
                    retry_in = ?requeue,
                    "reconciliation failed, requeueing"
                );
                let tx = requeue_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(requeue).await;
                    let _ = tx.send(key).await;
                });
            }
        }
    }
}

/// Track the namespace of every existing ChartRelease
pub async fn track_namespaces(api: &Api<ChartRelease>, namespaces: &Namespaces) -> Result<()> {
    for resource in api.list(&ListParams::default()).await? {
        if let Some(namespace) = resource.namespace() {
            namespaces.add(&namespace);
        }
    }
    tracing::debug!(namespaces = ?namespaces.list(), "tracked ChartRelease namespaces");
    Ok(())
}

/// Key an event touches; namespaces of applied resources become tracked
fn event_key(event: watcher::Event<ChartRelease>, namespaces: &Namespaces) -> Option<ObjectKey> {
    let (resource, applied) = match event {
        watcher::Event::Apply(resource) | watcher::Event::InitApply(resource) => (resource, true),
        watcher::Event::Delete(resource) => (resource, false),
        watcher::Event::Init => return None,
        watcher::Event::InitDone => {
            tracing::info!("initial ChartRelease listing complete");
            return None;
        }
    };

    let Some(key) = ObjectKey::of(&resource) else {
        tracing::warn!(name = %resource.name_any(), "ChartRelease without namespace");
        return None;
    };
    if applied && namespaces.add(&key.namespace) {
        tracing::info!(namespace = %key.namespace, "tracking namespace");
    }
    Some(key)
}

/// Watch ChartReleases and reconcile every key an event touches
///
/// Returns when the watch stream ends.
pub async fn run(
    api: Api<ChartRelease>,
    dispatcher: Dispatcher,
    namespaces: Namespaces,
) -> Result<()> {
    let mut events = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    tracing::info!("watching ChartRelease resources");

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if let Some(key) = event_key(event, &namespaces) {
                    dispatcher.dispatch(key).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "ChartRelease watch error"),
        }
    }

    tracing::warn!("ChartRelease watch stream ended");
    Ok(())
}
