use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::{watcher, Config, Event};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use mlops_api::consts::TEARDOWN_FINALIZER;

use crate::client::ApiClient;
use crate::consts::{BACKOFF_BASE, BACKOFF_CAP, MAX_RETRIES};
use crate::diff::Diff;
use crate::error::{Result, Severity};
use crate::resources::merge_finalizers;

/// Reconciliation bindings of one custom kind. Not every kind binds every
/// event: user-created EndpointConfig and Model objects stay dormant, so
/// their `created` is a no-op.
#[async_trait]
pub(crate) trait EventHandler<K>: Send + Sync {
    /// First sight of an object
    async fn created(&self, object: &K) -> Result<()>;
    /// A later revision with a non-empty structured diff
    async fn updated(&self, object: &K, diff: &Diff) -> Result<()>;
    /// Collaborator teardown, dispatched while deletion is finalizer-gated
    async fn deleted(&self, object: &K) -> Result<()>;
    /// Object seen again after a watch restart
    async fn resumed(&self, _object: &K) -> Result<()> {
        Ok(())
    }
    /// Object permanently gone from the cluster
    async fn purged(&self, _object: &K) {}
    /// Whether a non-operator finalizer token belongs to this controller
    fn owns_finalizer(&self, _token: &str) -> bool {
        false
    }
    /// Whether an owned breadcrumb finalizer may be cleared yet
    async fn finalizer_cleared(&self, _token: &str, _namespace: &str) -> Result<bool> {
        Ok(true)
    }
    /// Drop the released finalizer tokens from the object metadata
    async fn clear_finalizers(&self, object: &K, tokens: &[String]) -> Result<()>;
    /// Record a permanent failure on the object status
    async fn mark_failed(&self, _object: &K) {}
}

/// Event binding being dispatched
#[derive(Clone, Copy)]
enum Binding<'a> {
    /// Create binding
    Created,
    /// Update binding with its structured diff
    Updated(&'a Diff),
    /// Delete binding
    Deleted,
}

/// Store key of an object
fn object_key<K>(object: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!(
        "{}/{}",
        object.namespace().unwrap_or_default(),
        object.name_any()
    )
}

/// Drive one kind's watch stream forever, dispatching bindings with retry
/// classification. Events of a kind are handled sequentially, which
/// serialises reconciliation per object.
pub(crate) async fn run<K, H>(api: Api<K>, client: ApiClient, handler: H)
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
    H: EventHandler<K>,
{
    let mut store: HashMap<String, K> = HashMap::new();
    loop {
        let mut stream = watcher(api.clone(), Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Applied(object)) => {
                    handle_applied(&client, &handler, &mut store, object).await;
                }
                Ok(Event::Deleted(object)) => {
                    handle_deleted(&handler, &mut store, &object).await;
                }
                Ok(Event::Restarted(objects)) => {
                    handle_restarted(&client, &handler, &mut store, objects).await;
                }
                Err(err) => warn!("watch stream error: {err}"),
            }
        }
        warn!("watch stream closed, restarting");
    }
}

/// Dispatch one binding with exponential backoff on retryable failures.
/// Returns whether the handler eventually succeeded.
async fn dispatch<K, H>(handler: &H, object: &K, binding: Binding<'_>) -> bool
where
    K: Resource<DynamicType = ()> + Send + Sync,
    H: EventHandler<K>,
{
    let mut delay = BACKOFF_BASE;
    for attempt in 0..MAX_RETRIES {
        let result = match binding {
            Binding::Created => handler.created(object).await,
            Binding::Updated(diff) => handler.updated(object, diff).await,
            Binding::Deleted => handler.deleted(object).await,
        };
        match result {
            Ok(()) => return true,
            Err(err) => match err.severity() {
                Severity::Retry => {
                    warn!(
                        "reconciliation of {} failed on attempt {attempt}: {err}, retrying in {delay:?}",
                        object.name_any()
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
                Severity::Permanent => {
                    error!(
                        "reconciliation of {} failed permanently: {err}",
                        object.name_any()
                    );
                    handler.mark_failed(object).await;
                    return false;
                }
                Severity::Ignore => {
                    info!("reconciliation of {} skipped: {err}", object.name_any());
                    return true;
                }
            },
        }
    }
    warn!(
        "giving up on {} until its next revision",
        object.name_any()
    );
    false
}

/// Classify an applied revision into create, update or finalizer-gated
/// delete, and dispatch accordingly
async fn handle_applied<K, H>(
    client: &ApiClient,
    handler: &H,
    store: &mut HashMap<String, K>,
    object: K,
) where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync,
    H: EventHandler<K>,
{
    let key = object_key(&object);
    if object.meta().deletion_timestamp.is_some() {
        finalize(handler, store, &object).await;
        return;
    }
    match store.insert(key.clone(), object.clone()) {
        None => {
            if let Err(err) = ensure_finalizer(client, &object).await {
                warn!("failed to add finalizer to {key}: {err}");
            }
            debug!("dispatching create of {key}");
            let _handled = dispatch(handler, &object, Binding::Created).await;
        }
        Some(previous) => {
            let diff = Diff::between(&previous, &object);
            if diff.is_empty() {
                return;
            }
            debug!("dispatching update of {key}");
            let _handled = dispatch(handler, &object, Binding::Updated(&diff)).await;
        }
    }
}

/// Run the delete binding for a terminating object, then clear the
/// operator finalizer plus any released breadcrumbs. Breadcrumbs whose
/// successor is not yet available stay put, keeping the object gated.
async fn finalize<K, H>(handler: &H, store: &mut HashMap<String, K>, object: &K)
where
    K: Resource<DynamicType = ()> + Send + Sync,
    H: EventHandler<K>,
{
    let key = object_key(object);
    debug!("dispatching finalizer-gated delete of {key}");
    if !dispatch(handler, object, Binding::Deleted).await {
        // teardown failed, the finalizer keeps the object for a retry
        return;
    }
    let namespace = object.namespace().unwrap_or_default();
    let finalizers = object.meta().finalizers.clone().unwrap_or_default();
    let mut removable = Vec::new();
    let mut delay = BACKOFF_BASE;
    for _attempt in 0..MAX_RETRIES {
        removable.clear();
        let mut gated = false;
        for token in &finalizers {
            if token == TEARDOWN_FINALIZER {
                removable.push(token.clone());
            } else if handler.owns_finalizer(token) {
                match handler.finalizer_cleared(token, &namespace).await {
                    Ok(true) => removable.push(token.clone()),
                    Ok(false) => {
                        debug!("finalizer {token} on {key} is still gated");
                        gated = true;
                    }
                    Err(err) => {
                        warn!("failed to check finalizer {token} on {key}: {err}");
                        gated = true;
                    }
                }
            }
        }
        if !gated {
            break;
        }
        sleep(delay).await;
        delay = (delay * 2).min(BACKOFF_CAP);
    }
    if !removable.is_empty() {
        if let Err(err) = handler.clear_finalizers(object, &removable).await {
            warn!("failed to clear finalizers on {key}: {err}");
        }
    }
    let _previous = store.remove(&key);
}

/// Final word on an object: a last idempotent teardown pass and daemon
/// cleanup once the cluster has actually dropped it
async fn handle_deleted<K, H>(handler: &H, store: &mut HashMap<String, K>, object: &K)
where
    K: Resource<DynamicType = ()> + Send + Sync,
    H: EventHandler<K>,
{
    let key = object_key(object);
    debug!("{key} is gone");
    let _handled = dispatch(handler, object, Binding::Deleted).await;
    handler.purged(object).await;
    let _previous = store.remove(&key);
}

/// Rebuild the store after a watch restart. No bindings are dispatched;
/// convergence happens on the next real edit.
async fn handle_restarted<K, H>(
    client: &ApiClient,
    handler: &H,
    store: &mut HashMap<String, K>,
    objects: Vec<K>,
) where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync,
    H: EventHandler<K>,
{
    store.clear();
    for object in objects {
        let key = object_key(&object);
        if object.meta().deletion_timestamp.is_some() {
            finalize(handler, store, &object).await;
            continue;
        }
        if let Err(err) = ensure_finalizer(client, &object).await {
            warn!("failed to add finalizer to {key}: {err}");
        }
        if let Err(err) = handler.resumed(&object).await {
            warn!("resume of {key} failed: {err}");
        }
        let _previous = store.insert(key, object);
    }
}

/// Make sure the operator finalizer gates this object's deletion
async fn ensure_finalizer<K>(client: &ApiClient, object: &K) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize,
{
    let finalizers = object.meta().finalizers.clone();
    if finalizers
        .as_ref()
        .map_or(false, |tokens| tokens.iter().any(|t| t == TEARDOWN_FINALIZER))
    {
        return Ok(());
    }
    let merged = merge_finalizers(finalizers.as_ref(), &[TEARDOWN_FINALIZER.to_owned()]);
    let _patched: K = client
        .patch_namespaced(
            &object.name_any(),
            &object.namespace().unwrap_or_default(),
            &json!({"metadata": {"finalizers": merged}}),
        )
        .await?;
    Ok(())
}
