use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use log::warn;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::registry::BackendEndpoint;

use super::{Error, Provider};

const MODEL_LABEL: &str = "llm-router/model";
const MODEL_TYPE_LABEL: &str = "llm-router/model-type";
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Pod-listing discovery. The model name and (optional) model type are
/// read from pod labels; a pod missing the model label is skipped with
/// a warning rather than failing the whole refresh. The last good
/// snapshot is served while a refresh is in backoff.
pub struct ClusterProvider {
    snapshot: Arc<RwLock<Arc<Vec<BackendEndpoint>>>>,
    shutdown: Arc<Notify>,
}

impl ClusterProvider {
    /// Connects to the in-cluster (or kubeconfig) API, performs one
    /// blocking initial list, and spawns the background refresh loop.
    /// The initial list failing is treated as an unrecoverable startup
    /// discovery error by the caller.
    pub async fn connect(namespace: &str, label_selector: &str, port: u16) -> Result<Self, Error> {
        let client = Client::try_default().await?;
        let initial = list_ready_pods(&client, namespace, label_selector, port).await?;
        let snapshot = Arc::new(RwLock::new(Arc::new(initial)));
        let shutdown = Arc::new(Notify::new());

        let task_snapshot = snapshot.clone();
        let task_shutdown = shutdown.clone();
        let namespace = namespace.to_string();
        let label_selector = label_selector.to_string();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                tokio::select! {
                    _ = sleep(REFRESH_INTERVAL) => {}
                    _ = task_shutdown.notified() => {
                        break;
                    }
                }
                match list_ready_pods(&client, &namespace, &label_selector, port).await {
                    Ok(pods) => {
                        *task_snapshot.write() = Arc::new(pods);
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        warn!(
                            "cluster discovery refresh failed, retrying in {:?}: {}",
                            backoff, e
                        );
                        tokio::select! {
                            _ = sleep(backoff) => {}
                            _ = task_shutdown.notified() => break,
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });

        Ok(ClusterProvider { snapshot, shutdown })
    }
}

impl Provider for ClusterProvider {
    fn list(&self) -> Arc<Vec<BackendEndpoint>> {
        self.snapshot.read().clone()
    }
}

/// A config reload replaces the whole `ClusterProvider` rather than
/// mutating it; dropping the old one stops its background pod-watch
/// task instead of leaking it to poll a namespace nothing routes to
/// anymore.
impl Drop for ClusterProvider {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

async fn list_ready_pods(
    client: &Client,
    namespace: &str,
    label_selector: &str,
    port: u16,
) -> Result<Vec<BackendEndpoint>, Error> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(label_selector);
    let pods = api.list(&lp).await?;

    let mut endpoints = Vec::new();
    for pod in pods.items {
        if !pod_is_running_and_ready(&pod) {
            continue;
        }
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let model = match labels.get(MODEL_LABEL) {
            Some(m) => m.clone(),
            None => {
                let name = pod.metadata.name.clone().unwrap_or_default();
                warn!("pod {} has no {} label, skipping", name, MODEL_LABEL);
                continue;
            }
        };
        let model_type = labels
            .get(MODEL_TYPE_LABEL)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let pod_ip = match pod.status.as_ref().and_then(|s| s.pod_ip.clone()) {
            Some(ip) => ip,
            None => continue,
        };
        let url = format!("http://{}:{}", pod_ip, port);
        endpoints.push(
            BackendEndpoint::new(url, model)
                .with_model_type(model_type)
                .with_labels(labels),
        );
    }
    Ok(endpoints)
}

fn pod_is_running_and_ready(pod: &Pod) -> bool {
    let status = match &pod.status {
        Some(s) => s,
        None => return false,
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pod_without_status_is_not_ready() {
        let pod = Pod::default();
        assert!(!pod_is_running_and_ready(&pod));
    }
}
