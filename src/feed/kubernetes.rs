//! Pod watcher backed by the Kubernetes API.
//!
//! The service account the replica runs as needs list/watch access to pods
//! in its own namespace.

use async_trait::async_trait;
use futures::{pin_mut, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{api::Api, runtime::watcher, Client, Config};
use tracing::info;

use super::{ChangeKind, FeedEvent, PodEvent, PodWatcher};
use crate::{
    config::KubernetesConfig,
    error::{ClusterError, Result},
};

pub struct KubernetesPodWatcher {
    pods: Api<Pod>,
    label_selector: String,
    timeout_secs: u32,
}

impl KubernetesPodWatcher {
    /// Connects using in-cluster configuration, falling back to the local
    /// kubeconfig.
    pub async fn connect(config: &KubernetesConfig) -> Result<Self> {
        let mut client_config = Config::infer()
            .await
            .map_err(|e| ClusterError::orchestrator(e.to_string()))?;
        client_config.connect_timeout = Some(config.connect_timeout());
        client_config.read_timeout = Some(config.read_timeout());
        let client = Client::try_from(client_config)
            .map_err(|e| ClusterError::orchestrator(e.to_string()))?;
        info!(namespace = %config.namespace, selector = %config.label_selector, "connected to kubernetes");
        Ok(Self::new(client, config))
    }

    pub fn new(client: Client, config: &KubernetesConfig) -> Self {
        // The server must close the watch before the client read timeout fires.
        let timeout_secs = (config.read_timeout().as_secs().saturating_sub(10)).clamp(1, 290) as u32;
        Self {
            pods: Api::namespaced(client, &config.namespace),
            label_selector: config.label_selector.clone(),
            timeout_secs,
        }
    }
}

#[async_trait]
impl PodWatcher for KubernetesPodWatcher {
    async fn watch(&self, on_event: &mut (dyn FnMut(FeedEvent) + Send)) -> Result<()> {
        let mut config = watcher::Config::default().timeout(self.timeout_secs);
        if !self.label_selector.is_empty() {
            config = config.labels(&self.label_selector);
        }

        // every new watcher lists the current pods before it starts watching
        let events = watcher(self.pods.clone(), config);
        pin_mut!(events);

        while let Some(event) = events
            .try_next()
            .await
            .map_err(|e| ClusterError::orchestrator(e.to_string()))?
        {
            match event {
                watcher::Event::Init => on_event(FeedEvent::ListStarted),
                watcher::Event::InitApply(pod) => {
                    on_event(FeedEvent::Pod(pod_event(ChangeKind::Added, &pod)))
                }
                watcher::Event::InitDone => on_event(FeedEvent::ListDone),
                watcher::Event::Apply(pod) => {
                    on_event(FeedEvent::Pod(pod_event(ChangeKind::Modified, &pod)))
                }
                watcher::Event::Delete(pod) => {
                    on_event(FeedEvent::Pod(pod_event(ChangeKind::Deleted, &pod)))
                }
            }
        }
        Ok(())
    }
}

fn pod_event(kind: ChangeKind, pod: &Pod) -> PodEvent {
    let status = pod.status.as_ref();
    PodEvent {
        kind,
        name: pod.metadata.name.clone().unwrap_or_default(),
        ip_address: status.and_then(|s| s.pod_ip.clone()),
        containers_ready: status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| statuses.iter().map(|c| c.ready).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::core::v1::{ContainerStatus, PodStatus},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    fn pod(name: &str, ip: Option<&str>, ready: &[bool]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                container_statuses: Some(
                    ready
                        .iter()
                        .map(|r| ContainerStatus {
                            ready: *r,
                            ..ContainerStatus::default()
                        })
                        .collect(),
                ),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn converts_pod_status() {
        let event = pod_event(ChangeKind::Modified, &pod("a", Some("10.0.0.2"), &[true, true]));
        assert_eq!(event.name, "a");
        assert!(event.is_ready());

        let event = pod_event(ChangeKind::Modified, &pod("a", Some("10.0.0.2"), &[true, false]));
        assert!(!event.is_ready());

        let pending = Pod {
            metadata: ObjectMeta {
                name: Some("b".to_string()),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        };
        assert!(!pod_event(ChangeKind::Added, &pending).is_ready());
    }
}
