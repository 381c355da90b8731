// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cluster backend: one pod per command.
//!
//! The backend is a thin sender of [`ControllerReq`]s; the [`Controller`]
//! owns the cluster client, creates pods and watches them to termination.
//! Abnormal exits (image pull failures, crash loops) leave the pod in place
//! for inspection; normal exits delete it.

use crate::error::EngineError;
use crate::messages::{Backend, ControllerMsg, ControllerReq};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, Pod, PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, PostParams};
use muster_core::{ItemKey, Requirements};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Cluster backend configuration. All per-instance; nothing here is
/// process-global.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub namespace: String,
    /// Image runner pods use.
    pub image: String,
    /// Name of the post-creation script config map, also the mounted
    /// script's basename. A deployment-supplied config map name replaces
    /// the default on this instance only.
    pub script_name: String,
    /// Where the script volume mounts inside the pod.
    pub script_mount: String,
    /// How often pod phase is polled.
    pub poll_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image: "ubuntu:latest".to_string(),
            script_name: "muster-default".to_string(),
            script_mount: "/scripts".to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl ClusterConfig {
    /// Use a deployment-provided config map in place of the default script.
    pub fn with_config_map(mut self, name: impl Into<String>) -> Self {
        self.script_name = name.into();
        self
    }
}

/// The driver-side half of the cluster mode.
pub struct ClusterBackend {
    req_tx: mpsc::Sender<ControllerReq>,
    pending_feasibility: Mutex<HashMap<u64, oneshot::Sender<bool>>>,
    next_id: AtomicU64,
}

impl ClusterBackend {
    pub fn new(req_tx: mpsc::Sender<ControllerReq>) -> Self {
        Self {
            req_tx,
            pending_feasibility: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    /// One at a time: the controller spawns a pod per dispatch, so "fits"
    /// is a feasibility question, not a capacity count.
    async fn can_fit(&self, req: &Requirements) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_feasibility.lock().insert(id, reply_tx);

        let sent = self
            .req_tx
            .send(ControllerReq::Feasibility { id, req: req.clone() })
            .await;
        if sent.is_err() {
            self.pending_feasibility.lock().remove(&id);
            return 0;
        }

        match reply_rx.await {
            Ok(true) => 1,
            _ => 0,
        }
    }

    async fn dispatch(
        &self,
        key: ItemKey,
        cmd: String,
        req: Requirements,
    ) -> Result<(), EngineError> {
        self.req_tx
            .send(ControllerReq::Spawn { key, cmd, req })
            .await
            .map_err(|_| EngineError::ControllerGone)
    }

    async fn cancel(&self, key: &ItemKey) -> Result<(), EngineError> {
        self.req_tx
            .send(ControllerReq::Cancel { key: key.clone() })
            .await
            .map_err(|_| EngineError::ControllerGone)
    }

    fn absorb(&self, msg: &ControllerMsg) -> bool {
        if let ControllerMsg::FeasibilityReply { id, feasible } = msg {
            if let Some(reply) = self.pending_feasibility.lock().remove(id) {
                let _ = reply.send(*feasible);
            }
            return true;
        }
        false
    }
}

/// How far along a watched pod is.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PodProgress {
    Running,
    Succeeded,
    Failed(String),
}

/// Watches pod lifecycle on behalf of the driver.
pub struct Controller {
    client: kube::Client,
    config: ClusterConfig,
    msg_tx: mpsc::Sender<ControllerMsg>,
    req_rx: mpsc::Receiver<ControllerReq>,
    pods: Arc<Mutex<HashMap<ItemKey, String>>>,
}

impl Controller {
    pub fn new(
        client: kube::Client,
        config: ClusterConfig,
        msg_tx: mpsc::Sender<ControllerMsg>,
        req_rx: mpsc::Receiver<ControllerReq>,
    ) -> Self {
        Self { client, config, msg_tx, req_rx, pods: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Serve requests until the driver hangs up.
    pub async fn run(mut self) {
        while let Some(req) = self.req_rx.recv().await {
            match req {
                ControllerReq::Feasibility { id, req } => {
                    let feasible = self.feasible(&req).await;
                    let _ = self
                        .msg_tx
                        .send(ControllerMsg::FeasibilityReply { id, feasible })
                        .await;
                }
                ControllerReq::Spawn { key, cmd, req } => {
                    self.spawn_pod(key, cmd, req).await;
                }
                ControllerReq::Cancel { key } => {
                    let pod_name = self.pods.lock().remove(&key);
                    if let Some(name) = pod_name {
                        let pods: Api<Pod> =
                            Api::namespaced(self.client.clone(), &self.config.namespace);
                        if let Err(e) = pods.delete(&name, &DeleteParams::default()).await {
                            tracing::warn!(pod = %name, error = %e, "failed to delete pod on cancel");
                        }
                    }
                }
            }
        }
        tracing::debug!("controller request channel closed, stopping");
    }

    /// Whether any node could ever run a pod with these requirements.
    async fn feasible(&self, req: &Requirements) -> bool {
        use k8s_openapi::api::core::v1::Node;
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = match nodes.list(&Default::default()).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "node listing failed during feasibility check");
                return false;
            }
        };

        let need_millicores = u64::from(req.cores) * 1000;
        let need_mb = u64::from(req.ram_mb);
        list.items.iter().any(|node| {
            let Some(alloc) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) else {
                return false;
            };
            let cpu_ok = alloc
                .get("cpu")
                .and_then(|q| parse_cpu_millicores(&q.0))
                .is_some_and(|have| have >= need_millicores);
            let mem_ok = need_mb == 0
                || alloc
                    .get("memory")
                    .and_then(|q| parse_memory_mb(&q.0))
                    .is_some_and(|have| have >= need_mb);
            cpu_ok && mem_ok
        })
    }

    async fn spawn_pod(&self, key: ItemKey, cmd: String, req: Requirements) {
        let pod_name = format!("muster-run-{}", &key.as_str()[..key.as_str().len().min(12)]);
        let pod = build_pod(&pod_name, &cmd, &req, &self.config);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);

        tracing::info!(key = %key, pod = %pod_name, "creating runner pod");
        if let Err(e) = pods.create(&PostParams::default(), &pod).await {
            let _ = self
                .msg_tx
                .send(ControllerMsg::PodTerminated {
                    key,
                    normal: false,
                    error: Some(format!("pod creation failed: {}", e)),
                })
                .await;
            return;
        }
        self.pods.lock().insert(key.clone(), pod_name.clone());

        let msg_tx = self.msg_tx.clone();
        let poll = self.config.poll_interval;
        let registry = Arc::clone(&self.pods);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                let progress = match pods.get(&pod_name).await {
                    Ok(pod) => classify_pod(&pod),
                    Err(kube::Error::Api(e)) if e.code == 404 => {
                        PodProgress::Failed("pod disappeared".to_string())
                    }
                    Err(e) => {
                        tracing::debug!(pod = %pod_name, error = %e, "pod poll failed");
                        continue;
                    }
                };
                match progress {
                    PodProgress::Running => continue,
                    PodProgress::Succeeded => {
                        // normal termination: the pod has nothing left to say
                        if let Err(e) = pods.delete(&pod_name, &DeleteParams::default()).await {
                            tracing::warn!(pod = %pod_name, error = %e, "failed to delete finished pod");
                        }
                        registry.lock().remove(&key);
                        let _ = msg_tx
                            .send(ControllerMsg::PodTerminated { key, normal: true, error: None })
                            .await;
                        return;
                    }
                    PodProgress::Failed(reason) => {
                        // leave the pod for inspection
                        tracing::warn!(pod = %pod_name, reason, "pod died abnormally");
                        registry.lock().remove(&key);
                        let _ = msg_tx
                            .send(ControllerMsg::PodTerminated {
                                key,
                                normal: false,
                                error: Some(reason),
                            })
                            .await;
                        return;
                    }
                }
            }
        });
    }
}

/// Build the runner pod: the post-creation script config map mounted under
/// the script mount, then the command run under bash.
fn build_pod(name: &str, cmd: &str, req: &Requirements, config: &ClusterConfig) -> Pod {
    let mut requests = std::collections::BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(format!("{}m", u64::from(req.cores) * 1000)));
    if req.ram_mb > 0 {
        requests.insert("memory".to_string(), Quantity(format!("{}Mi", req.ram_mb)));
    }
    if req.disk_gb > 0 {
        requests.insert(
            "ephemeral-storage".to_string(),
            Quantity(format!("{}Gi", req.disk_gb)),
        );
    }

    let script = format!("{}/{}.sh", config.script_mount, config.script_name);
    let shell_cmd = format!("if [ -f {script} ]; then . {script}; fi && {cmd}");

    let container = Container {
        name: "runner".to_string(),
        image: Some(config.image.clone()),
        command: Some(vec!["/bin/bash".to_string(), "-c".to_string(), shell_cmd]),
        resources: Some(ResourceRequirements { requests: Some(requests), ..Default::default() }),
        volume_mounts: Some(vec![VolumeMount {
            name: "script".to_string(),
            mount_path: config.script_mount.clone(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(config.namespace.clone()),
            labels: Some(
                [("app".to_string(), "muster-runner".to_string())].into_iter().collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(vec![Volume {
                name: "script".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config.script_name.clone(),
                    optional: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Decide where a watched pod stands. Waiting reasons that can never
/// resolve on their own (bad image, crash looping) count as failure.
fn classify_pod(pod: &Pod) -> PodProgress {
    let Some(status) = pod.status.as_ref() else {
        return PodProgress::Running;
    };

    if let Some(statuses) = status.container_statuses.as_ref() {
        for cs in statuses {
            if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                if let Some(reason) = waiting.reason.as_deref() {
                    if matches!(reason, "ImagePullBackOff" | "ErrImagePull" | "CrashLoopBackOff")
                    {
                        return PodProgress::Failed(format!(
                            "container {} stuck: {}",
                            cs.name, reason
                        ));
                    }
                }
            }
        }
    }

    match status.phase.as_deref() {
        Some("Succeeded") => PodProgress::Succeeded,
        Some("Failed") => PodProgress::Failed(
            status.reason.clone().unwrap_or_else(|| "pod failed".to_string()),
        ),
        _ => PodProgress::Running,
    }
}

/// Parse a Kubernetes cpu quantity ("4", "3500m") into millicores.
fn parse_cpu_millicores(q: &str) -> Option<u64> {
    if let Some(milli) = q.strip_suffix('m') {
        return milli.parse().ok();
    }
    q.parse::<u64>().ok().map(|cores| cores * 1000)
}

/// Parse a Kubernetes memory quantity ("16Gi", "16384Mi", "2048Ki", plain
/// bytes) into MB.
fn parse_memory_mb(q: &str) -> Option<u64> {
    if let Some(v) = q.strip_suffix("Ki") {
        return v.parse::<u64>().ok().map(|n| n >> 10);
    }
    if let Some(v) = q.strip_suffix("Mi") {
        return v.parse::<u64>().ok();
    }
    if let Some(v) = q.strip_suffix("Gi") {
        return v.parse::<u64>().ok().map(|n| n << 10);
    }
    if let Some(v) = q.strip_suffix("Ti") {
        return v.parse::<u64>().ok().map(|n| n << 20);
    }
    q.parse::<u64>().ok().map(|bytes| bytes >> 20)
}

#[cfg(test)]
#[path = "cluster_tests.rs"]
mod tests;
