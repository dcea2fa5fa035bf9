// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use futures::stream::BoxStream;
use metrics::counter;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::container::Container;
use crate::domain::runtime::{ContainerEngine, ImageInfo, PullProgress, RunSpec, RuntimeError};
use crate::domain::tracker::{Tracker, TrackingData};

/// Normalizing wrapper over a [`ContainerEngine`].
///
/// Turns raw engine data into [`Container`] values, scopes listings to the
/// configured namespace and records best-effort telemetry around container
/// lifecycle calls.
#[derive(Clone)]
pub struct ContainerRuntime {
    engine: Arc<dyn ContainerEngine>,
    tracker: Arc<dyn Tracker>,
    namespace: String,
}

impl ContainerRuntime {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        tracker: Arc<dyn Tracker>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            tracker,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `None` when the image is absent; every other failure propagates.
    pub async fn find_image(&self, image: &str) -> Result<Option<ImageInfo>, RuntimeError> {
        match self.engine.inspect_image(image).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `None` when the container is absent; every other failure propagates.
    pub async fn find_container(&self, id: &str) -> Result<Option<Container>, RuntimeError> {
        match self.inspect(id).await {
            Ok(container) => Ok(Some(container)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn inspect(&self, id: &str) -> Result<Container, RuntimeError> {
        let container = Container::from_inspect(self.engine.inspect(id).await?);
        self.track(&container, "inspect").await;
        Ok(container)
    }

    pub fn pull(&self, image: &str) -> BoxStream<'static, Result<PullProgress, RuntimeError>> {
        info!("Pulling image: {}", image);
        counter!("berth_image_pulls_total").increment(1);
        self.engine.pull(image)
    }

    /// Create and start a container, returning its id.
    pub async fn run(&self, spec: RunSpec) -> Result<String, RuntimeError> {
        debug!("Running {} as {}", spec.image, spec.name);
        let id = self.engine.run(spec).await?;
        counter!("berth_containers_started_total").increment(1);
        Ok(id)
    }

    pub async fn stop(&self, container: &Container, timeout: Duration) -> Result<(), RuntimeError> {
        self.engine.stop(&container.id, timeout).await?;
        counter!("berth_containers_stopped_total").increment(1);
        self.track(container, "stop").await;
        Ok(())
    }

    pub async fn kill(&self, container: &Container) -> Result<(), RuntimeError> {
        self.engine.kill(&container.id).await?;
        counter!("berth_containers_killed_total").increment(1);
        self.track(container, "kill").await;
        Ok(())
    }

    pub async fn remove(&self, container: &Container, force: bool) -> Result<(), RuntimeError> {
        self.engine.remove(&container.id, force).await?;
        self.track(container, "remove").await;
        Ok(())
    }

    /// Containers whose name is scoped to this runtime's namespace.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<Container>, RuntimeError> {
        let scope = Regex::new(&format!("^/?{}_", regex::escape(&self.namespace)))
            .map_err(|e| RuntimeError::engine("list_containers", e))?;

        let containers = self
            .engine
            .list_containers(all)
            .await?
            .into_iter()
            .filter(|summary| summary.names.iter().any(|name| scope.is_match(name)))
            .map(Container::from_summary)
            .collect();
        Ok(containers)
    }

    pub async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        self.engine.logs(id).await
    }

    async fn track(&self, container: &Container, action: &str) {
        if !self.tracker.check_permission().await {
            return;
        }

        let data = TrackingData::for_container(container, action);
        match self.tracker.track("container", &data).await {
            Ok(0) => {}
            Ok(code) => warn!("Tracking {} of {} rejected with code {}", action, container.id, code),
            Err(e) => warn!("Tracking {} of {} failed: {}", action, container.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::runtime::{ContainerInspect, ContainerSummary};
    use crate::domain::tracker::DisabledTracker;
    use crate::infrastructure::memory_engine::InMemoryEngine;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingTracker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tracker for FailingTracker {
        async fn check_permission(&self) -> bool {
            true
        }

        async fn track(&self, _kind: &str, _data: &TrackingData) -> anyhow::Result<i32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("telemetry endpoint unreachable")
        }
    }

    fn summary(id: &str, name: &str) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            names: vec![name.to_string()],
            image: "node:20".to_string(),
            status: "Up 5 seconds".to_string(),
            ports: vec![],
        }
    }

    #[tokio::test]
    async fn test_find_container_maps_not_found_to_none() {
        let engine = Arc::new(InMemoryEngine::new());
        let runtime = ContainerRuntime::new(engine, Arc::new(DisabledTracker), "berth");
        assert!(runtime.find_container("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_container_propagates_other_errors() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.fail_next("inspect", RuntimeError::Connection("socket closed".to_string()));
        let runtime = ContainerRuntime::new(engine, Arc::new(DisabledTracker), "berth");

        let err = runtime.find_container("abc").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Connection(_)));
    }

    #[tokio::test]
    async fn test_find_image_absent() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.add_image("redis:latest");
        let runtime = ContainerRuntime::new(engine, Arc::new(DisabledTracker), "berth");

        assert!(runtime.find_image("redis:latest").await.unwrap().is_some());
        assert!(runtime.find_image("postgres:16").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tracking_failure_does_not_fail_stop() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.insert_container(ContainerInspect {
            id: "c1".to_string(),
            name: "/berth_sys.web_type.daemon_uid.0000000001".to_string(),
            running: true,
            ..ContainerInspect::default()
        });
        let tracker = Arc::new(FailingTracker {
            calls: AtomicUsize::new(0),
        });
        let runtime = ContainerRuntime::new(engine.clone(), tracker.clone(), "berth");

        let container = runtime.inspect("c1").await.unwrap();
        runtime
            .stop(&container, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(tracker.calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.calls(), vec!["inspect c1", "stop c1"]);
    }

    #[tokio::test]
    async fn test_list_containers_scoped_to_namespace() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.add_summary(summary("a", "/berth_sys.web_uid.0000000001"));
        engine.add_summary(summary("b", "/other_sys.web_uid.0000000002"));
        engine.add_summary(summary("c", "/berthx_sys.web_uid.0000000003"));
        let runtime = ContainerRuntime::new(engine, Arc::new(DisabledTracker), "berth");

        let containers = runtime.list_containers(true).await.unwrap();
        let ids: Vec<_> = containers.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(containers[0].annotations.system(), Some("web"));
        assert!(containers[0].state.running);
    }
}
