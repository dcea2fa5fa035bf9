// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use berth_cli::daemon::{AgentError, AgentLifecycle, ControlClient, PidRecord, StartOutcome};
use berth_core::domain::config::BerthConfig;
use berth_core::domain::progress::{AgentStatus, ProgressEvent, ProgressSink};
use berth_core::domain::subsystem::ApiListener;
use berth_core::infrastructure::event_bus::EventBus;
use berth_core::presentation::ApiServer;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct StaticPid(Option<u32>);

#[async_trait]
impl PidRecord for StaticPid {
    fn pid(&self) -> Option<u32> {
        self.0
    }

    fn is_running(&self) -> bool {
        self.0.is_some()
    }

    fn update(&self, _pid: u32) -> std::io::Result<()> {
        Ok(())
    }

    async fn kill_and_wait(&self, _timeout: Duration) -> std::io::Result<bool> {
        Ok(true)
    }

    fn unlink(&self) -> std::io::Result<()> {
        Ok(())
    }
}

struct IdleAgent;

#[async_trait]
impl AgentLifecycle for IdleAgent {
    async fn start(
        &self,
        _overrides: BTreeMap<String, Value>,
        _progress: ProgressSink,
    ) -> Result<StartOutcome, AgentError> {
        Ok(StartOutcome::Started { pid: 7 })
    }

    async fn stop(&self, _progress: ProgressSink) -> Result<(), AgentError> {
        Ok(())
    }
}

fn config(dir: &Path) -> BerthConfig {
    let mut config = BerthConfig::default();
    config.paths.api_socket = dir.join("run/api.sock");
    config.paths.agent_pid = dir.join("run/agent.pid");
    config.agent.requires_vm = false;
    config
}

fn client(config: BerthConfig, pid: Option<u32>) -> ControlClient {
    ControlClient::new(config, Arc::new(StaticPid(pid)), Arc::new(IdleAgent))
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_watch_lifecycle_against_agent() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(project.join("lib")).unwrap();
    std::fs::write(project.join("mix.exs"), "").unwrap();
    std::fs::write(project.join("lib/app.ex"), "").unwrap();

    let config = config(dir.path());
    let server = ApiServer::new(EventBus::new(16));
    server.listen(&config).await.unwrap();
    let client = client(config, Some(42));

    let (sink, mut rx) = ProgressSink::channel();
    let opts = json!({"except": ["_build", "deps"]});
    assert!(client
        .watch(&project, "/share/project", opts.clone(), &sink)
        .await
        .unwrap());
    assert_eq!(client.channel().registered(), 0);
    assert_eq!(
        drain(&mut rx),
        vec![
            ProgressEvent::status(AgentStatus::Starting),
            ProgressEvent::Sync {
                status: json!({"files": 2})
            },
        ]
    );

    let watchers = client.watchers().await.unwrap();
    assert_eq!(watchers.len(), 1);
    assert_eq!(watchers[0].guest_folder, "/share/project");
    assert_eq!(watchers[0].files, 2);
    assert_eq!(watchers[0].opts, opts);

    assert!(client.unwatch(&project, None).await.unwrap());
    assert!(client.watchers().await.unwrap().is_empty());

    match client.unwatch(&project, None).await.unwrap_err() {
        AgentError::Rejected { action, message } => {
            assert_eq!(action, "unwatch");
            assert!(message.contains("is not being watched"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    client.close();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_watch_missing_folder_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let server = ApiServer::new(EventBus::new(4));
    server.listen(&config).await.unwrap();
    let client = client(config, Some(42));

    let err = client
        .watch(
            &dir.path().join("nowhere"),
            "/share/nowhere",
            Value::Null,
            &ProgressSink::noop(),
        )
        .await
        .unwrap_err();
    match err {
        AgentError::Rejected { action, message } => {
            assert_eq!(action, "watch");
            assert!(message.contains("does not exist"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(client.channel().registered(), 0);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_require_adopts_agent_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent_config = config(dir.path());
    agent_config.namespace = "devbox".to_string();
    agent_config.docker.run.retry = 25;
    let server = ApiServer::new(EventBus::new(4));
    server.listen(&agent_config).await.unwrap();

    let mut client = client(config(dir.path()), Some(42));
    assert_eq!(client.config().namespace, "berth");

    let (sink, mut rx) = ProgressSink::channel();
    client.require(&sink).await.unwrap();

    assert_eq!(client.config().namespace, "devbox");
    assert_eq!(client.config().docker.run.retry, 25);
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [ProgressEvent::Status {
            status: AgentStatus::Started,
            pid: Some(42),
            ..
        }]
    ));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_require_fails_without_agent() {
    let dir = tempfile::tempdir().unwrap();
    let mut client = client(config(dir.path()), None);

    let (sink, mut rx) = ProgressSink::channel();
    assert!(matches!(
        client.require(&sink).await.unwrap_err(),
        AgentError::NotRunning
    ));
    assert_eq!(drain(&mut rx), vec![ProgressEvent::status(AgentStatus::NotRunning)]);
}

#[tokio::test]
async fn test_start_and_stop_delegate_to_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(config(dir.path()), None);

    let outcome = client
        .start(BTreeMap::new(), ProgressSink::noop())
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::Started { pid: 7 });
    client.stop(ProgressSink::noop()).await.unwrap();
}

#[test]
fn test_ssh_opts_point_at_vm() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.agent.vm.user = "docker".to_string();
    config.agent.vm.ip = "192.168.51.4".to_string();
    config.agent.vm.ssh_key = dir.path().join("keys/id_berth");
    let client = client(config, None);

    let ssh = client.ssh_opts();
    assert_eq!(ssh.url, "docker@192.168.51.4");
    assert_eq!(ssh.opts[0], "-i");
    assert!(ssh.opts[1].ends_with("keys/id_berth"));
    assert!(ssh.opts.contains(&"StrictHostKeyChecking=no".to_string()));
}
