// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use berth_core::application::{
    DaemonOptions, ProvisionOptions, ShellOptions, StopOptions, SystemRunner,
};
use berth_core::domain::config::BerthConfig;
use berth_core::domain::container::Annotations;
use berth_core::domain::progress::{ProgressEvent, ProgressSink};
use berth_core::domain::system::{ImageRef, System, SystemError};
use berth_core::domain::tracker::DisabledTracker;
use berth_core::infrastructure::{ContainerRuntime, InMemoryEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn runner(engine: &Arc<InMemoryEngine>) -> SystemRunner {
    let runtime = ContainerRuntime::new(engine.clone(), Arc::new(DisabledTracker), "berth");
    let mut config = BerthConfig::default();
    config.agent.requires_vm = false;
    config.docker.run.retry = 3;
    config.docker.run.timeout_ms = 50;
    SystemRunner::new(runtime, config)
}

fn web_system() -> System {
    let mut system = System::new("web", ImageRef::new("node", "20"), "/src/web");
    system.manifest_id = "m1".to_string();
    system.command = vec!["npm".to_string(), "start".to_string()];
    system
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_provision_runs_steps_in_one_shell() {
    let engine = Arc::new(InMemoryEngine::new());
    let runner = runner(&engine);
    let mut system = web_system();
    system.provision_steps = vec!["npm install".to_string(), "npm run build".to_string()];

    let ran = runner
        .run_provision(&mut system, ProvisionOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();

    assert!(ran);
    assert!(system.provisioned.is_some());

    let runs = engine.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(
        runs[0].command,
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "( npm install; npm run build )".to_string()
        ]
    );
    assert_eq!(Annotations::decode(&runs[0].name).kind(), Some("shell"));
}

#[tokio::test]
async fn test_provision_is_idempotent_without_force() {
    let engine = Arc::new(InMemoryEngine::new());
    let runner = runner(&engine);
    let mut system = web_system();
    system.provision_steps = vec!["npm install".to_string()];

    runner
        .run_provision(&mut system, ProvisionOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();
    let stamped = system.provisioned;

    let ran = runner
        .run_provision(&mut system, ProvisionOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();

    assert!(!ran);
    assert_eq!(system.provisioned, stamped);
    assert_eq!(engine.runs().len(), 1);
}

#[tokio::test]
async fn test_forced_provision_runs_again() {
    let engine = Arc::new(InMemoryEngine::new());
    let runner = runner(&engine);
    let mut system = web_system();
    system.provision_steps = vec!["npm install".to_string()];

    runner
        .run_provision(&mut system, ProvisionOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();
    let forced = ProvisionOptions {
        force: true,
        ..ProvisionOptions::default()
    };
    assert!(runner
        .run_provision(&mut system, forced, &ProgressSink::noop())
        .await
        .unwrap());
    assert_eq!(engine.runs().len(), 2);
}

#[tokio::test]
async fn test_provision_without_steps_is_noop() {
    let engine = Arc::new(InMemoryEngine::new());
    let runner = runner(&engine);
    let mut system = web_system();

    let ran = runner
        .run_provision(&mut system, ProvisionOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();

    assert!(!ran);
    assert!(system.provisioned.is_none());
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_failed_provision_reports_command_and_output() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.push_shell_exit(2);
    engine.set_default_logs("npm ERR! missing script: build\n");
    let runner = runner(&engine);
    let mut system = web_system();
    system.provision_steps = vec!["npm run build".to_string()];

    let err = runner
        .run_provision(&mut system, ProvisionOptions::default(), &ProgressSink::noop())
        .await
        .unwrap_err();

    match err {
        SystemError::RunCommand { command, output } => {
            assert_eq!(command, "/bin/sh -c ( npm run build )");
            assert!(output.contains("missing script"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(system.provisioned.is_none());
}

#[tokio::test]
async fn test_run_shell_removes_when_asked() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.push_shell_exit(3);
    let runner = runner(&engine);
    let system = web_system();

    let options = ShellOptions {
        remove: true,
        ..ShellOptions::default()
    };
    let result = runner
        .run_shell(&system, vec!["false".to_string()], options, &ProgressSink::noop())
        .await
        .unwrap();

    assert_eq!(result.exit_code, 3);
    assert!(result.removed);
    assert!(engine.container(&result.container_id).is_none());
}

#[tokio::test]
async fn test_run_daemon_waits_for_published_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let engine = Arc::new(InMemoryEngine::new());
    engine.set_published_port(port);
    let runner = runner(&engine);
    let mut system = web_system();
    system.ports = vec!["3000/tcp".to_string()];
    let (sink, mut rx) = ProgressSink::channel();

    let container = runner
        .run_daemon(&mut system, DaemonOptions::default(), &sink)
        .await
        .unwrap();

    assert!(container.state.running);
    assert_eq!(container.annotations.kind(), Some("daemon"));
    assert!(drain(&mut rx).contains(&ProgressEvent::Wait {
        system: "web".to_string(),
        host: "127.0.0.1".to_string(),
        port,
    }));
}

#[tokio::test]
async fn test_run_daemon_reports_exited_service() {
    // Reserve a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let engine = Arc::new(InMemoryEngine::new());
    engine.set_published_port(port);
    engine.set_daemon_exit(Some(1));
    engine.set_default_logs("Error: Cannot find module 'express'\n");
    let runner = runner(&engine);
    let mut system = web_system();
    system.ports = vec!["3000/tcp".to_string()];

    let options = DaemonOptions {
        retry: Some(50),
        timeout: Some(Duration::from_millis(20)),
        ..DaemonOptions::default()
    };
    let started = std::time::Instant::now();
    let err = runner
        .run_daemon(&mut system, options, &ProgressSink::noop())
        .await
        .unwrap_err();

    // The dead container short-circuits the wait long before 50 attempts.
    assert!(started.elapsed() < Duration::from_millis(500));
    match err {
        SystemError::SystemRun {
            system,
            command,
            exit_code,
            log,
            ..
        } => {
            assert_eq!(system, "web");
            assert_eq!(command, "npm start");
            assert_eq!(exit_code, 1);
            assert!(log.contains("Cannot find module"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_run_daemon_provisions_first() {
    let engine = Arc::new(InMemoryEngine::new());
    let runner = runner(&engine);
    let mut system = web_system();
    system.provision_steps = vec!["npm install".to_string()];

    runner
        .run_daemon(&mut system, DaemonOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();

    let kinds: Vec<_> = engine
        .runs()
        .iter()
        .map(|spec| Annotations::decode(&spec.name).kind().map(str::to_string))
        .collect();
    assert_eq!(
        kinds,
        vec![Some("shell".to_string()), Some("daemon".to_string())]
    );
    assert!(system.provisioned.is_some());
}

#[tokio::test]
async fn test_stop_all_instances_last_first() {
    let engine = Arc::new(InMemoryEngine::new());
    let runner = runner(&engine);
    let mut system = web_system();

    let mut started = vec![];
    for _ in 0..3 {
        let container = runner
            .run_daemon(&mut system, DaemonOptions::default(), &ProgressSink::noop())
            .await
            .unwrap();
        started.push(container.id);
    }
    assert_eq!(runner.instances(&system).await.unwrap().len(), 3);

    let (sink, mut rx) = ProgressSink::channel();
    runner
        .stop(&system, vec![], StopOptions::default(), &sink)
        .await
        .unwrap();

    let lifecycle: Vec<_> = engine
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("stop ") || call.starts_with("remove "))
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            format!("stop {}", started[2]),
            format!("remove {}", started[2]),
            format!("stop {}", started[1]),
            format!("remove {}", started[1]),
            format!("stop {}", started[0]),
            format!("remove {}", started[0]),
        ]
    );

    let stopped: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::Stopped { id } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(stopped, vec![started[2].clone(), started[1].clone(), started[0].clone()]);
    assert!(runner.instances(&system).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_all_removes_exited_instance_and_continues() {
    let engine = Arc::new(InMemoryEngine::new());
    let runner = runner(&engine);
    let mut system = web_system();

    let mut started = vec![];
    for _ in 0..3 {
        let container = runner
            .run_daemon(&mut system, DaemonOptions::default(), &ProgressSink::noop())
            .await
            .unwrap();
        started.push(container);
    }

    // The middle instance crashed earlier.
    let crashed = StopOptions {
        kill: true,
        remove: false,
    };
    runner
        .stop(&system, vec![started[1].clone()], crashed, &ProgressSink::noop())
        .await
        .unwrap();

    runner
        .stop(&system, vec![], StopOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();

    let lifecycle: Vec<_> = engine
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("stop ") || call.starts_with("remove "))
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            format!("stop {}", started[2].id),
            format!("remove {}", started[2].id),
            format!("remove {}", started[1].id),
            format!("stop {}", started[0].id),
            format!("remove {}", started[0].id),
        ]
    );
    assert!(runner.instances(&system).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kill_keeps_container_when_not_removing() {
    let engine = Arc::new(InMemoryEngine::new());
    let runner = runner(&engine);
    let mut system = web_system();
    let container = runner
        .run_daemon(&mut system, DaemonOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();

    let (sink, mut rx) = ProgressSink::channel();
    let options = StopOptions {
        kill: true,
        remove: false,
    };
    runner
        .stop(&system, vec![container.clone()], options, &sink)
        .await
        .unwrap();

    let inspect = engine.container(&container.id).unwrap();
    assert!(!inspect.running);
    assert_eq!(
        drain(&mut rx),
        vec![
            ProgressEvent::KillService {
                system: "web".to_string()
            },
            ProgressEvent::Stopped { id: container.id },
        ]
    );
}

#[tokio::test]
async fn test_instances_ignore_other_systems() {
    let engine = Arc::new(InMemoryEngine::new());
    let runner = runner(&engine);
    let mut web = web_system();
    let mut db = System::new("db", ImageRef::new("postgres", "16"), "/src/db");

    runner
        .run_daemon(&mut web, DaemonOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();
    runner
        .run_daemon(&mut db, DaemonOptions::default(), &ProgressSink::noop())
        .await
        .unwrap();

    let instances = runner.instances(&web).await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].annotations.system(), Some("web"));
}
