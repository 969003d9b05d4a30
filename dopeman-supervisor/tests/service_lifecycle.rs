mod common;

use common::{
    TestContext, all_free_allocator, pid_alive, read_pid, taken_allocator, wait_for_condition,
};
use dopeman_supervisor::{
    Error, ExitState, LaunchCommand, PortAssignment, PortRange, ProcessHandle, ServiceState,
    ServiceSupervisor, SupervisorPhase,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn assignment() -> PortAssignment {
    PortAssignment {
        http_port: 8891,
        web_socket_port: 8892,
    }
}

#[tokio::test]
async fn test_start_all_reaches_ready_in_order() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let mut supervisor = ServiceSupervisor::from_config(&ctx.config())
        .unwrap()
        .with_allocator(all_free_allocator());
    let names: Vec<_> = supervisor.service_names().map(str::to_string).collect();
    assert_eq!(names, vec!["http", "websocket"]);

    let ports = tokio::time::timeout(TEST_TIMEOUT, supervisor.start_all(assignment()))
        .await
        .expect("start_all timed out")
        .unwrap();

    assert_eq!(ports, assignment());
    assert_eq!(supervisor.ports(), Some(assignment()));
    assert_eq!(supervisor.phase(), SupervisorPhase::Running);
    assert_eq!(supervisor.service_state("http"), Some(ServiceState::Ready));
    assert_eq!(supervisor.service_state("websocket"), Some(ServiceState::Ready));
    assert_eq!(ctx.recorded_port("http.port"), Some(8891));
    assert_eq!(ctx.recorded_port("ws.port"), Some(8892));
    assert_eq!(supervisor.tracked_count(), 2);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_stop_all_is_idempotent() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let mut supervisor = ServiceSupervisor::from_config(&ctx.config()).unwrap();
    supervisor.start_all(assignment()).await.unwrap();
    let pids: Vec<_> = ["http", "websocket"]
        .iter()
        .map(|name| supervisor.pid(name).unwrap() as i32)
        .collect();

    supervisor.stop_all().await;
    assert_eq!(supervisor.tracked_count(), 0);
    assert_eq!(supervisor.phase(), SupervisorPhase::Stopped);
    assert_eq!(supervisor.ports(), None);
    for pid in pids {
        assert!(!pid_alive(pid), "process {pid} survived stop_all");
    }

    supervisor.stop_all().await;
    assert_eq!(supervisor.tracked_count(), 0);
    assert_eq!(supervisor.service_state("http"), Some(ServiceState::Stopped));
}

#[tokio::test]
async fn test_failed_second_spawn_rolls_back_first() {
    let ctx = TestContext::new();
    ctx.create_script(
        "http.sh",
        "#!/bin/sh\necho $$ > http.pid\necho 'Serving HTTP' >&2\nexec sleep 60\n",
    )
    .await;

    let config = ctx.config();
    let mut specs = config.service_specs().unwrap();
    specs[1].command = ctx
        .temp_dir
        .path()
        .join("missing-interpreter")
        .display()
        .to_string();

    let mut supervisor = ServiceSupervisor::new(specs).with_grace_period(config.grace_period());
    let err = supervisor.start_all(assignment()).await.unwrap_err();

    assert!(matches!(err, Error::SpawnFailed { ref name, .. } if name == "websocket"));
    let http_pid = read_pid(&ctx.commands_dir.join("http.pid")).expect("http service never ran");
    assert!(!pid_alive(http_pid), "first service survived the rollback");
    assert_eq!(supervisor.tracked_count(), 0);
    assert_eq!(supervisor.phase(), SupervisorPhase::Stopped);

    let err = supervisor.start_all(assignment()).await.unwrap_err();
    assert!(matches!(err, Error::SupervisorStopped));
}

#[tokio::test]
async fn test_lost_port_moves_to_next_free_port() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let mut config = ctx.config();
    config
        .websocket
        .env
        .insert("BLOCKED_PORT".to_string(), "8892".to_string());

    let mut supervisor = ServiceSupervisor::from_config(&config)
        .unwrap()
        .with_allocator(taken_allocator(&[8892]));
    let ports = supervisor.start_all(assignment()).await.unwrap();

    assert_eq!(
        ports,
        PortAssignment {
            http_port: 8891,
            web_socket_port: 8893,
        }
    );
    assert_eq!(ctx.recorded_port("ws.port"), Some(8893));
    assert_eq!(supervisor.ports(), Some(ports));
    assert_eq!(supervisor.tracked_count(), 2);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_retry_skips_port_held_by_other_service() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let mut config = ctx.config();
    config
        .websocket
        .env
        .insert("BLOCKED_PORT".to_string(), "8891".to_string());

    let mut supervisor = ServiceSupervisor::from_config(&config)
        .unwrap()
        .with_allocator(taken_allocator(&[8891]));
    let ports = supervisor
        .start_all(PortAssignment {
            http_port: 8892,
            web_socket_port: 8891,
        })
        .await
        .unwrap();

    // 8892 belongs to the HTTP service.
    assert_eq!(ports.web_socket_port, 8893);
    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_exit_before_ready_without_retries_fails() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let mut config = ctx.config();
    config.max_port_attempts = 1;
    config
        .websocket
        .env
        .insert("BLOCKED_PORT".to_string(), "8892".to_string());

    let mut supervisor = ServiceSupervisor::from_config(&config)
        .unwrap()
        .with_allocator(all_free_allocator());
    let err = supervisor.start_all(assignment()).await.unwrap_err();

    match err {
        Error::ExitedBeforeReady { name, exit } => {
            assert_eq!(name, "websocket");
            assert_eq!(exit, ExitState::Exited(1));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(supervisor.tracked_count(), 0);
}

#[tokio::test]
async fn test_crash_on_free_port_is_not_retried() {
    let ctx = TestContext::new();
    ctx.create_script(
        "http.sh",
        "#!/bin/sh\necho launch >> launches\necho 'ImportError: No module named http' >&2\nexit 1\n",
    )
    .await;
    ctx.create_script("ws.sh", common::FAKE_WEBSOCKET).await;

    let config = ctx.config();
    assert_eq!(config.max_port_attempts, 3);

    let mut supervisor = ServiceSupervisor::from_config(&config)
        .unwrap()
        .with_allocator(all_free_allocator());
    let err = supervisor.start_all(assignment()).await.unwrap_err();

    assert!(matches!(err, Error::ExitedBeforeReady { ref name, .. } if name == "http"));
    let launches = std::fs::read_to_string(ctx.commands_dir.join("launches")).unwrap();
    assert_eq!(launches.lines().count(), 1);
    assert_eq!(ctx.recorded_port("ws.port"), None);
}

#[tokio::test]
async fn test_stop_reaches_children_of_exited_leader() {
    let command = LaunchCommand {
        name: "orphaning".to_string(),
        program: "sh".to_string(),
        args: vec!["-c".to_string(), "sleep 60 & echo $!".to_string()],
        ..Default::default()
    };
    let mut handle = ProcessHandle::spawn(&command).unwrap();
    let mut lines = handle.take_output().unwrap();
    let child: i32 = lines.recv().await.unwrap().text.trim().parse().unwrap();

    assert_eq!(handle.wait().await, Some(ExitState::Exited(0)));
    assert!(pid_alive(child));

    handle.stop(Duration::from_secs(2)).await.unwrap();
    assert!(
        wait_for_condition(|| !pid_alive(child), Duration::from_secs(5)).await,
        "child {child} survived its group being stopped"
    );
}

#[tokio::test]
async fn test_retry_gives_up_at_end_of_range() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let mut config = ctx.config();
    config.ports = PortRange::new(8891, 8892).unwrap();
    config
        .websocket
        .env
        .insert("BLOCKED_PORT".to_string(), "8892".to_string());

    let mut supervisor = ServiceSupervisor::from_config(&config)
        .unwrap()
        .with_allocator(taken_allocator(&[8892]));
    let err = supervisor.start_all(assignment()).await.unwrap_err();
    assert!(matches!(err, Error::ExitedBeforeReady { .. }));
}

#[tokio::test]
async fn test_stop_kills_service_ignoring_sigterm() {
    let ctx = TestContext::new();
    ctx.create_script(
        "http.sh",
        "#!/bin/sh\ntrap '' TERM\necho 'Serving HTTP' >&2\nsleep 60 &\necho $! > child.pid\nwait\n",
    )
    .await;
    ctx.create_script("ws.sh", common::FAKE_WEBSOCKET).await;

    let mut config = ctx.config();
    config.shutdown.grace_period_ms = 200;

    let mut supervisor = ServiceSupervisor::from_config(&config).unwrap();
    supervisor.start_all(assignment()).await.unwrap();
    let shell = supervisor.pid("http").unwrap() as i32;

    let child_pid_file = ctx.commands_dir.join("child.pid");
    assert!(
        wait_for_condition(|| read_pid(&child_pid_file).is_some(), Duration::from_secs(5)).await
    );
    let child = read_pid(&child_pid_file).unwrap();

    tokio::time::timeout(TEST_TIMEOUT, supervisor.stop_all())
        .await
        .expect("stop_all hung");

    assert!(!pid_alive(shell));
    // The whole process group is signalled, including grandchildren.
    assert!(wait_for_condition(|| !pid_alive(child), Duration::from_secs(5)).await);
}
