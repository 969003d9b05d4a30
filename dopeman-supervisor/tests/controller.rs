mod common;

use common::{TestContext, all_free_allocator, pid_alive};
use dopeman_supervisor::{
    Error, ExitState, HostApi, LifecycleController, PortRange, SupervisorConfig,
};
use pretty_assertions::assert_eq;
use std::net::TcpListener;
use std::time::Duration;

#[tokio::test]
async fn test_end_to_end_session() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;
    ctx.create_script("scan-real-data.py", "echo scanning\nexit 0\n")
        .await;
    ctx.create_script("health-check.py", "exit 2\n").await;

    let controller = LifecycleController::new(ctx.config());
    assert!(matches!(controller.get_ports().await, Err(Error::NotStarted)));

    let ports = tokio::time::timeout(Duration::from_secs(30), controller.start())
        .await
        .expect("start timed out")
        .unwrap();

    let range = PortRange::default();
    assert!(range.contains(ports.http_port));
    assert!(range.contains(ports.web_socket_port));
    assert!(ports.web_socket_port > ports.http_port);
    assert_eq!(controller.get_ports().await.unwrap(), ports);
    assert_eq!(ctx.recorded_port("http.port"), Some(ports.http_port));
    assert_eq!(ctx.recorded_port("ws.port"), Some(ports.web_socket_port));

    let scan = controller.scan_skills().await.unwrap();
    assert_eq!(scan.name, "scan");
    assert!(scan.is_success());

    // A failing task leaves the services alone.
    let health = controller.health_check().await.unwrap();
    assert_eq!(health.exit, ExitState::Exited(2));
    assert_eq!(controller.get_ports().await.unwrap(), ports);

    controller.stop().await;
    assert!(!controller.is_running().await);
    assert!(matches!(controller.get_ports().await, Err(Error::NotStarted)));

    // Idempotent.
    controller.stop().await;
}

#[tokio::test]
async fn test_websocket_port_follows_http_port() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let mut config = ctx.config();
    config.ports = PortRange::new(8891, 8999).unwrap();
    let controller = LifecycleController::new(config).with_allocator(all_free_allocator());

    let ports = controller.start().await.unwrap();
    assert_eq!(ports.http_port, 8891);
    assert_eq!(ports.web_socket_port, 8892);

    assert!(matches!(controller.start().await, Err(Error::AlreadyRunning)));
    controller.stop().await;
}

#[tokio::test]
async fn test_restart_builds_new_supervisor() {
    let ctx = TestContext::new();
    ctx.create_script(
        "http.sh",
        "#!/bin/sh\necho $$ > http.pid\necho \"$1\" > http.port\necho 'Serving HTTP' >&2\nexec sleep 60\n",
    )
    .await;
    ctx.create_script("ws.sh", common::FAKE_WEBSOCKET).await;

    let controller = LifecycleController::new(ctx.config()).with_allocator(all_free_allocator());
    controller.start().await.unwrap();
    let first_pid = common::read_pid(&ctx.commands_dir.join("http.pid")).unwrap();

    controller.stop().await;
    assert!(!pid_alive(first_pid));

    controller.start().await.unwrap();
    let second_pid = common::read_pid(&ctx.commands_dir.join("http.pid")).unwrap();
    assert_ne!(first_pid, second_pid);
    assert!(pid_alive(second_pid));

    controller.stop().await;
}

#[tokio::test]
async fn test_no_free_port_fails_start() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = held.local_addr().unwrap().port();

    let mut config = ctx.config();
    config.ports = PortRange::new(port.into(), port.into()).unwrap();
    let controller = LifecycleController::new(config);

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, Error::NoPortAvailable { .. }));
    assert!(!controller.is_running().await);
}

#[tokio::test]
async fn test_single_port_range_leaves_no_websocket_port() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let mut config = ctx.config();
    config.ports = PortRange::new(8891, 8891).unwrap();
    let controller = LifecycleController::new(config).with_allocator(all_free_allocator());

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, Error::NoPortAvailable { start: 8891, end: 8891 }));
}

#[tokio::test]
async fn test_failed_start_leaves_controller_stopped() {
    let ctx = TestContext::new();
    ctx.create_script("http.sh", "#!/bin/sh\necho 'Traceback' >&2\nexit 1\n")
        .await;
    ctx.create_script("ws.sh", common::FAKE_WEBSOCKET).await;

    let controller = LifecycleController::new(ctx.config()).with_allocator(all_free_allocator());

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, Error::ExitedBeforeReady { ref name, .. } if name == "http"));
    assert!(!controller.is_running().await);
    assert_eq!(ctx.recorded_port("ws.port"), None);
}

#[tokio::test]
async fn test_preflight_rejects_missing_interpreter() {
    let ctx = TestContext::new();
    ctx.install_fake_services().await;

    let mut config = SupervisorConfig {
        interpreter: "dopeman-no-such-interpreter".to_string(),
        ..ctx.config()
    };
    config.preflight.enable = true;
    let controller = LifecycleController::new(config).with_allocator(all_free_allocator());

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, Error::InterpreterNotFound { .. }));
    assert!(!controller.is_running().await);
}
