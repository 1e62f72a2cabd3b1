#![cfg(unix)]

use restcoder::core::models::{InstanceState, ProcessSpec, TopologyConfig};
use restcoder::core::ports::PortPlan;
use restcoder::environment::ResolvedEnvironment;
use restcoder::platform;
use restcoder::supervisor::{ProcessSupervisor, SupervisorOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn topology(instances: &[(&str, u32)]) -> TopologyConfig {
    TopologyConfig {
        problem_id: 1,
        language: "nodejs".to_string(),
        instances: instances
            .iter()
            .map(|(name, count)| (name.to_string(), *count))
            .collect(),
        env: vec![],
        postman_collection_id: None,
    }
}

fn options(dir: &Path, grace: Duration) -> SupervisorOptions {
    SupervisorOptions {
        directory: dir.to_path_buf(),
        grace_period: grace,
        proxy_program: PathBuf::from(env!("CARGO_BIN_EXE_restcoder")),
        mirror_output: false,
        ..SupervisorOptions::default()
    }
}

async fn free_base_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("probe bind");
    listener.local_addr().expect("probe addr").port()
}

async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<String> = content.lines().map(str::to_string).collect();
            if lines.len() >= count || Instant::now() > deadline {
                return lines;
            }
        } else if Instant::now() > deadline {
            return Vec::new();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn connect_with_retry(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => return stream,
            Err(err) if Instant::now() > deadline => panic!("proxy never came up: {err}"),
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

fn assert_all_gone(supervisor: &ProcessSupervisor) {
    for instance in supervisor.instances() {
        assert_eq!(instance.state, InstanceState::Exited, "{}", instance.label());
        let pid = instance.pid.expect("pid recorded");
        assert!(!platform::process_alive(pid), "{} still alive", instance.label());
    }
    if let Some(proxy) = supervisor.proxy() {
        assert_eq!(proxy.state, InstanceState::Exited);
        assert!(!platform::process_alive(proxy.pid.expect("proxy pid")));
    }
}

#[tokio::test]
async fn instances_get_planned_ports_and_proxy_fronts_the_pool() {
    let dir = TempDir::new().unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(base, &topology(&[("web", 3)]), "web").unwrap();
    let processes = vec![ProcessSpec::new("web", "echo $PORT >> ports.txt; exec sleep 30")];

    let mut supervisor = ProcessSupervisor::new(options(dir.path(), Duration::from_secs(3)));
    supervisor
        .launch(&processes, &plan, &ResolvedEnvironment::default())
        .await
        .expect("launch");

    assert_eq!(supervisor.instances().len(), 3);
    assert!(supervisor
        .instances()
        .iter()
        .all(|instance| instance.state == InstanceState::Running));

    let mut ports: Vec<u16> = wait_for_lines(&dir.path().join("ports.txt"), 3)
        .await
        .iter()
        .map(|line| line.trim().parse().expect("port"))
        .collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![base + 1, base + 2, base + 3]);

    // Nothing listens behind the proxy, so it must answer with the fixed error.
    let mut stream = connect_with_retry(base).await;
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 500"), "{response}");
    assert!(response.contains("Upstream Proxy Error"));

    let started = Instant::now();
    supervisor.run_until(async {}).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_all_gone(&supervisor);
}

#[tokio::test]
async fn single_web_instance_binds_base_port_without_proxy() {
    let dir = TempDir::new().unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(base, &topology(&[("web", 1), ("worker", 1)]), "web").unwrap();
    let processes = vec![
        ProcessSpec::new("web", "echo web=$PORT >> ports.txt; exec sleep 30"),
        ProcessSpec::new("worker", "echo worker=$PORT >> ports.txt; exec sleep 30"),
    ];

    let mut supervisor = ProcessSupervisor::new(options(dir.path(), Duration::from_secs(3)));
    supervisor
        .launch(&processes, &plan, &ResolvedEnvironment::default())
        .await
        .unwrap();
    assert!(supervisor.proxy().is_none());
    assert_eq!(
        supervisor.snapshot(),
        vec![
            ("web.1".to_string(), base, InstanceState::Running),
            ("worker.1".to_string(), base + 100, InstanceState::Running),
        ]
    );

    let mut lines = wait_for_lines(&dir.path().join("ports.txt"), 2).await;
    lines.sort();
    assert_eq!(
        lines,
        vec![format!("web={base}"), format!("worker={}", base + 100)]
    );

    supervisor.run_until(async {}).await;
    assert_all_gone(&supervisor);
}

#[tokio::test]
async fn resolved_environment_reaches_children() {
    let dir = TempDir::new().unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(base, &topology(&[("web", 1)]), "web").unwrap();
    let processes = vec![ProcessSpec::new(
        "web",
        "echo \"$RESTCODER_TEST_CHILD_VAR\" > env.txt; exec sleep 30",
    )];
    let env = ResolvedEnvironment {
        file_found: true,
        file_vars: vec![("RESTCODER_TEST_CHILD_VAR".to_string(), "from-dotenv".to_string())],
        required: vec![],
    };

    let mut supervisor = ProcessSupervisor::new(options(dir.path(), Duration::from_secs(3)));
    supervisor.launch(&processes, &plan, &env).await.unwrap();

    assert_eq!(
        wait_for_lines(&dir.path().join("env.txt"), 1).await,
        vec!["from-dotenv".to_string()]
    );
    supervisor.run_until(async {}).await;
}

#[tokio::test]
async fn processes_ignoring_sigterm_are_killed_after_grace_period() {
    let dir = TempDir::new().unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(base, &topology(&[("web", 2)]), "web").unwrap();
    let processes = vec![ProcessSpec::new("web", "trap '' TERM; sleep 30")];

    let grace = Duration::from_millis(300);
    let mut supervisor = ProcessSupervisor::new(options(dir.path(), grace));
    supervisor
        .launch(&processes, &plan, &ResolvedEnvironment::default())
        .await
        .unwrap();
    // Let the shells install their trap before asking them to stop.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    supervisor.shutdown().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= grace, "returned before the grace period: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "shutdown hung: {elapsed:?}");
    assert_all_gone(&supervisor);
}

#[tokio::test]
async fn exits_are_recorded_without_stopping_the_rest() {
    let dir = TempDir::new().unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(
        base,
        &topology(&[("web", 1), ("worker", 1), ("clock", 1)]),
        "web",
    )
    .unwrap();
    let processes = vec![
        ProcessSpec::new("web", "exec sleep 30"),
        ProcessSpec::new("worker", "exit 3"),
        ProcessSpec::new("clock", "true"),
    ];

    let mut supervisor = ProcessSupervisor::new(options(dir.path(), Duration::from_secs(3)));
    supervisor
        .launch(&processes, &plan, &ResolvedEnvironment::default())
        .await
        .unwrap();
    supervisor
        .run_until(tokio::time::sleep(Duration::from_millis(700)))
        .await;

    let states: Vec<(String, InstanceState, Option<i32>)> = supervisor
        .instances()
        .iter()
        .map(|instance| (instance.label(), instance.state, instance.exit_code))
        .collect();
    assert_eq!(states[1], ("worker.1".to_string(), InstanceState::Failed, Some(3)));
    assert_eq!(states[2], ("clock.1".to_string(), InstanceState::Exited, Some(0)));
    // web was still running and got stopped by the shutdown.
    assert_eq!(states[0].1, InstanceState::Exited);
}

#[tokio::test]
async fn spawn_failure_aborts_and_stops_started_instances() {
    let dir = TempDir::new().unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(base, &topology(&[("web", 2)]), "web").unwrap();
    let processes = vec![ProcessSpec::new("web", "exec sleep 30")];

    let mut opts = options(dir.path(), Duration::from_secs(2));
    opts.proxy_program = dir.path().join("no-such-proxy");
    let mut supervisor = ProcessSupervisor::new(opts);

    let err = supervisor
        .launch(&processes, &plan, &ResolvedEnvironment::default())
        .await
        .expect_err("proxy spawn must fail");
    assert_eq!(err.label, "proxy");

    for instance in supervisor.instances() {
        assert!(!instance.state.is_alive());
        assert!(!platform::process_alive(instance.pid.expect("instance was spawned")));
    }
    assert_eq!(
        supervisor.proxy().map(|proxy| proxy.state),
        Some(InstanceState::Failed)
    );
}

#[tokio::test]
async fn missing_shell_fails_before_anything_runs() {
    let dir = TempDir::new().unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(base, &topology(&[("web", 1), ("worker", 2)]), "web").unwrap();
    let processes = vec![
        ProcessSpec::new("web", "exec sleep 30"),
        ProcessSpec::new("worker", "exec sleep 30"),
    ];

    let mut opts = options(dir.path(), Duration::from_secs(1));
    opts.shell = dir.path().join("no-such-shell");
    let mut supervisor = ProcessSupervisor::new(opts);

    let err = supervisor
        .launch(&processes, &plan, &ResolvedEnvironment::default())
        .await
        .unwrap_err();
    assert_eq!(err.label, "web.1");
    assert_eq!(supervisor.instances().len(), 1);
    assert_eq!(supervisor.instances()[0].state, InstanceState::Failed);
    assert!(!supervisor.any_alive());
}

#[tokio::test]
async fn unbounded_grace_period_does_not_break_shutdown() {
    let dir = TempDir::new().unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(base, &topology(&[("web", 1)]), "web").unwrap();
    let processes = vec![ProcessSpec::new("web", "exec sleep 30")];

    let mut supervisor = ProcessSupervisor::new(options(dir.path(), Duration::MAX));
    supervisor
        .launch(&processes, &plan, &ResolvedEnvironment::default())
        .await
        .unwrap();

    let started = Instant::now();
    supervisor.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_all_gone(&supervisor);
}

#[tokio::test]
async fn proxy_exit_is_reported_while_instances_keep_running() {
    let dir = TempDir::new().unwrap();
    // `/bin/sh proxy --port ...` runs this file from the working directory.
    fs::write(dir.path().join("proxy"), "exit 1\n").unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(base, &topology(&[("web", 2)]), "web").unwrap();
    let processes = vec![ProcessSpec::new("web", "exec sleep 30")];

    let mut opts = options(dir.path(), Duration::from_secs(3));
    opts.proxy_program = PathBuf::from("/bin/sh");
    let mut supervisor = ProcessSupervisor::new(opts);
    supervisor
        .launch(&processes, &plan, &ResolvedEnvironment::default())
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.proxy().is_some_and(|proxy| proxy.state.is_alive()) {
        assert!(Instant::now() < deadline, "proxy never exited");
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.apply_pending_exits();
    }

    let proxy = supervisor.proxy().expect("proxy tracked");
    assert_eq!((proxy.state, proxy.exit_code), (InstanceState::Failed, Some(1)));
    for instance in supervisor.instances() {
        assert_eq!(instance.state, InstanceState::Running, "{}", instance.label());
        assert!(platform::process_alive(instance.pid.expect("pid")));
    }

    supervisor.run_until(async {}).await;
    for instance in supervisor.instances() {
        assert_eq!(instance.state, InstanceState::Exited);
    }
    assert_eq!(
        supervisor.proxy().map(|proxy| proxy.state),
        Some(InstanceState::Failed)
    );
}

#[tokio::test]
async fn exit_queued_before_shutdown_keeps_its_failure() {
    let dir = TempDir::new().unwrap();
    let base = free_base_port().await;
    let plan = PortPlan::compute(base, &topology(&[("web", 1), ("worker", 1)]), "web").unwrap();
    let processes = vec![
        ProcessSpec::new("web", "exec sleep 30"),
        ProcessSpec::new("worker", "exit 3"),
    ];

    let mut supervisor = ProcessSupervisor::new(options(dir.path(), Duration::from_secs(3)));
    supervisor
        .launch(&processes, &plan, &ResolvedEnvironment::default())
        .await
        .unwrap();
    // Nobody consumes exit notifications until shutdown starts.
    tokio::time::sleep(Duration::from_millis(500)).await;
    supervisor.shutdown().await;

    let worker = &supervisor.instances()[1];
    assert_eq!(worker.label(), "worker.1");
    assert_eq!((worker.state, worker.exit_code), (InstanceState::Failed, Some(3)));
    assert_eq!(supervisor.instances()[0].state, InstanceState::Exited);
}
