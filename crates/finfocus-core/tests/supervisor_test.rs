//! Process lifecycle against real child processes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use finfocus_core::proto::CommMode;
use finfocus_core::{ErrorKind, HostError, PluginClient, ProcessState, Supervisor, SupervisorConfig};
use finfocus_test_utils::{MockPlugin, ec2_instance, plugin_root, process_gone, write_script};

const MOCK: &str = env!("CARGO_BIN_EXE_finfocus-mock-plugin");

fn supervisor(handshake: Duration) -> Supervisor {
    Supervisor::new(SupervisorConfig {
        handshake_timeout: handshake,
        stop_grace: Duration::from_secs(1),
        liveness_timeout: Duration::from_secs(5),
    })
}

fn wrapper(dir: &std::path::Path, mock: MockPlugin) -> PathBuf {
    mock.write_to(dir, "finfocus-plugin-mock")
}

#[tokio::test]
async fn tcp_plugin_reaches_ready_and_stops() {
    let dir = plugin_root();
    let binary = wrapper(dir.path(), MockPlugin::new(MOCK, "mock"));
    let supervisor = supervisor(Duration::from_secs(10));

    let process = supervisor
        .start_binary(&binary, CommMode::Tcp, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(process.state(), ProcessState::Ready);
    assert_eq!(process.info().unwrap().name, "mock");
    let pid = process.pid().unwrap();

    let client = PluginClient::new(process.clone());
    assert_eq!(client.identity(Duration::from_secs(5)).await.unwrap(), "mock");

    process.stop().await;
    assert_eq!(process.state(), ProcessState::Stopped);
    assert!(process_gone(pid), "plugin {pid} outlived stop()");

    let err = client.identity(Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);
}

#[tokio::test]
async fn stdio_plugin_answers_calls() {
    let dir = plugin_root();
    let binary = wrapper(dir.path(), MockPlugin::new(MOCK, "piped").unit_price(0.5));
    let supervisor = supervisor(Duration::from_secs(10));

    let process = supervisor
        .start_binary(&binary, CommMode::Stdio, &CancellationToken::new())
        .await
        .unwrap();
    let client = PluginClient::new(process.clone());
    let cost = client
        .get_projected_cost(&ec2_instance("i-1"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(cost.currency, "USD");
    assert_eq!(cost.unit_price, 0.5);
    process.stop().await;
}

#[tokio::test]
async fn chatter_before_handshake_is_captured() {
    let dir = plugin_root();
    let binary = write_script(
        dir.path(),
        "finfocus-plugin-chatty",
        &format!("echo 'warming up'\nexec '{MOCK}'"),
    );

    let process = supervisor(Duration::from_secs(10))
        .start_binary(&binary, CommMode::Tcp, &CancellationToken::new())
        .await
        .unwrap();
    assert!(process.diagnostics().stdout.iter().any(|l| l == "warming up"));
    process.stop().await;
}

#[tokio::test]
async fn handshake_timeout_kills_the_child() {
    let dir = plugin_root();
    let binary = write_script(
        dir.path(),
        "finfocus-plugin-silent",
        "echo $$ > pid\necho 'still loading' >&2\nexec sleep 30",
    );
    let timeout = Duration::from_millis(500);

    let started = Instant::now();
    let err = supervisor(timeout)
        .start_binary(&binary, CommMode::Tcp, &CancellationToken::new())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
    assert!(elapsed < timeout + Duration::from_secs(2), "took {elapsed:?}");
    let diagnostics = err.diagnostics().unwrap();
    assert!(diagnostics.stderr.iter().any(|l| l.contains("still loading")));

    let pid: u32 = std::fs::read_to_string(dir.path().join("pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(process_gone(pid), "orphaned plugin {pid}");
}

#[tokio::test]
async fn early_exit_is_unavailable_with_stderr() {
    let dir = plugin_root();
    let binary = write_script(
        dir.path(),
        "finfocus-plugin-broken",
        "echo 'missing credentials' >&2\nexit 3",
    );

    let err = supervisor(Duration::from_secs(10))
        .start_binary(&binary, CommMode::Tcp, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(
        err.diagnostics()
            .unwrap()
            .stderr
            .iter()
            .any(|l| l.contains("missing credentials"))
    );
}

#[tokio::test]
async fn missing_binary_is_a_spawn_failure() {
    let err = supervisor(Duration::from_secs(1))
        .start_binary(
            std::path::Path::new("/nonexistent/finfocus-plugin-ghost"),
            CommMode::Tcp,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Spawn { .. }));
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn incompatible_spec_version_is_refused() {
    let dir = plugin_root();
    let plugin = MockPlugin::new(MOCK, "future").env("MOCK_SPEC_VERSION", "2.0.0");
    let binary = wrapper(dir.path(), plugin);

    let err = supervisor(Duration::from_secs(10))
        .start_binary(&binary, CommMode::Tcp, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        HostError::ProtocolMismatch { plugin_version, .. } => assert_eq!(plugin_version, "2.0.0"),
        other => panic!("expected protocol mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn legacy_plugin_without_info_is_accepted() {
    let dir = plugin_root();
    let binary = wrapper(dir.path(), MockPlugin::new(MOCK, "legacy").env("MOCK_NO_PLUGIN_INFO", 1));

    let process = supervisor(Duration::from_secs(10))
        .start_binary(&binary, CommMode::Tcp, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(process.state(), ProcessState::Ready);
    assert!(process.info().is_none());
    process.stop().await;
}

#[tokio::test]
async fn crash_mid_call_surfaces_before_the_budget() {
    let dir = plugin_root();
    let binary = wrapper(
        dir.path(),
        MockPlugin::new(MOCK, "fragile")
            .env("MOCK_CRASH_ON", "get_projected_cost")
            .env("MOCK_CRASH_DELAY_MS", 200),
    );
    let supervisor = supervisor(Duration::from_secs(10));
    let mut events = supervisor.subscribe();

    let process = supervisor
        .start_binary(&binary, CommMode::Tcp, &CancellationToken::new())
        .await
        .unwrap();
    let client = PluginClient::new(process.clone());

    let budget = Duration::from_secs(20);
    let started = Instant::now();
    let err = client.get_projected_cost(&ec2_instance("i-1"), budget).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());

    let mut saw_crash = false;
    while let Ok(change) = tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        let change = change.unwrap();
        if change.to == ProcessState::Crashed {
            assert_eq!(change.plugin, process.key());
            saw_crash = true;
            break;
        }
    }
    assert!(saw_crash, "no crash event published");
    assert_eq!(process.state(), ProcessState::Crashed);

    // Stopping a crashed process keeps it crashed.
    process.stop().await;
    assert_eq!(process.state(), ProcessState::Crashed);
}

#[tokio::test]
async fn cancelled_start_returns_promptly() {
    let dir = plugin_root();
    let binary = write_script(dir.path(), "finfocus-plugin-slow", "exec sleep 30");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let started = Instant::now();
    let err = supervisor(Duration::from_secs(30))
        .start_binary(&binary, CommMode::Tcp, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// Answers the startup identity and plugin-info calls up front, then never
/// reads its stdin again.
fn stops_reading_after_startup(dir: &std::path::Path) -> PathBuf {
    write_script(
        dir,
        "finfocus-plugin-wedged",
        r#"printf '\000\000\000\043{"id":1,"result":{"name":"wedged"}}'
printf '\000\000\000\074{"id":2,"error":{"code":"unimplemented","message":"legacy"}}'
exec sleep 30"#,

    )
}

/// A request large enough to fill the pipe, so the write is cut off mid-frame.
fn oversized_resource() -> finfocus_core::proto::ResourceDescriptor {
    ec2_instance("i-big").with_property("userData", "x".repeat(4 * 1024 * 1024))
}

async fn wait_gone(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn interrupted_write_abandons_the_plugin() {
    let dir = plugin_root();
    let binary = stops_reading_after_startup(dir.path());
    let supervisor = supervisor(Duration::from_secs(5));
    let mut events = supervisor.subscribe();

    let process = supervisor
        .start_binary(&binary, CommMode::Stdio, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(process.state(), ProcessState::Ready);
    let pid = process.pid().unwrap();
    let client = PluginClient::new(process.clone());

    let err = client
        .dry_run(&oversized_resource(), Default::default(), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(process.state(), ProcessState::Degraded);

    let err = client.identity(Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(process.state(), ProcessState::Crashed);
    assert!(wait_gone(pid).await, "abandoned plugin {pid} still running");

    let mut saw_crash = false;
    while let Ok(change) = events.try_recv() {
        saw_crash |= change.to == ProcessState::Crashed;
    }
    assert!(saw_crash, "no Crashed state change published");
    process.stop().await;
}

#[tokio::test]
async fn failed_health_check_drops_the_plugin() {
    let dir = plugin_root();
    let binary = stops_reading_after_startup(dir.path());
    let supervisor = supervisor(Duration::from_secs(5));
    let process = supervisor
        .start_binary(&binary, CommMode::Stdio, &CancellationToken::new())
        .await
        .unwrap();
    let pid = process.pid().unwrap();

    let registry = finfocus_core::PluginRegistry::new();
    registry.insert(process.clone());
    let _ = PluginClient::new(process.clone())
        .dry_run(&oversized_resource(), Default::default(), Duration::from_millis(300))
        .await;
    assert_eq!(process.state(), ProcessState::Degraded);

    let recovered = registry.health_check_degraded(Duration::from_secs(1)).await;
    assert_eq!(recovered, 0);
    assert!(registry.is_empty());
    assert!(process.state().is_terminal());
    assert!(wait_gone(pid).await, "dropped plugin {pid} still running");
}
