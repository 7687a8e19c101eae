//! Launching the stub executable through the process handle.

use hive_beekeeper::{
    Beekeeper, BeekeeperError, BeekeeperSettings, NotificationKind, WalletState, STDERR_LOG,
};
use hive_harness::{NameRegistry, PortRange, ScopeStack};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn settings(dir: &Path) -> BeekeeperSettings {
    BeekeeperSettings::builder()
        .name("Beekeeper0")
        .binary(env!("CARGO_BIN_EXE_beekeeper-stub"))
        .working_directory(dir.join("Beekeeper0"))
        .unlock_interval(Duration::from_millis(10))
        .startup_timeout(Duration::from_secs(20))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_launch_and_scope_teardown() {
    hive_harness::logging::init_logging("hive_beekeeper=debug");
    let dir = tempfile::tempdir().unwrap();
    let beekeeper = Beekeeper::launch(settings(dir.path())).await.unwrap();
    assert!(beekeeper.pid().is_some());
    assert!(beekeeper.notification_endpoint().is_some());

    let session = beekeeper.create_session(None).await.unwrap();
    let (_, password) = session.create_wallet("alice", None).await.unwrap();
    assert!(password.is_some());
    assert!(dir.path().join("Beekeeper0").join("alice.wallet").is_file());
    assert!(beekeeper.stderr_contains("Webserver listening").unwrap());

    let mut stack = ScopeStack::new(dir.path());
    stack.enter_scope("test");
    stack.register(Box::new(beekeeper.scoped_guard().unwrap())).unwrap();
    stack.exit_scope().unwrap();

    assert!(beekeeper.is_closed());
    assert_eq!(beekeeper.pid(), None);
    assert!(matches!(
        session.wallet_state("alice"),
        Err(BeekeeperError::Invalidated(_))
    ));
    assert!(matches!(
        session.list_wallets().await,
        Err(BeekeeperError::Invalidated(_))
    ));
    assert!(dir.path().join("Beekeeper0").join("stderr.log").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_lets_beekeeper_force_close_wallets() {
    let dir = tempfile::tempdir().unwrap();
    let beekeeper = Beekeeper::launch(settings(dir.path())).await.unwrap();
    let session = beekeeper.create_session(None).await.unwrap();
    session.create_wallet("alice", Some("pw")).await.unwrap();
    let token = session.token().to_string();

    beekeeper.close().unwrap();

    hive_harness::wait_for(
        "attempt_of_closing_wallets",
        || {
            beekeeper.notifications().iter().any(|n| {
                matches!(&n.kind, NotificationKind::AttemptOfClosingWallets(c)
                    if c.token == token && c.wallets == ["alice"])
            })
        },
        Some(Duration::from_secs(5)),
        Duration::from_millis(20),
    )
    .unwrap();
    let stderr = std::fs::read_to_string(dir.path().join("Beekeeper0").join(STDERR_LOG)).unwrap();
    assert!(stderr.contains("Shutdown complete"), "{stderr}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_port_conflict_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let settings = BeekeeperSettings {
        http_endpoint: taken.local_addr().unwrap(),
        ..settings(dir.path())
    };

    match Beekeeper::launch(settings).await {
        Err(BeekeeperError::StartupFailed { reason, .. }) => {
            assert!(
                reason.contains("opening_beekeeper_failed") || reason.contains("exited"),
                "unexpected reason: {reason}"
            );
        }
        other => panic!("expected startup failure, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_settings_from_context() {
    let dir = tempfile::tempdir().unwrap();
    let stack = ScopeStack::new(dir.path());
    let mut names = NameRegistry::new();
    let ports = PortRange::with_probe(46000, 46100, Arc::new(|_: u16| true)).unwrap();

    let first = BeekeeperSettings::for_context(stack.context(), &mut names, &ports).unwrap();
    let second = BeekeeperSettings::for_context(stack.context(), &mut names, &ports).unwrap();
    assert_eq!(first.name, "Beekeeper0");
    assert_eq!(second.name, "Beekeeper1");
    assert_eq!(first.working_directory, dir.path().join("Beekeeper0"));
    assert_ne!(first.http_endpoint, second.http_endpoint);
    assert_ne!(first.http_endpoint, first.notification_endpoint);

    let launched = BeekeeperSettings {
        binary_path: env!("CARGO_BIN_EXE_beekeeper-stub").into(),
        http_endpoint: "127.0.0.1:0".parse().unwrap(),
        notification_endpoint: "127.0.0.1:0".parse().unwrap(),
        ..first
    };
    let beekeeper = Beekeeper::launch(launched).await.unwrap();
    let session = beekeeper.create_session(None).await.unwrap();
    session.create_wallet("w", Some("pw")).await.unwrap();
    assert_eq!(session.wallet_state("w").unwrap(), WalletState::Unlocked);
    beekeeper.close().unwrap();
}
