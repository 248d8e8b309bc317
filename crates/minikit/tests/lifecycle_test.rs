//! Coordinator scenarios against an in-memory driver and firewall.

use async_trait::async_trait;
use minikit::{
    AutoConsent, Coordinator, CoordinatorOptions, DriverFactory, MachineStore,
    SshCommandBootstrapper,
};
use minikit_core::{
    Driver, DriverKind, Error, ErrorKind, MachineConfig, MachineState, MountSpec, Result,
    RetryPolicy,
};
use minikit_kubeconfig::KubeconfigStore;
use minikit_net::Firewall;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Host {
    /// The VM itself is up.
    running: bool,
    paused: bool,
    /// An auxiliary process (a network helper) is up.
    helper: bool,
    /// The guest only gets an address while this is set.
    dhcp_open: bool,
    ssh: bool,
    host_dhcp: bool,
    calls: Vec<&'static str>,
}

impl Host {
    fn power_off(&mut self) {
        self.running = false;
        self.paused = false;
        self.helper = false;
    }
}

type SharedHost = Arc<Mutex<Host>>;

struct FakeDriver {
    config: MachineConfig,
    host: SharedHost,
}

impl FakeDriver {
    fn record(&self, call: &'static str) {
        self.host.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut MachineConfig {
        &mut self.config
    }

    async fn pre_create_check(&self) -> Result<()> {
        self.config.validate(Some(','))
    }

    async fn create(&mut self) -> Result<()> {
        self.record("create");
        self.config.set_mac("5a:94:ef:e4:0c:ee")?;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.record("start");
        let mut host = self.host.lock().unwrap();
        host.running = true;
        host.paused = false;
        host.helper = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.record("stop");
        self.host.lock().unwrap().power_off();
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.record("kill");
        self.host.lock().unwrap().power_off();
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        self.record("remove");
        Ok(())
    }

    async fn state(&self) -> Result<MachineState> {
        let host = self.host.lock().unwrap();
        Ok(match (host.running, host.paused, host.helper) {
            (true, true, _) => MachineState::Paused,
            (true, false, _) | (false, _, true) => MachineState::Running,
            (false, _, false) => MachineState::Stopped,
        })
    }

    async fn ip(&self) -> Result<IpAddr> {
        let host = self.host.lock().unwrap();
        if host.running && !host.paused && host.dhcp_open {
            Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            Err(Error::NoIpAddress {
                mac: "5a:94:ef:e4:0c:ee".to_string(),
            })
        }
    }

    fn supports_ssh(&self) -> bool {
        self.host.lock().unwrap().ssh
    }

    fn uses_host_dhcp(&self) -> bool {
        self.host.lock().unwrap().host_dhcp
    }
}

struct FakeDrivers(SharedHost);

impl DriverFactory for FakeDrivers {
    fn driver(&self, config: MachineConfig) -> Box<dyn Driver> {
        Box::new(FakeDriver {
            config,
            host: self.0.clone(),
        })
    }
}

/// Blocks the DHCP daemon until unblocked.
struct FakeFirewall {
    host: SharedHost,
    unblocked: AtomicBool,
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn is_blocking(&self, _app: &Path) -> Result<bool> {
        Ok(!self.host.lock().unwrap().dhcp_open)
    }

    async fn unblock(&self, _app: &Path) -> Result<()> {
        self.unblocked.store(true, Ordering::SeqCst);
        self.host.lock().unwrap().dhcp_open = true;
        Ok(())
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    host: SharedHost,
    coordinator: Coordinator,
}

impl Fixture {
    fn new() -> Self {
        Self::with(|c| c)
    }

    fn with(configure: impl FnOnce(Coordinator) -> Coordinator) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let host: SharedHost = Arc::new(Mutex::new(Host {
            dhcp_open: true,
            ..Host::default()
        }));
        let coordinator = Coordinator::new(
            MachineStore::new(dir.path().join("home")),
            KubeconfigStore::new(dir.path().join("kube/config")),
        )
        .with_factory(Arc::new(FakeDrivers(host.clone())))
        .with_options(CoordinatorOptions {
            nested: Some(false),
            ip_policy: Some(RetryPolicy::new(3, Duration::from_millis(10))),
            stop_poll: Duration::from_millis(10),
            ..CoordinatorOptions::default()
        });
        let coordinator = configure(coordinator);
        Self {
            dir,
            host,
            coordinator,
        }
    }

    fn config(&self, name: &str) -> MachineConfig {
        self.coordinator.store().new_config(name, DriverKind::Vfkit)
    }

    fn kubeconfig(&self) -> KubeconfigStore {
        KubeconfigStore::new(self.dir.path().join("kube/config"))
    }

    fn calls(&self) -> Vec<&'static str> {
        self.host.lock().unwrap().calls.clone()
    }

    fn set(&self, f: impl FnOnce(&mut Host)) {
        f(&mut self.host.lock().unwrap());
    }

    async fn create(&self, name: &str) {
        self.coordinator
            .create(self.config(name))
            .await
            .expect("Failed to create machine");
    }
}

#[tokio::test]
async fn test_cold_start_updates_credentials() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;

    let ip = fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .expect("Failed to start machine");

    assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(fixture.calls(), ["create", "start"]);
    let config = fixture.kubeconfig().read().expect("Failed to read credentials");
    assert_eq!(
        config.cluster("minikit").expect("cluster entry").server,
        "https://127.0.0.1:8443"
    );
    assert_eq!(config.current_context, "minikit");
    assert_eq!(
        fixture.coordinator.status("minikit").await.unwrap(),
        MachineState::Running
    );
    let saved = fixture.coordinator.store().load("minikit").unwrap();
    assert_eq!(saved.mac.as_deref(), Some("5a:94:ef:e4:0c:ee"));
}

#[tokio::test]
async fn test_start_waits_for_ssh_banner() {
    use tokio::io::AsyncWriteExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let _ = stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
        }
    });

    let fixture = Fixture::new();
    fixture.set(|h| h.ssh = true);
    let mut config = fixture.config("minikit");
    config.ssh.port = port;
    fixture.coordinator.create(config).await.unwrap();

    fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .expect("Failed to start machine");
}

#[tokio::test]
async fn test_start_on_running_machine_reconciles_without_rollback() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;
    let cancel = CancellationToken::new();

    fixture.coordinator.start("minikit", &cancel).await.unwrap();
    fixture.coordinator.start("minikit", &cancel).await.unwrap();

    assert_eq!(fixture.calls(), ["create", "start", "start"]);
}

#[tokio::test]
async fn test_start_relaunches_machine_with_only_helper_alive() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;
    // The VM process died but its network helper survived, so the
    // backend still reports the machine as running.
    fixture.set(|h| h.helper = true);
    assert_eq!(
        fixture.coordinator.status("minikit").await.unwrap(),
        MachineState::Running
    );

    let ip = fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .expect("Start should relaunch the VM");

    assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(fixture.calls(), ["create", "start"]);
    assert!(fixture.host.lock().unwrap().running);
}

#[tokio::test]
async fn test_start_resumes_paused_machine() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;
    let cancel = CancellationToken::new();
    fixture.coordinator.start("minikit", &cancel).await.unwrap();
    fixture.set(|h| h.paused = true);

    fixture
        .coordinator
        .start("minikit", &cancel)
        .await
        .expect("Start should resume a paused machine");

    assert_eq!(
        fixture.coordinator.status("minikit").await.unwrap(),
        MachineState::Running
    );
}

#[tokio::test]
async fn test_stop_reaches_paused_machine() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;
    fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .unwrap();
    fixture.set(|h| h.paused = true);

    fixture.coordinator.stop("minikit").await.expect("Failed to stop");

    assert_eq!(fixture.calls(), ["create", "start", "stop"]);
    let host = fixture.host.lock().unwrap();
    assert!(!host.running && !host.helper);
}

#[tokio::test]
async fn test_kill_reaches_helper_only_machine() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;
    fixture.set(|h| h.helper = true);

    fixture.coordinator.kill("minikit").await.expect("Failed to kill");

    assert_eq!(fixture.calls(), ["create", "kill"]);
    assert!(!fixture.host.lock().unwrap().helper);
}

#[tokio::test]
async fn test_remove_kills_paused_machine() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;
    fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .unwrap();
    fixture.set(|h| h.paused = true);

    fixture.coordinator.remove("minikit").await.unwrap();

    assert_eq!(fixture.calls(), ["create", "start", "kill", "remove"]);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;
    fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .unwrap();

    fixture.coordinator.stop("minikit").await.expect("Failed to stop");
    fixture
        .coordinator
        .stop("minikit")
        .await
        .expect("Second stop should succeed");

    assert_eq!(fixture.calls(), ["create", "start", "stop"]);
    assert_eq!(
        fixture.coordinator.status("minikit").await.unwrap(),
        MachineState::Stopped
    );
}

#[tokio::test]
async fn test_ip_exhaustion_returns_error_and_rolls_back() {
    let fixture = Fixture::new();
    fixture.set(|h| h.dhcp_open = false);
    fixture.create("minikit").await;

    let err = fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoIpAddress { ref mac } if mac == "5a:94:ef:e4:0c:ee"));
    assert_eq!(fixture.calls(), ["create", "start", "stop"]);
    assert!(!fixture.kubeconfig().path().exists());
}

#[tokio::test]
async fn test_firewall_blocked_bootpd_is_unblocked_with_consent() {
    let mut fixture = Fixture::new();
    let firewall = Arc::new(FakeFirewall {
        host: fixture.host.clone(),
        unblocked: AtomicBool::new(false),
    });
    fixture.coordinator = fixture
        .coordinator
        .with_firewall(firewall.clone())
        .with_consent(Arc::new(AutoConsent(true)));
    fixture.set(|h| {
        h.dhcp_open = false;
        h.host_dhcp = true;
    });
    fixture.create("minikit").await;

    fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .expect("Start should succeed once bootpd is unblocked");

    assert!(firewall.unblocked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_firewall_refusal_is_firewall_blocked() {
    let mut fixture = Fixture::new();
    let firewall = Arc::new(FakeFirewall {
        host: fixture.host.clone(),
        unblocked: AtomicBool::new(false),
    });
    fixture.coordinator = fixture
        .coordinator
        .with_firewall(firewall.clone())
        .with_consent(Arc::new(AutoConsent(false)));
    fixture.set(|h| {
        h.dhcp_open = false;
        h.host_dhcp = true;
    });
    fixture.create("minikit").await;

    let err = fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::FirewallBlocked);
    assert!(!firewall.unblocked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_firewall_is_ignored_without_host_dhcp() {
    let mut fixture = Fixture::new();
    let firewall = Arc::new(FakeFirewall {
        host: fixture.host.clone(),
        unblocked: AtomicBool::new(false),
    });
    fixture.coordinator = fixture
        .coordinator
        .with_firewall(firewall.clone())
        .with_consent(Arc::new(AutoConsent(true)));
    fixture.set(|h| h.dhcp_open = false);
    fixture.create("minikit").await;

    let err = fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_no_ip_address());
    assert!(!firewall.unblocked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancel_during_ip_wait_stops_machine() {
    let fixture = Fixture::with(|c| {
        c.with_options(CoordinatorOptions {
            nested: Some(false),
            ip_policy: Some(RetryPolicy::new(1000, Duration::from_millis(10))),
            stop_poll: Duration::from_millis(10),
            ..CoordinatorOptions::default()
        })
    });
    fixture.set(|h| h.dhcp_open = false);
    fixture.create("minikit").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = fixture
        .coordinator
        .start("minikit", &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(fixture.calls(), ["create", "start", "stop"]);
}

#[tokio::test]
async fn test_relative_mount_is_rejected_before_start() {
    let fixture = Fixture::new();
    let mut config = fixture.config("minikit");
    config.mounts.push(MountSpec::new("relative/src", "/src"));

    let err = fixture.coordinator.create(config).await.unwrap_err();

    assert!(matches!(err, Error::InvalidMount { .. }));
    assert!(fixture.calls().is_empty());
    assert!(!fixture.coordinator.store().exists("minikit"));
}

#[tokio::test]
async fn test_remove_missing_machine_succeeds() {
    let fixture = Fixture::new();
    fixture
        .coordinator
        .remove("ghost")
        .await
        .expect("Removing a missing machine should succeed");
    assert_eq!(
        fixture.coordinator.status("ghost").await.unwrap(),
        MachineState::None
    );
}

#[tokio::test]
async fn test_remove_deletes_record_and_context() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;
    fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .unwrap();

    fixture.coordinator.remove("minikit").await.expect("Failed to remove");

    assert_eq!(fixture.calls(), ["create", "start", "kill", "remove"]);
    assert!(!fixture.coordinator.store().exists("minikit"));
    let config = fixture.kubeconfig().read().unwrap();
    assert!(config.cluster("minikit").is_none());
    assert!(config.current_context.is_empty());
}

#[tokio::test]
async fn test_operations_on_missing_machine_are_not_found() {
    let fixture = Fixture::new();
    let err = fixture
        .coordinator
        .start("ghost", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(fixture.coordinator.stop("ghost").await.unwrap_err().is_not_found());
}

#[cfg(unix)]
#[tokio::test]
async fn test_bootstrapper_runs_on_host_without_ssh() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("bootstrapped");
    let command = format!("touch '{}'", marker.display());
    let fixture =
        Fixture::with(|c| c.with_bootstrapper(Arc::new(SshCommandBootstrapper::new(command))));
    fixture.create("minikit").await;

    fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .expect("Failed to start machine");

    assert!(marker.exists());
}

#[tokio::test]
async fn test_update_context_rewrites_server() {
    let fixture = Fixture::new();
    fixture.create("minikit").await;
    fixture
        .coordinator
        .start("minikit", &CancellationToken::new())
        .await
        .unwrap();

    let store = fixture.kubeconfig();
    let mut config = store.read().unwrap();
    config.clusters[0].cluster.server = "https://10.0.0.9:8443".to_string();
    store.write(&config).unwrap();

    fixture.coordinator.update_context("minikit").await.unwrap();
    assert_eq!(
        store.read().unwrap().cluster("minikit").unwrap().server,
        "https://127.0.0.1:8443"
    );
}
