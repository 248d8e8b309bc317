//! Single-node cluster provisioning: hypervisor backends, the machine
//! registry and the lifecycle coordinator.
//!
//! ```no_run
//! # async fn demo() -> minikit_core::Result<()> {
//! use minikit::{Coordinator, MachineStore};
//! use minikit_core::DriverKind;
//! use minikit_kubeconfig::KubeconfigStore;
//! use tokio_util::sync::CancellationToken;
//!
//! let store = MachineStore::new(minikit::machine::default_base()?);
//! let mut config = store.new_config("minikit", DriverKind::Vfkit);
//! config.boot_image.path = "/tmp/boot2docker.iso".into();
//!
//! let coordinator = Coordinator::new(store, KubeconfigStore::from_env()?);
//! coordinator.create(config).await?;
//! let ip = coordinator.start("minikit", &CancellationToken::new()).await?;
//! println!("cluster reachable at {ip}");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bootstrap;
pub mod lifecycle;
pub mod machine;

pub use backend::{HostDrivers, select_driver, supported_on_host};
pub use bootstrap::{Bootstrapper, NoopBootstrapper, SshCommandBootstrapper};
pub use lifecycle::{AutoConsent, Consent, Coordinator, CoordinatorOptions, DriverFactory};
pub use machine::MachineStore;
