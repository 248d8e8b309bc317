pub mod driver;
pub mod error;
pub mod exec;
pub mod host;
pub mod poll;
pub mod process;
pub mod seed;
pub mod ssh;
pub mod types;
pub mod version;

pub use driver::Driver;
pub use error::{Error, ErrorKind, Result};
pub use poll::RetryPolicy;
pub use process::ChildProcess;
pub use ssh::SshClient;
pub use types::{
    BootImage, DriverKind, HypervOptions, MachineConfig, MachineState, MountSpec, NetworkMode,
    ResourceConfig, SshConfig, VfkitOptions,
};
