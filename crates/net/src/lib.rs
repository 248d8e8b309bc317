pub mod firewall;
pub mod interfaces;
pub mod lease;
pub mod mac;

pub use firewall::{BOOTPD, Firewall, SocketFilterFirewall};
pub use interfaces::{host_has_address, host_ipv4_addresses};
