//! The `drivers` command - lists drivers and whether this host can run them.

use minikit::supported_on_host;
use minikit_core::DriverKind;

pub fn run() {
    println!("Drivers:");
    for kind in DriverKind::ALL {
        let status = if supported_on_host(kind) {
            "supported"
        } else {
            "not supported on this host"
        };
        println!("  {:<10} {status}", kind.as_str());
    }
}
