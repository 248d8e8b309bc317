//! The `version` command - shows version information.

pub fn run() {
    println!("minikit {}", env!("CARGO_PKG_VERSION"));
}
