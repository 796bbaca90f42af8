//! Network-facing runtime layer: transports, link/graph bookkeeping, the
//! device aggregate, and its poll thread. Everything that opens a socket
//! lives here; the data model and algorithms live in `mapper-core`.

pub mod config;
pub mod device;
pub mod graph;
pub mod link;
pub mod network;
pub mod thread;

pub use device::Device;

/// Install a `tracing` subscriber for an embedding application, mirroring
/// the teacher's `main.rs` setup minus the async runtime this crate
/// doesn't use. `RUST_LOG` controls verbosity; defaults to `info`.
/// Safe to call more than once (a later call is a no-op) so tests in
/// different files can each call it without racing over the global
/// subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}
