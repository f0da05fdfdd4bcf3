//! Launches the Mech language server and bootstraps a TCP channel to it.
//!
//! [`MechLayer`] ties the platform launcher and the TCP bootstrapper into one
//! lifecycle: `start` spawns `mech serve` and begins connecting, `stop` signals
//! the server and closes the channel.

mod coordinator;
mod factory;
pub mod logging;

pub use coordinator::{LifecycleCoordinator, PendingChannel, ShutdownReport};
pub use factory::{PlatformLauncher, PlatformLauncherFactory};

// Re-export core functionality
pub use mech_layer_core::*;

/// Lifecycle coordinator for the current platform over plain TCP
pub type MechLayer = LifecycleCoordinator<PlatformLauncher, TcpConnector>;

impl MechLayer {
    /// Coordinator using the platform launcher, logging to `sink`
    pub fn platform(sink: LogSink) -> Self {
        tracing::debug!(
            "Using {} process launcher",
            <PlatformLauncherFactory as ProcessLauncherFactory>::platform_name()
        );
        LifecycleCoordinator::new(
            <PlatformLauncherFactory as ProcessLauncherFactory>::create_launcher(),
            TcpConnector,
            sink,
        )
    }
}
