//! Unix process launching for the Mech layer

#[cfg(unix)]
mod line_codec;
#[cfg(unix)]
mod unix_process_manager;

#[cfg(unix)]
pub use line_codec::LossyLinesCodec;
#[cfg(unix)]
pub use unix_process_manager::{UnixProcessHandle, UnixProcessLauncher};

#[cfg(unix)]
pub struct UnixProcessLauncherFactory;

#[cfg(unix)]
impl mech_layer_core::ProcessLauncherFactory for UnixProcessLauncherFactory {
    type Launcher = UnixProcessLauncher;

    fn create_launcher() -> Self::Launcher {
        UnixProcessLauncher::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
