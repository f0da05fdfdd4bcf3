use mech_layer_core::ProcessLauncherFactory;

#[cfg(not(unix))]
compile_error!("Unsupported platform: only Unix is currently supported");

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformLauncherFactory;

impl ProcessLauncherFactory for PlatformLauncherFactory {
    #[cfg(unix)]
    type Launcher = mech_layer_unix::UnixProcessLauncher;

    fn create_launcher() -> Self::Launcher {
        #[cfg(unix)]
        return mech_layer_unix::UnixProcessLauncherFactory::create_launcher();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return mech_layer_unix::UnixProcessLauncherFactory::platform_name();
    }
}

/// Launcher type for the current platform
pub type PlatformLauncher = <PlatformLauncherFactory as ProcessLauncherFactory>::Launcher;
