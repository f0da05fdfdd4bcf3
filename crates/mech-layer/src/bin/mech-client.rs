//! Starts `mech serve` and bridges this process's stdin/stdout to it.
//!
//! Editors talk to language servers over stdio; the Mech server listens on
//! TCP. This binary sits in between and owns the server's lifecycle.

use anyhow::Context;
use clap::Parser;
use mech_layer::logging::init_tracing;
use mech_layer::{Channel, Endpoint, LauncherConfig, LogSink, MechLayer, RetryConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "mech-client",
    version,
    about = "Launch the Mech language server and bridge stdio to it"
)]
struct Cli {
    /// Installation root containing server/target/debug/mech
    #[arg(long, env = "MECH_INSTALL_ROOT", default_value = ".")]
    install_root: PathBuf,

    /// Server executable, overriding the one under the installation root
    #[arg(long, env = "MECH_SERVER_COMMAND")]
    command: Option<PathBuf>,

    #[arg(long, env = "MECH_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "MECH_PORT", default_value_t = 8081)]
    port: u16,

    /// Connection retries after the first refused attempt
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,

    /// Stop retrying once the server process has exited
    #[arg(long)]
    abort_on_exit: bool,

    /// Emit tracing output as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn launcher_config(&self) -> anyhow::Result<LauncherConfig> {
        let defaults = LauncherConfig::for_install_root(&self.install_root);
        let retry = RetryConfig::default()
            .with_max_retries(self.max_retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
            .with_abort_on_process_exit(self.abort_on_exit);

        let config = LauncherConfig::builder()
            .command(self.command.clone().unwrap_or(defaults.command))
            .args(defaults.args)
            .endpoint(Endpoint::new(self.host.clone(), self.port))
            .retry_config(retry)
            .build()
            .context("invalid launcher configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;
    let config = cli.launcher_config()?;

    let mut layer = MechLayer::platform(LogSink::stderr());
    let pending = layer.start(config).context("failed to start mech server")?;

    let result = tokio::select! {
        channel = pending.wait() => match channel {
            Ok(channel) => bridge(channel).await,
            Err(e) => Err(anyhow::Error::new(e).context("could not connect to mech server")),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the server became reachable");
            Ok(())
        }
    };

    layer.stop().await;
    result
}

/// Pump bytes between stdio and the channel until either side closes
async fn bridge(channel: Channel) -> anyhow::Result<()> {
    info!(peer = channel.peer(), "Bridging stdio to mech server");
    let (mut reader, mut writer, closer) = channel.into_split();

    let upstream = async {
        tokio::io::copy(&mut tokio::io::stdin(), &mut writer).await?;
        writer.shutdown().await
    };
    let downstream = async {
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut reader, &mut stdout).await?;
        stdout.flush().await
    };

    let outcome = tokio::select! {
        result = upstream => result.context("forwarding stdin to the server failed"),
        result = downstream => result.context("forwarding server output to stdout failed"),
        _ = closer.closed() => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    closer.close();
    info!("Channel closed");
    outcome
}
