// Standalone agent: one base station with a stub technology layer, for controller bring-up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use emage_agent::{config, AgentHandle, Registry};
use emage_core::{AgentOps, EnbId, LocalEvent, OpsResult, TriggerKind};
use tracing::{debug, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "emage-agent", version)]
#[command(about = "eNB control agent with a stub technology layer")]
struct Cli {
    /// Path to configuration file (default: ~/.config/emage/agent.toml, then /etc/emage/agent.toml)
    #[arg(short, long, env = "EMAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Base station identifier
    #[arg(long, env = "EMAGE_ENB_ID", default_value_t = 1)]
    enb_id: EnbId,

    /// Controller address as host:port (overrides config file)
    #[arg(long)]
    controller: Option<String>,

    /// Number of cells the stub base station advertises
    #[arg(long, default_value_t = 1)]
    cells: u16,
}

/// Technology layer that answers setup requests with a textual description.
struct StubOps {
    enb_id: EnbId,
    cells: u16,
}

impl AgentOps for StubOps {
    fn init(&self) -> Result<(), emage_core::OpsError> {
        info!(enb_id = self.enb_id, cells = self.cells, "stub technology layer ready");
        Ok(())
    }

    fn release(&self) -> Result<(), emage_core::OpsError> {
        info!(enb_id = self.enb_id, "stub technology layer released");
        Ok(())
    }

    fn disconnected(&self) {
        info!(enb_id = self.enb_id, "controller lost");
    }

    fn enb_setup_request(&self) -> OpsResult {
        Ok(Some(format!("enb={} cells={}", self.enb_id, self.cells).into_bytes()))
    }

    fn cell_setup_request(&self, cell_id: u16) -> OpsResult {
        if cell_id >= self.cells {
            return Err(emage_core::OpsError::Code(-2));
        }
        Ok(Some(format!("cell={} pci={}", cell_id, 100 + u32::from(cell_id)).into_bytes()))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("emage_agent=info".parse()?)
                .add_directive("emage_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    };
    let mut controller = cfg.controller_config();
    if let Some(addr) = cli.controller {
        controller.addr = addr;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let registry = Registry::new(controller);
        let ops = Arc::new(StubOps {
            enb_id: cli.enb_id,
            cells: cli.cells,
        });
        let handle = registry.start(ops, cli.enb_id).await?;
        let stats = tokio::spawn(cell_stats_loop(handle));

        shutdown_signal().await?;
        info!("shutting down");
        stats.abort();
        registry.stop().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Every tick, emit one statistics report per armed trigger. Nothing is measured when no
/// trigger is armed.
async fn cell_stats_loop(handle: AgentHandle) {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    loop {
        ticker.tick().await;
        for trigger in handle.armed(TriggerKind::CellStats) {
            let event = LocalEvent::new(TriggerKind::CellStats, trigger.target_cell);
            let res = handle
                .report(trigger.trigger_id, event, || sample_stats(trigger.target_cell))
                .await;
            match res {
                Ok(outcome) => debug!(trigger_id = trigger.trigger_id, ?outcome, "cell stats"),
                Err(e) => warn!(trigger_id = trigger.trigger_id, error = %e, "cell stats not sent"),
            }
        }
    }
}

fn sample_stats(cell: Option<u16>) -> Vec<u8> {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("cell={} ts={} prb_dl=0 prb_ul=0", cell.unwrap_or(0), ts).into_bytes()
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
