use anyhow::Result;
use clap::Parser;

use crate::monitor::{self, MonitorCliArgs, MonitorConfig};

/// Restricted-zone camera monitor with throttled Telegram alerts.
#[derive(Debug, Parser)]
#[command(name = "falcon-eye", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub monitor: MonitorCliArgs,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = MonitorConfig::try_from(cli.monitor)?;
    monitor::run(config)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
