//! `swc monitor`: print progress the daemon broadcasts.

use std::time::Duration;

use anyhow::{Context, Result};
use swc::{Client, ClientConfig, Event, UnsolicitedPolicy};

use crate::OutputFormat;
use crate::install::progress_line;

/// Arguments for `swc monitor`.
#[derive(clap::Args)]
pub struct MonitorArgs {
    /// Exit after the first final status (success, failure, done).
    #[arg(long)]
    pub once: bool,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

pub fn run(config: ClientConfig, args: MonitorArgs) -> Result<()> {
    let mut client = Client::new(config.unsolicited(UnsolicitedPolicy::Surface));
    client
        .connect()
        .with_context(|| format!("cannot monitor {}", client.endpoint().display()))?;

    loop {
        let event = match client.next_event(Duration::from_secs(1)) {
            Ok(Some(ev)) => ev,
            Ok(None) => continue,
            Err(swc::Error::ConnectionLost) => {
                eprintln!("daemon closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e).context("monitoring failed"),
        };
        let (Event::Progress(p) | Event::Unsolicited(p)) = event else {
            continue;
        };
        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&p)?),
            OutputFormat::Table => println!("{}", progress_line(&p)),
        }
        if args.once && p.status.is_final() {
            return Ok(());
        }
    }
}
