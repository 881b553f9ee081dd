//! `swc install`: stream an image and follow the session to its end.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use swc::{Client, ClientConfig, Event, Outcome, State, StatusNotification, UpdateRequest};

use crate::OutputFormat;

/// Arguments for `swc install`.
#[derive(clap::Args)]
pub struct InstallArgs {
    /// Update image (.swu).
    pub image: PathBuf,

    /// Verify the image without installing it.
    #[arg(long)]
    pub dry_run: bool,

    /// Software set to install from the image.
    #[arg(long, value_name = "SET")]
    pub software_set: Option<String>,

    /// Running mode (e.g. copy1, copy2).
    #[arg(long, value_name = "MODE")]
    pub running_mode: Option<String>,

    /// Image bytes per frame.
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,

    /// Seconds to wait for the daemon to finish after the image is sent.
    #[arg(long, default_value_t = 600, value_name = "SECS")]
    pub timeout: u64,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

pub fn run(mut config: ClientConfig, args: InstallArgs) -> Result<()> {
    if let Some(n) = args.chunk_size {
        config = config.chunk_size(n);
    }
    let mut image = File::open(&args.image)
        .with_context(|| format!("failed to open {}", args.image.display()))?;
    let size = image.metadata().map(|m| m.len()).ok();

    let mut request = UpdateRequest::new().dry_run(args.dry_run);
    if let Some(set) = args.software_set {
        request = request.software_set(set);
    }
    if let Some(mode) = args.running_mode {
        request = request.running_mode(mode);
    }
    if let Some(size) = size {
        request = request.image_size(size);
    }

    let mut client = Client::new(config);
    crate::cancel_on_signal(client.cancel_handle())?;

    let session = client
        .start_update(request)
        .with_context(|| format!("cannot start update via {}", client.endpoint().display()))?;
    report_events(&mut client, args.format)?;

    if session.state == State::Streaming {
        stream(&mut client, &mut image, args.format)?;
    }

    let outcome = wait(&mut client, Duration::from_secs(args.timeout), args.format)?;
    print_outcome(&outcome, args.format)?;
    client.close();
    if !outcome.is_success() {
        bail!("update did not complete");
    }
    Ok(())
}

/// Feeds the image in chunks, reporting progress between them.
fn stream(client: &mut Client, image: &mut File, format: OutputFormat) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let handle = client.cancel_handle();
    loop {
        if handle.is_cancelled() || client.state() != State::Streaming {
            return Ok(());
        }
        let n = image.read(&mut buf).context("failed to read image")?;
        if n == 0 {
            client.finish_image()?;
            return Ok(());
        }
        match client.feed_chunk(&buf[..n]) {
            Ok(_) => {}
            // The session outcome is reported by `wait`.
            Err(swc::Error::Failed(_) | swc::Error::State { .. }) => return Ok(()),
            Err(e) if client.state().is_terminal() => {
                tracing::debug!(error = %e, "stream ended");
                return Ok(());
            }
            Err(e) => return Err(e).context("failed to send image"),
        }
        report_events(client, format)?;
    }
}

/// Waits for the session to end, printing events in the meantime.
fn wait(client: &mut Client, timeout: Duration, format: OutputFormat) -> Result<Outcome> {
    let slice = Duration::from_millis(250);
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(std::time::Instant::now());
        match client.wait_until_terminal(slice.min(left)) {
            Ok(outcome) => {
                report_events(client, format)?;
                return Ok(outcome);
            }
            Err(swc::Error::Timeout { .. }) if !left.is_zero() => report_events(client, format)?,
            Err(e) => return Err(e).context("waiting for the daemon"),
        }
    }
}

fn report_events(client: &mut Client, format: OutputFormat) -> Result<()> {
    // A lost connection is reported through the outcome.
    let Ok(events) = client.drain_events() else {
        return Ok(());
    };
    for ev in events {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&ev)?),
            OutputFormat::Table => match ev {
                Event::StateChanged { session, to, .. } => println!("session {session}: {to}"),
                Event::Progress(p) | Event::Unsolicited(p) => println!("{}", progress_line(&p)),
                _ => {}
            },
        }
    }
    Ok(())
}

fn print_outcome(outcome: &Outcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(outcome)?),
        OutputFormat::Table => match outcome {
            Outcome::Success { message, .. } if message.is_empty() => println!("update installed"),
            Outcome::Success { message, .. } => println!("update installed: {message}"),
            Outcome::Failed(cause) => println!("update failed: {cause}"),
            Outcome::Cancelled => println!("update cancelled"),
            _ => {}
        },
    }
    Ok(())
}

/// `[step/nsteps] percent% image (status) info`.
pub(crate) fn progress_line(p: &StatusNotification) -> String {
    let mut line = format!(
        "[{}/{}] {:>3}% {} ({:?})",
        p.cur_step, p.nsteps, p.percent, p.cur_image, p.status
    );
    if !p.info.is_empty() {
        line.push(' ');
        line.push_str(&p.info);
    }
    line
}
