mod channel;
mod config;
mod dashboard;
mod files;
mod log_buffer;
mod reconcile;
mod retry;
mod runner;
mod sampler;
mod signals;

use anyhow::{bail, Context, Result};
use channel::telegram::TelegramChannel;
use channel::{CommandInbox, RemoteChannel};
use clap::Parser;
use config::WrapperConfig;
use reconcile::Reconciler;
use runner::{CommandSpec, ProcessRunner};
use sampler::{spawn_sampling, AcceleratorProbe, ResourceSampler};
use signals::SignalHandler;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Capacity of the inbound command queue.
const COMMAND_QUEUE: usize = 32;

/// Run a command and mirror its live output, status, and host load to a
/// Telegram dashboard with Refresh / Terminate / Close / Download buttons.
#[derive(Parser, Debug)]
#[command(name = "telewrap", version, about)]
pub struct Cli {
    /// Command to run. A single quoted argument containing spaces runs through
    /// the shell, so a missing program there shows up as exit code 127 rather
    /// than a start failure.
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Telegram bot token (overrides config and TELEGRAM_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Telegram chat id (overrides config and TELEGRAM_CHAT_ID)
    #[arg(long)]
    chat_id: Option<String>,

    /// Config file path (TOML, or YAML by extension; default: ./telewrap.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between dashboard updates (overrides config)
    #[arg(long)]
    interval: Option<f64>,

    /// Check Telegram connectivity and resource sampling, then exit
    #[arg(long)]
    test: bool,

    /// Extra logging (push decisions, inbound commands)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "telewrap=debug"
    } else if cli.quiet {
        "telewrap=warn"
    } else {
        "telewrap=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Child output is echoed on stdout; keep diagnostics on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;

    let mut config = WrapperConfig::discover(cli.config.as_deref(), &cwd)?;
    config.apply_env(|name| std::env::var(name).ok());
    if let Some(token) = cli.token {
        config.telegram.token = Some(token);
    }
    if let Some(chat_id) = cli.chat_id {
        config.telegram.chat_id = Some(chat_id);
    }
    if let Some(interval) = cli.interval {
        config.settings.update_interval = interval;
    }
    let credentials = config.credentials()?;

    let sampler = ResourceSampler::new(AcceleratorProbe::nvidia_smi())
        .context("cannot read CPU/RAM usage on this host")?;
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let session = new_session_id();
    let channel = Arc::new(TelegramChannel::new(
        &credentials.token,
        credentials.chat_id,
        session.clone(),
    ));

    if cli.test {
        return Ok(connectivity_check(&channel, sampler, &host).await);
    }

    let Some(command) = CommandSpec::from_args(&cli.command) else {
        bail!("no command given, e.g. telewrap \"python train.py --epochs 3\"");
    };

    let settings = config.loop_settings(&cwd);
    let (resources, sampling) = spawn_sampling(sampler, settings.update_interval);
    let (tx, inbox) = CommandInbox::bounded(COMMAND_QUEUE);
    let listener = channel.spawn_listener(tx.clone());
    let signals = SignalHandler::install(tx);
    let runner = ProcessRunner::new(config.settings.channel, &cwd);

    tracing::info!(
        session = %session,
        host = %host,
        command = %command.display,
        interval_ms = settings.update_interval.as_millis() as u64,
        "telewrap starting"
    );

    let reconciler = Reconciler::new(
        channel,
        inbox,
        resources,
        runner,
        command,
        host,
        settings,
    );
    let outcome = reconciler.run().await;

    signals.uninstall();
    listener.shutdown().await;
    sampling.abort();

    tracing::info!(?outcome, "telewrap finished");
    Ok(outcome.exit_code())
}

/// Eight hex characters, enough to tell concurrent runs in one chat apart.
fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Post a message, edit it with a resource sample, report on stdout.
async fn connectivity_check(
    channel: &TelegramChannel,
    mut sampler: ResourceSampler,
    host: &str,
) -> i32 {
    println!("Testing Telegram connectivity from {host}...");

    match channel.bot_username().await {
        Ok(name) => println!("  bot: @{name}"),
        Err(e) => {
            println!("❌ token rejected or Telegram unreachable: {e}");
            return 1;
        }
    }

    let reference = match channel
        .push_or_edit(None, &dashboard::render_connectivity_check(host, None))
        .await
    {
        Ok(reference) => reference,
        Err(e) => {
            println!("❌ could not post to chat: {e}");
            return 1;
        }
    };
    println!("  posted message {}", reference.message_id);

    let snapshot = sampler.sample().await;
    let checked_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let edited = dashboard::render_connectivity_check(host, Some((&snapshot, &checked_at)));
    if let Err(e) = channel.push_or_edit(Some(&reference), &edited).await {
        println!("❌ could not edit message: {e}");
        return 1;
    }

    println!(
        "✅ OK (channel: {}, CPU: {:.1}%, RAM: {:.1}%, GPUs: {})",
        channel.name(),
        snapshot.cpu_percent,
        snapshot.ram_percent,
        snapshot.accelerators.len()
    );
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_trailing_command_keeps_flags() {
        let cli = Cli::try_parse_from([
            "telewrap",
            "--interval",
            "2",
            "python",
            "train.py",
            "--epochs",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.interval, Some(2.0));
        assert_eq!(cli.command, vec!["python", "train.py", "--epochs", "3"]);
    }

    #[test]
    fn test_cli_single_shell_string() {
        let cli = Cli::try_parse_from(["telewrap", "--chat-id", "42", "make all && ls"]).unwrap();
        assert_eq!(cli.chat_id.as_deref(), Some("42"));
        let spec = CommandSpec::from_args(&cli.command).unwrap();
        assert_eq!(spec.display, "make all && ls");
    }

    #[test]
    fn test_cli_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["telewrap", "-v", "-q", "ls"]).is_err());
    }

    #[test]
    fn test_help_explains_shell_mode_exit_code() {
        use clap::CommandFactory;
        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("127"));
    }

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_session_id());
    }
}
