mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use browsewire::{
    BatchOptions, BatchOutcome, BrowserFamily, ClientConfig, Interaction, OptimizedClient,
    Operation, SessionMode, SnapshotPolicy,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "browsewire")]
#[command(about = "Drive a browser-automation server over stdio", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show the browser window instead of running headless
    #[arg(long, global = true)]
    visible: bool,

    /// Browser family (chromium, chrome, firefox, webkit, msedge)
    #[arg(long, global = true)]
    browser: Option<BrowserFamily>,

    /// Snapshot policy (always, never, final_only, smart)
    #[arg(long, global = true)]
    policy: Option<SnapshotPolicy>,

    /// Session mode (always_run, on_demand)
    #[arg(long, global = true)]
    mode: Option<SessionMode>,

    /// Batches smaller than this log an advisory
    #[arg(long, global = true)]
    batch_threshold: Option<usize>,

    /// Per-call timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<f64>,

    /// Disable metrics collection
    #[arg(long, global = true)]
    no_metrics: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one tool call
    Call {
        /// Tool name, short (navigate) or remote (browser_navigate)
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Run a JSON array of {tool, arguments} operations in order
    Batch {
        file: PathBuf,

        /// Keep going after a failing step
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Navigate to a URL, then run click/fill/select steps
    Interact {
        url: String,

        /// JSON array of {action, selector, value?} steps
        #[arg(short, long)]
        steps: Option<PathBuf>,
    },

    /// List the tools the server advertises
    Tools,
}

/// One entry of a batch file.
#[derive(Debug, Deserialize)]
struct BatchEntry {
    tool: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Serialize)]
struct Report<T: Serialize> {
    output: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<browsewire::MetricsSummary>,
}

fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env().context("invalid BROWSEWIRE_* environment")?;
    if cli.visible {
        config = config.with_headless(false);
    }
    if let Some(browser) = cli.browser {
        config = config.with_browser(browser);
    }
    if let Some(policy) = cli.policy {
        config = config.with_snapshot_policy(policy);
    }
    if let Some(mode) = cli.mode {
        config = config.with_session_mode(mode);
    }
    if let Some(threshold) = cli.batch_threshold {
        config = config.with_batch_threshold(threshold);
    }
    if let Some(secs) = cli.timeout {
        let timeout = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("invalid --timeout {secs}"))?;
        config = config.with_call_timeout(timeout);
    }
    if cli.no_metrics {
        config = config.with_metrics(false);
    }
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_report<T: Serialize>(client: &OptimizedClient, output: T, show_metrics: bool) -> Result<()> {
    let report = Report {
        output,
        metrics: show_metrics.then(|| client.get_metrics()),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(cli: &Cli, client: &OptimizedClient) -> Result<bool> {
    let show_metrics = !cli.no_metrics;

    match &cli.command {
        Commands::Call { tool, args } => {
            let arguments: Value =
                serde_json::from_str(args).context("--args must be a JSON document")?;
            let result = client
                .call(tool, arguments)
                .await
                .with_context(|| format!("tool '{tool}' failed"))?;
            print_report(client, result, show_metrics)?;
            Ok(true)
        }
        Commands::Batch {
            file,
            continue_on_error,
        } => {
            let entries: Vec<BatchEntry> = read_json(file)?;
            let operations = entries
                .into_iter()
                .enumerate()
                .map(|(i, entry)| {
                    Operation::parse(&entry.tool, entry.arguments)
                        .with_context(|| format!("operation {i} ('{}')", entry.tool))
                })
                .collect::<Result<Vec<_>>>()?;
            let outcome = client
                .execute_batch_with(
                    operations,
                    BatchOptions {
                        continue_on_error: *continue_on_error,
                    },
                )
                .await;
            report_batch(client, outcome, show_metrics)
        }
        Commands::Interact { url, steps } => {
            let interactions: Vec<Interaction> = match steps {
                Some(path) => read_json(path)?,
                None => Vec::new(),
            };
            let outcome = client.navigate_and_interact(url, interactions).await;
            report_batch(client, outcome, show_metrics)
        }
        Commands::Tools => {
            let tools = client.list_tools().await.context("failed to list tools")?;
            print_report(client, tools, false)?;
            Ok(true)
        }
    }
}

fn report_batch(client: &OptimizedClient, outcome: BatchOutcome, show_metrics: bool) -> Result<bool> {
    for failure in &outcome.failures {
        tracing::error!(index = failure.index, tool = %failure.tool, error = %failure.error, "Step failed");
    }
    let success = outcome.is_success();
    print_report(client, outcome, show_metrics)?;
    Ok(success)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let config = build_config(&cli)?;
    tracing::debug!(
        browser = %config.browser,
        headless = config.headless,
        policy = %config.snapshot_policy,
        mode = %config.session_mode,
        "Starting browsewire"
    );
    let client = OptimizedClient::from_config(config);

    let outcome = run(&cli, &client).await;
    client.shutdown().await;

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_override_config() {
        let cli = Cli::parse_from([
            "browsewire",
            "--visible",
            "--browser",
            "firefox",
            "--policy",
            "final_only",
            "--mode",
            "on-demand",
            "--no-metrics",
            "tools",
        ]);
        let config = build_config(&cli).unwrap();
        assert!(!config.headless);
        assert_eq!(config.browser, BrowserFamily::Firefox);
        assert_eq!(config.snapshot_policy, SnapshotPolicy::FinalOnly);
        assert_eq!(config.session_mode, SessionMode::OnDemand);
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn batch_entries_default_arguments() {
        let entries: Vec<BatchEntry> =
            serde_json::from_str(r##"[{"tool": "snapshot"}, {"tool": "click", "arguments": {"selector": "#a"}}]"##)
                .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].arguments.is_null());
        assert!(Operation::parse(&entries[1].tool, entries[1].arguments.clone()).is_ok());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
