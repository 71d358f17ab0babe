use crate::RunOptions;
use colored::Colorize;
use stackflow_cloud::{
    ApplyReport, CloudProvider, ConvergenceEngine, CredentialResolver, EngineConfig, EventBus,
    Phase, StackEvent, StackOutput, WorkloadBinder,
};
use stackflow_cloud_azure::{AzureProvider, KubeTarget};
use stackflow_core::{LoadedStack, load_stack_with_config, parse_stack_file};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr; `-v` forces debug, otherwise `RUST_LOG` or warn
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub fn stack_file(file: Option<&Path>) -> anyhow::Result<PathBuf> {
    match file {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(stackflow_config::find_stack_file()?.path),
    }
}

/// Parse the stack file, apply command-line overrides and build the graph
pub fn load(file: Option<&Path>, options: Option<&RunOptions>) -> anyhow::Result<LoadedStack> {
    let path = stack_file(file)?;
    let mut config = parse_stack_file(&path)?;
    if let Some(options) = options {
        if let Some(concurrency) = options.concurrency {
            config.concurrency = concurrency;
        }
        if options.no_workloads {
            config.workloads.enabled = false;
        }
    }
    Ok(load_stack_with_config(&path, config)?)
}

/// Directory holding `.stackflow/` for this stack file
pub fn project_root(stack_file: &Path) -> PathBuf {
    stackflow_config::project_dir_for(stack_file)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn print_stack_header(loaded: &LoadedStack) {
    println!("📄 {}", loaded.path.display().to_string().cyan());
    println!(
        "Stack: {} ({}, {})",
        loaded.definition.name.cyan(),
        loaded.definition.platform,
        loaded.config.location
    );
}

/// Engine wired to Azure, the credential resolver and the workload target
pub struct Session {
    pub engine: ConvergenceEngine,
    pub credentials: Arc<CredentialResolver>,
    pub cancel: CancellationToken,
}

pub async fn connect(loaded: &LoadedStack, options: &RunOptions) -> anyhow::Result<Session> {
    let azure = Arc::new(AzureProvider::new(options.subscription.clone()));

    println!();
    println!("{}", "Checking Azure login...".blue());
    let auth = azure.check_auth().await?;
    if !auth.authenticated {
        anyhow::bail!(
            "{}",
            auth.error.unwrap_or_else(|| "not authenticated".to_string())
        );
    }
    println!(
        "  {} {}",
        "✓".green(),
        auth.account_info.unwrap_or_default().cyan()
    );

    let config = EngineConfig::from_stack(&loaded.config);
    let cancel = CancellationToken::new();
    let credentials = Arc::new(
        CredentialResolver::new(azure.clone(), loaded.config.cluster.credential_scope)
            .with_retry(config.retry.clone())
            .with_cancellation(cancel.clone()),
    );

    let mut engine = ConvergenceEngine::new(azure, config)
        .with_credentials(credentials.clone())
        .with_cancellation(cancel.clone());
    if let Some(workloads) = &loaded.definition.workloads {
        engine = engine.with_workloads(WorkloadBinder::new(
            workloads.clone(),
            Arc::new(KubeTarget::new()),
        ));
    }

    Ok(Session {
        engine,
        credentials,
        cancel,
    })
}

/// First ctrl-c cancels the pass; in-flight resources report `Cancelled`
pub fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("{}", "Interrupted, cancelling...".yellow());
            cancel.cancel();
        }
    });
}

/// Print settlement events as they happen
pub fn follow_events(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &StackEvent) {
    match event {
        StackEvent::Started { .. } => {}
        StackEvent::Settled { id, change, .. } => {
            println!("  {} {} ({})", "✓".green(), id.cyan(), change);
        }
        StackEvent::Failed { id, error } => {
            println!("  {} {}: {}", "✗".red(), id.cyan(), error.red());
        }
        StackEvent::Blocked { id, blocked_by } => match blocked_by {
            Some(upstream) => println!("  {} {} (blocked by {})", "⊘".yellow(), id, upstream),
            None => println!("  {} {} (not started)", "⊘".yellow(), id),
        },
        StackEvent::Deleted { id } => println!("  {} {} (deleted)", "✓".green(), id.cyan()),
    }
}

pub fn print_report(report: &ApplyReport) {
    println!();
    println!("{}", "Resources:".bold());
    print_outcomes(report, 1);

    let chains = report.failure_chains();
    if !chains.is_empty() {
        println!();
        println!("{}", "Failures:".red().bold());
        for chain in &chains {
            println!("  {} {}", chain.root.red().bold(), chain.error);
            for blocked in &chain.blocked {
                println!("    └ {} blocked", blocked);
            }
        }
    }
    let unstarted = report.blocked_without_cause();
    if !unstarted.is_empty() {
        println!("  not started: {}", unstarted.join(", ").yellow());
    }

    println!();
    let summary = format!(
        "{} in {:.1}s",
        report.summary(),
        report.duration.as_secs_f64()
    );
    if report.is_success() {
        println!("{} {}", "✓".green().bold(), summary.green());
    } else {
        println!("{} {}", "✗".red().bold(), summary.red());
    }
}

fn print_outcomes(report: &ApplyReport, depth: usize) {
    let indent = "  ".repeat(depth);
    for outcome in &report.outcomes {
        let phase = outcome.phase();
        let label = match (phase, outcome.change) {
            (Phase::Settled, Some(change)) => change.to_string().green(),
            (Phase::Failed, _) => phase.to_string().red(),
            (Phase::Blocked, _) => phase.to_string().yellow(),
            _ => phase.to_string().normal(),
        };
        println!(
            "{}{:<28} {:<28} {}",
            indent,
            outcome.id,
            outcome.resource_type.to_string().dimmed(),
            label
        );
        if let Some(nested) = &outcome.nested {
            print_outcomes(nested, depth + 1);
        }
    }
}

pub fn print_outputs(outputs: &[StackOutput], reveal: bool) {
    if outputs.is_empty() {
        return;
    }
    println!();
    println!("{}", "Outputs:".bold());
    for output in outputs {
        let value = output.display_value(reveal);
        if value.contains('\n') {
            println!("  {} =", output.name.cyan());
            for line in value.lines() {
                println!("    {}", line);
            }
        } else {
            println!("  {} = {}", output.name.cyan(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_root() {
        assert_eq!(
            project_root(Path::new("/work/demo/stack.kdl")),
            PathBuf::from("/work/demo")
        );
        assert_eq!(
            project_root(Path::new("/work/demo/.stackflow/stack.kdl")),
            PathBuf::from("/work/demo")
        );
    }
}
