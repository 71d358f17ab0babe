use crate::RunOptions;
use crate::utils;
use colored::Colorize;
use stackflow_cloud::{StackState, StateManager, resolve_outputs};
use stackflow_core::LoadedStack;
use std::path::Path;

pub async fn handle(file: Option<&Path>, options: &RunOptions, reveal: bool) -> anyhow::Result<i32> {
    let loaded = utils::load(file, Some(options))?;
    utils::print_stack_header(&loaded);

    let state_manager = StateManager::new(utils::project_root(&loaded.path));
    let lock = state_manager.acquire_lock().await?;
    let result = match state_manager.load(&loaded.definition.name).await {
        Ok(state) => converge(&loaded, options, reveal, &state_manager, state).await,
        Err(e) => Err(e.into()),
    };
    lock.release().await?;
    result
}

async fn converge(
    loaded: &LoadedStack,
    options: &RunOptions,
    reveal: bool,
    state_manager: &StateManager,
    mut state: StackState,
) -> anyhow::Result<i32> {
    let session = utils::connect(loaded, options).await?;
    utils::cancel_on_ctrl_c(session.cancel.clone());

    println!();
    println!(
        "{}",
        format!(
            "Converging {} resources (concurrency {})...",
            loaded.definition.graph.len(),
            loaded.config.concurrency
        )
        .blue()
    );
    let printer = utils::follow_events(session.engine.events());
    let report = session.engine.apply(&loaded.definition.graph).await?;
    printer.abort();
    tracing::debug!(
        stack = %loaded.definition.name,
        summary = %report.summary(),
        "Apply finished"
    );

    let outputs = resolve_outputs(
        &loaded.definition.outputs,
        &report,
        Some(&session.credentials),
    )
    .await;

    utils::print_report(&report);
    utils::print_outputs(&outputs, reveal);
    if !reveal && outputs.iter().any(|o| o.sensitive && o.value.is_some()) {
        println!("  {}", "(run with --reveal to print sensitive outputs)".dimmed());
    }

    state.record(&report);
    if report.is_success() {
        state.set_outputs(&outputs);
    }
    state_manager.save(&state).await?;

    Ok(report.exit_code())
}
