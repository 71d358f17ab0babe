use crate::RunOptions;
use crate::utils;
use colored::Colorize;
use stackflow_cloud::StateManager;
use std::path::Path;

pub async fn handle(file: Option<&Path>, options: &RunOptions, yes: bool) -> anyhow::Result<i32> {
    let loaded = utils::load(file, Some(options))?;
    utils::print_stack_header(&loaded);

    let order = loaded.definition.plan()?.reversed();
    println!();
    println!("{}", "Resources to delete, in order:".bold());
    for id in &order {
        if let Some(resource) = loaded.definition.graph.get(id) {
            println!("  - {} ({})", id.red(), resource.name);
        }
    }

    if !yes {
        println!();
        println!("{}", "⚠ This deletes every resource listed above.".yellow().bold());
        println!("Run again with --yes to proceed");
        return Ok(0);
    }

    let state_manager = StateManager::new(utils::project_root(&loaded.path));
    let lock = state_manager.acquire_lock().await?;
    let result = async {
        let mut state = state_manager.load(&loaded.definition.name).await?;
        let session = utils::connect(&loaded, options).await?;
        utils::cancel_on_ctrl_c(session.cancel.clone());

        println!();
        println!("{}", "Destroying stack...".yellow());
        let printer = utils::follow_events(session.engine.events());
        let report = session.engine.destroy(&loaded.definition.graph).await?;
        printer.abort();

        utils::print_report(&report);

        state.record(&report);
        state_manager.save(&state).await?;
        anyhow::Ok(report.exit_code())
    }
    .await;
    lock.release().await?;
    result
}
