use crate::utils;
use colored::Colorize;
use stackflow_cloud::StateManager;
use std::path::Path;

pub async fn handle(file: Option<&Path>, json: bool) -> anyhow::Result<i32> {
    let loaded = utils::load(file, None)?;
    let state_manager = StateManager::new(utils::project_root(&loaded.path));
    let state = state_manager.load(&loaded.definition.name).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state.outputs)?);
        return Ok(0);
    }

    if state.outputs.is_empty() {
        println!("{}", "No outputs recorded yet. Run `stackflow up` first.".yellow());
        return Ok(0);
    }

    println!(
        "Outputs of {} (updated {}):",
        loaded.definition.name.cyan(),
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for (name, value) in &state.outputs {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        println!("  {} = {}", name.cyan(), value);
    }
    Ok(0)
}
