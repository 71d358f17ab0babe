use crate::RunOptions;
use crate::utils;
use colored::Colorize;
use stackflow_cloud::ActionType;
use std::path::Path;

pub async fn handle(file: Option<&Path>, options: &RunOptions, json: bool) -> anyhow::Result<i32> {
    let loaded = utils::load(file, Some(options))?;
    if !json {
        utils::print_stack_header(&loaded);
    }

    let session = utils::connect(&loaded, options).await?;
    let plan = session.engine.plan(&loaded.definition.graph).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    println!();
    println!("{}", "Plan:".bold());
    for action in &plan.actions {
        let symbol = match action.action_type {
            ActionType::Create => "+".green(),
            ActionType::Update => "~".yellow(),
            ActionType::Delete => "-".red(),
            ActionType::NoOp => "=".dimmed(),
            ActionType::Deferred => "?".cyan(),
        };
        println!(
            "  {} {} ({}) {}",
            symbol,
            action.resource_id.cyan(),
            action.resource_type,
            action.description.dimmed()
        );
        for (property, value) in &action.details {
            println!("      {}: {}", property, value);
        }
        for property in &action.unknown {
            println!("      {}: {}", property, "(known after apply)".dimmed());
        }
    }

    println!();
    if plan.has_changes {
        println!("{}", plan.summary().to_string().yellow());
    } else {
        println!("{}", "✓ Stack is up to date".green());
    }
    Ok(0)
}
