use crate::utils;
use colored::Colorize;
use std::path::Path;

pub fn handle(file: Option<&Path>) -> anyhow::Result<i32> {
    println!("{}", "Validating stack...".blue());

    let loaded = match utils::load(file, None) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ Invalid stack".red().bold());
            eprintln!("  {}", e);
            return Ok(1);
        }
    };
    let definition = &loaded.definition;
    let plan = definition.plan()?;

    println!("{}", "✓ Stack is valid".green().bold());
    println!();
    utils::print_stack_header(&loaded);
    println!("  Resource group: {}", loaded.config.resource_group);
    println!();
    println!("{}", format!("Resources ({}):", plan.len()).bold());
    for (level, ids) in plan.levels().iter().enumerate() {
        for id in ids {
            if let Some(resource) = definition.graph.get(id) {
                println!(
                    "  [{}] {} {} ({})",
                    level,
                    id.cyan(),
                    resource.name,
                    resource.resource_type.to_string().dimmed()
                );
            }
        }
    }

    match &definition.workloads {
        Some(workloads) => {
            let order = workloads.graph.plan()?;
            println!();
            println!(
                "{}",
                format!(
                    "Workloads ({} on {}):",
                    order.len(),
                    loaded.config.workloads.namespace
                )
                .bold()
            );
            for id in order.order() {
                if let Some(resource) = workloads.graph.get(id) {
                    println!("  - {} ({})", id.cyan(), resource.resource_type);
                }
            }
        }
        None if loaded.config.workloads.enabled => {}
        None => {
            println!();
            println!("{}", "Workloads: disabled".dimmed());
        }
    }

    if !definition.outputs.is_empty() {
        println!();
        println!("{}", "Outputs:".bold());
        for output in &definition.outputs {
            let marker = if output.sensitive { " (sensitive)" } else { "" };
            println!("  - {}{}", output.name, marker);
        }
    }
    Ok(0)
}
