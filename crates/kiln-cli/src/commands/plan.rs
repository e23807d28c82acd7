use super::{build_graph, json_pretty, load_spec, BuildArgs, CommandError, EXIT_SUCCESS};
use console::style;
use kiln_core::WorkerTier;
use kiln_graph::{Definition, Security};
use kiln_schema::ContentDigest;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct Stage {
    group: String,
    digest: ContentDigest,
    insecure: bool,
}

#[derive(Debug, Serialize)]
struct Plan {
    name: String,
    version: String,
    target: String,
    distro: &'static str,
    worker: WorkerTier,
    digest: ContentDigest,
    stages: Vec<Stage>,
}

/// One stage per exec node, in graph order. Ungrouped execs are listed by
/// their command.
fn stages(definition: &Definition) -> Vec<Stage> {
    definition
        .execs()
        .map(|(node, exec)| Stage {
            group: node
                .group
                .clone()
                .unwrap_or_else(|| exec.args.join(" ")),
            digest: node.digest.clone(),
            insecure: exec.security == Security::Insecure,
        })
        .collect()
}

pub fn run(spec_path: &Path, args: &BuildArgs, json: bool) -> Result<u8, CommandError> {
    let spec = load_spec(spec_path)?;
    let (worker, definition) = build_graph(&spec, args)?;

    let plan = Plan {
        name: spec.name.clone(),
        version: spec.version.clone(),
        target: args.target.clone(),
        distro: worker.distro().codename,
        worker: worker.tier(),
        digest: definition.digest(),
        stages: stages(&definition),
    };

    if json {
        println!("{}", json_pretty(&plan)?);
        return Ok(EXIT_SUCCESS);
    }

    println!(
        "{} {} for {} ({}, {})",
        style(&plan.name).bold(),
        plan.version,
        plan.target,
        plan.distro,
        plan.worker
    );
    for (i, stage) in plan.stages.iter().enumerate() {
        let marker = if stage.insecure { " [insecure]" } else { "" };
        println!(
            "  {:>2}. {}{} {}",
            i + 1,
            stage.group,
            marker,
            style(stage.digest.short()).dim()
        );
    }
    println!("result {}", style(plan.digest.short()).cyan());
    Ok(EXIT_SUCCESS)
}
