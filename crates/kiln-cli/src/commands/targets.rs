use super::{json_pretty, load_spec, CommandError, EXIT_SUCCESS};
use console::style;
use kiln_core::BuildOptions;
use kiln_runtime::SUPPORTED_DISTROS;
use kiln_schema::Spec;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct TargetSummary {
    target: String,
    distro: &'static str,
    build_deps: usize,
    runtime_deps: usize,
    test_deps: usize,
    tests: usize,
    base_image: String,
}

/// Every distro codename is a target, plus the keys the spec declares.
fn target_keys(spec: &Spec) -> Vec<String> {
    let mut keys: Vec<String> = SUPPORTED_DISTROS
        .iter()
        .map(|d| d.codename.to_owned())
        .collect();
    for key in spec.targets.keys() {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    keys
}

fn summarize(spec: &Spec, options: &BuildOptions) -> Vec<TargetSummary> {
    target_keys(spec)
        .into_iter()
        .map(|target| {
            let distro = options.distro_for(&target);
            TargetSummary {
                distro: distro.codename,
                build_deps: spec.build_deps(&target).len(),
                runtime_deps: spec.runtime_deps(&target).len(),
                test_deps: spec.test_deps(&target).len(),
                tests: spec.tests_for(&target).len(),
                base_image: spec
                    .base_output_image(&target)
                    .unwrap_or(distro.default_output_image)
                    .to_owned(),
                target,
            }
        })
        .collect()
}

pub fn run(spec_path: &Path, json: bool) -> Result<u8, CommandError> {
    let spec = load_spec(spec_path)?;
    let summaries = summarize(&spec, &BuildOptions::default());

    if json {
        println!("{}", json_pretty(&summaries)?);
        return Ok(EXIT_SUCCESS);
    }

    println!(
        "{:<16} {:<8} {:>5} {:>7} {:>5} {:>5}  IMAGE",
        "TARGET", "DISTRO", "BUILD", "RUNTIME", "TEST", "TESTS"
    );
    for s in &summaries {
        println!(
            "{:<16} {:<8} {:>5} {:>7} {:>5} {:>5}  {}",
            style(&s.target).bold(),
            s.distro,
            s.build_deps,
            s.runtime_deps,
            s.test_deps,
            s.tests,
            style(&s.base_image).dim()
        );
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::parse_spec_str;

    const SPEC: &str = r#"
name = "foo"
version = "1.0"

[dependencies.build]
make = {}

[targets.slim.image]
base = "example.com/slim:1"

[[targets.slim.tests]]
name = "smoke"
steps = [{ command = "true" }]

[targets.focal.dependencies.build]
make = {}
gcc = {}
"#;

    #[test]
    fn distros_come_first_and_keys_are_not_repeated() {
        let spec = parse_spec_str(SPEC).unwrap();
        assert_eq!(target_keys(&spec), ["jammy", "focal", "slim"]);
    }

    #[test]
    fn summaries_resolve_per_target() {
        let spec = parse_spec_str(SPEC).unwrap();
        let summaries = summarize(&spec, &BuildOptions::default());

        let focal = &summaries[1];
        assert_eq!(focal.distro, "focal");
        assert_eq!(focal.build_deps, 2);

        let slim = &summaries[2];
        assert_eq!(slim.distro, "jammy");
        assert_eq!(slim.build_deps, 1);
        assert_eq!(slim.tests, 1);
        assert_eq!(slim.base_image, "example.com/slim:1");
    }
}
