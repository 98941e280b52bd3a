use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{Metadata, MetadataCommand, PackageId};

/// Crates that must stay pure: no runtime, no database driver, no gateway.
const PURE_PACKAGE_NAMES: &[&str] = &["sqlgate-contracts", "sqlgate-policy"];
const FORBIDDEN_PURE_DEPENDENCIES: &[&str] = &["sqlgate-gateway", "sqlx", "tokio", "tokio-util"];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let mut failed = false;
    for package_name in PURE_PACKAGE_NAMES {
        let violations = forbidden_dependencies(&metadata, package_name)?;
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                package_name,
                FORBIDDEN_PURE_DEPENDENCIES.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                package_name,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn forbidden_dependencies(metadata: &Metadata, package_name: &str) -> Result<Vec<String>> {
    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let root = metadata
        .packages
        .iter()
        .find(|p| p.name == package_name)
        .with_context(|| format!("package `{}` not found in workspace", package_name))?;

    let id_to_name: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.as_str()))
        .collect();

    let adjacency: HashMap<_, _> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps: Vec<_> = node.deps.iter().map(|dep| dep.pkg.clone()).collect();
            (node.id.clone(), deps)
        })
        .collect();

    Ok(reachable_forbidden(
        &root.id,
        &adjacency,
        &id_to_name,
        FORBIDDEN_PURE_DEPENDENCIES,
    ))
}

/// Breadth-first walk over the resolved graph, collecting every forbidden
/// crate reachable from `root`.
fn reachable_forbidden(
    root: &PackageId,
    adjacency: &HashMap<PackageId, Vec<PackageId>>,
    id_to_name: &HashMap<PackageId, &str>,
    forbidden: &[&str],
) -> Vec<String> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.clone());
    visited.insert(root.clone());

    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(&current) else {
            continue;
        };

        for dep in deps.iter().cloned() {
            if !visited.insert(dep.clone()) {
                continue;
            }

            if let Some(name) = id_to_name.get(&dep)
                && forbidden.contains(name)
            {
                violations.push((*name).to_string());
            }

            queue.push_back(dep);
        }
    }

    violations.sort();
    violations.dedup();
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> PackageId {
        PackageId {
            repr: format!("{} 0.1.0", name),
        }
    }

    #[test]
    fn finds_transitive_forbidden_crates() {
        let names = ["policy", "helper", "tokio", "sqlparser"];
        let id_to_name: HashMap<_, _> = names.iter().map(|n| (id(n), *n)).collect();
        let adjacency: HashMap<_, _> = [
            (id("policy"), vec![id("helper"), id("sqlparser")]),
            (id("helper"), vec![id("tokio")]),
            (id("sqlparser"), vec![]),
        ]
        .into_iter()
        .collect();

        let violations = reachable_forbidden(&id("policy"), &adjacency, &id_to_name, &["tokio"]);
        assert_eq!(violations, vec!["tokio".to_string()]);
    }

    #[test]
    fn clean_graph_has_no_violations() {
        let names = ["policy", "sqlparser"];
        let id_to_name: HashMap<_, _> = names.iter().map(|n| (id(n), *n)).collect();
        let adjacency: HashMap<_, _> = [(id("policy"), vec![id("sqlparser")])]
            .into_iter()
            .collect();

        assert!(reachable_forbidden(&id("policy"), &adjacency, &id_to_name, &["sqlx"]).is_empty());
    }
}
