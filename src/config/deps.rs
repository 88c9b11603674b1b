//! Dependency resolution for service startup.

use crate::config::Service;
use crate::error::LoklError;
use anyhow::Result;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

/// Return service names in start order using a topological sort.
///
/// Services with no dependencies come first, then their dependents. Ties
/// are broken lexicographically, so the order is stable for a given
/// project file.
pub fn sort_by_dependency(services: &BTreeMap<String, Service>) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> =
        services.keys().map(|name| (name.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, svc) in services {
        for dep in &svc.depends_on {
            if !services.contains_key(dep) {
                return Err(LoklError::config(format!(
                    "service {name:?} depends on unknown service {dep:?}"
                ))
                .into());
            }
            *in_degree.entry(name.as_str()).or_default() += 1;
            dependents.entry(dep.as_str()).or_default().push(name);
        }
    }

    // Min-heap on the name keeps candidate selection deterministic.
    let mut queue: BinaryHeap<Reverse<&str>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| Reverse(*name))
        .collect();

    let mut result = Vec::with_capacity(services.len());
    while let Some(Reverse(name)) = queue.pop() {
        result.push(name.to_string());

        for dependent in dependents.remove(name).unwrap_or_default() {
            let degree = in_degree.entry(dependent).or_default();
            *degree -= 1;
            if *degree == 0 {
                queue.push(Reverse(dependent));
            }
        }
    }

    if result.len() != services.len() {
        return Err(LoklError::config("circular dependency detected").into());
    }

    Ok(result)
}

/// Expand a user-selected subset of services with its transitive
/// dependencies, for `up [services...]`.
pub fn expand_with_dependencies(
    services: &BTreeMap<String, Service>,
    selection: &[String],
) -> Result<BTreeSet<String>> {
    let mut expanded = BTreeSet::new();
    let mut stack: Vec<&str> = Vec::new();

    for name in selection {
        if !services.contains_key(name) {
            return Err(LoklError::config(format!("unknown service: {name}")).into());
        }
        stack.push(name);
    }

    while let Some(name) = stack.pop() {
        if !expanded.insert(name.to_string()) {
            continue;
        }
        if let Some(svc) = services.get(name) {
            stack.extend(svc.depends_on.iter().map(String::as_str));
        }
    }

    Ok(expanded)
}
