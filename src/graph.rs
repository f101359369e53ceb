//! Phase dependency ordering

use crate::StructuralError;
use std::collections::{BTreeSet, HashMap};

/// Topological order over `(name, depends_on)` nodes, as indices into `nodes`.
///
/// Among phases that are ready at the same time, the one declared first runs
/// first. Unknown dependencies, duplicate names and cycles are rejected.
pub fn execution_order<N, D>(nodes: &[(N, Vec<D>)]) -> Result<Vec<usize>, StructuralError>
where
    N: AsRef<str>,
    D: AsRef<str>,
{
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (i, (name, _)) in nodes.iter().enumerate() {
        if index.insert(name.as_ref(), i).is_some() {
            return Err(StructuralError::DuplicatePhase(name.as_ref().to_string()));
        }
    }

    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, (name, deps)) in nodes.iter().enumerate() {
        for dep in deps {
            let Some(&d) = index.get(dep.as_ref()) else {
                return Err(StructuralError::UnknownDependency {
                    phase: name.as_ref().to_string(),
                    dependency: dep.as_ref().to_string(),
                });
            };
            dependents[d].push(i);
            in_degree[i] += 1;
        }
    }

    // Ordered by declaration index
    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck = (0..nodes.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| nodes[i].0.as_ref().to_string())
            .collect();
        return Err(StructuralError::Cycle(stuck));
    }

    Ok(order)
}
