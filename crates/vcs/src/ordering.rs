//! Dependency ordering for units of work.

use std::collections::{BTreeSet, HashMap};

use autopilot_core::WorkUnit;

use crate::error::{Result, VcsError};

/// Topologically sort units (Kahn's algorithm).
///
/// Among units whose dependencies are satisfied, input order is kept, so an
/// already-ordered list comes back unchanged.
pub fn dependency_order(units: &[WorkUnit]) -> Result<Vec<WorkUnit>> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(units.len());
    for (i, unit) in units.iter().enumerate() {
        if index.insert(unit.id.as_str(), i).is_some() {
            return Err(VcsError::DuplicateUnit(unit.id.clone()));
        }
    }

    let mut indegree = vec![0usize; units.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); units.len()];
    for (i, unit) in units.iter().enumerate() {
        for dependency in &unit.depends_on {
            let d = *index
                .get(dependency.as_str())
                .ok_or_else(|| VcsError::UnknownDependency {
                    unit: unit.id.clone(),
                    dependency: dependency.clone(),
                })?;
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..units.len()).filter(|&i| indegree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(units.len());

    while let Some(next) = ready.pop_first() {
        ordered.push(units[next].clone());
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if ordered.len() != units.len() {
        let stuck = (0..units.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| units[i].id.clone())
            .collect();
        return Err(VcsError::DependencyCycle(stuck));
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(units: &[WorkUnit]) -> Vec<&str> {
        units.iter().map(|u| u.id.as_str()).collect()
    }

    #[test]
    fn test_respects_dependencies() {
        let units = vec![
            WorkUnit::new("api").depends_on(&["schema"]),
            WorkUnit::new("ui").depends_on(&["api"]),
            WorkUnit::new("schema"),
        ];
        let ordered = dependency_order(&units).unwrap();
        assert_eq!(ids(&ordered), vec!["schema", "api", "ui"]);
    }

    #[test]
    fn test_independent_units_keep_input_order() {
        let units = vec![WorkUnit::new("b"), WorkUnit::new("a"), WorkUnit::new("c")];
        let ordered = dependency_order(&units).unwrap();
        assert_eq!(ids(&ordered), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cycle_is_error() {
        let units = vec![
            WorkUnit::new("a").depends_on(&["b"]),
            WorkUnit::new("b").depends_on(&["a"]),
            WorkUnit::new("c"),
        ];
        match dependency_order(&units) {
            Err(VcsError::DependencyCycle(stuck)) => {
                assert_eq!(stuck, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let units = vec![WorkUnit::new("a").depends_on(&["a"])];
        assert!(matches!(
            dependency_order(&units),
            Err(VcsError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let units = vec![WorkUnit::new("a").depends_on(&["ghost"])];
        assert!(matches!(
            dependency_order(&units),
            Err(VcsError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_unit() {
        let units = vec![WorkUnit::new("a"), WorkUnit::new("a")];
        assert!(matches!(
            dependency_order(&units),
            Err(VcsError::DuplicateUnit(_))
        ));
    }
}
