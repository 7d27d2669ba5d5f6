//! Compiles an `ExecutionStrategy` plus a target list into an ordered list
//! of execution stages. Pure, deterministic, no I/O — mirrors the shape of
//! the schedule evaluator and is unit tested the same way.

use std::collections::BTreeMap;

use hibernator_types::{DagEdge, ExecutionStrategy, Operation, StageSpec, TargetSpec};

use crate::util::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub targets: Vec<String>,
    pub max_concurrency: Option<u32>,
}

pub fn compile(
    strategy: &ExecutionStrategy,
    targets: &[TargetSpec],
    operation: Operation,
) -> Result<Vec<Stage>, Error> {
    match strategy {
        ExecutionStrategy::Sequential => Ok(sequential_stages(targets)),
        ExecutionStrategy::Parallel { max_concurrency } => Ok(vec![Stage {
            name: "parallel".to_string(),
            targets: sorted_names(targets),
            max_concurrency: *max_concurrency,
        }]),
        ExecutionStrategy::Staged {
            stages,
            max_concurrency: _,
        } => Ok(staged_stages(stages)),
        ExecutionStrategy::Dag {
            dependencies,
            max_concurrency,
        } => dag_stages(targets, dependencies, operation, *max_concurrency),
    }
}

fn sorted_names(targets: &[TargetSpec]) -> Vec<String> {
    let mut names: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
    names.sort();
    names
}

fn sequential_stages(targets: &[TargetSpec]) -> Vec<Stage> {
    targets
        .iter()
        .map(|t| Stage {
            name: t.name.clone(),
            targets: vec![t.name.clone()],
            max_concurrency: Some(1),
        })
        .collect()
}

fn staged_stages(stages: &[StageSpec]) -> Vec<Stage> {
    stages
        .iter()
        .map(|s| {
            let mut targets = s.targets.clone();
            targets.sort();
            let max_concurrency = if s.parallel.unwrap_or(true) {
                s.max_concurrency
            } else {
                Some(1)
            };
            Stage {
                name: s.name.clone(),
                targets,
                max_concurrency,
            }
        })
        .collect()
}

/// Topologically layers the targets by dependency depth, reversing every
/// edge for `operation=Wakeup`. Each layer (equal-depth set) becomes one
/// stage. Admission is expected to have rejected cycles already; this still
/// detects them defensively rather than looping forever.
fn dag_stages(
    targets: &[TargetSpec],
    dependencies: &[DagEdge],
    operation: Operation,
    max_concurrency: Option<u32>,
) -> Result<Vec<Stage>, Error> {
    let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut indegree: BTreeMap<String, u32> = targets.iter().map(|t| (t.name.clone(), 0)).collect();

    for edge in dependencies {
        let (from, to) = match operation {
            Operation::Shutdown => (edge.from.clone(), edge.to.clone()),
            Operation::Wakeup => (edge.to.clone(), edge.from.clone()),
        };
        adjacency.entry(from).or_default().push(to.clone());
        *indegree.entry(to).or_insert(0) += 1;
    }

    let mut remaining = indegree;
    let mut stages = Vec::new();
    let total = targets.len();
    let mut placed = 0usize;

    while placed < total {
        let mut layer: Vec<String> = remaining
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(name, _)| name.clone())
            .collect();
        if layer.is_empty() {
            return Err(Error::Configuration(
                "dependency cycle detected in DAG strategy".to_string(),
            ));
        }
        layer.sort();
        for name in &layer {
            remaining.remove(name);
        }
        for name in &layer {
            if let Some(next) = adjacency.get(name) {
                for n in next {
                    if let Some(deg) = remaining.get_mut(n) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
        }
        placed += layer.len();
        stages.push(Stage {
            name: format!("stage-{}", stages.len()),
            targets: layer,
            max_concurrency,
        });
    }

    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> TargetSpec {
        TargetSpec {
            name: name.to_string(),
            target_type: "rds".to_string(),
            connector_ref: "conn".to_string(),
            parameters: Default::default(),
        }
    }

    #[test]
    fn sequential_is_one_stage_per_target_in_order() {
        let targets = vec![target("b"), target("a")];
        let stages = compile(&ExecutionStrategy::Sequential, &targets, Operation::Shutdown).unwrap();
        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(stages.iter().all(|s| s.max_concurrency == Some(1)));
    }

    #[test]
    fn parallel_is_a_single_stage_with_all_targets_sorted() {
        let targets = vec![target("b"), target("a")];
        let stages = compile(
            &ExecutionStrategy::Parallel {
                max_concurrency: Some(2),
            },
            &targets,
            Operation::Shutdown,
        )
        .unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].targets, vec!["a", "b"]);
        assert_eq!(stages[0].max_concurrency, Some(2));
    }

    #[test]
    fn dag_order_reverses_on_wakeup() {
        let targets = vec![target("web"), target("app"), target("db")];
        let deps = vec![
            DagEdge {
                from: "web".to_string(),
                to: "app".to_string(),
            },
            DagEdge {
                from: "app".to_string(),
                to: "db".to_string(),
            },
        ];
        let strategy = ExecutionStrategy::Dag {
            dependencies: deps,
            max_concurrency: None,
        };

        let shutdown = compile(&strategy, &targets, Operation::Shutdown).unwrap();
        let shutdown_order: Vec<&str> = shutdown.iter().flat_map(|s| s.targets.iter()).map(|s| s.as_str()).collect();
        assert_eq!(shutdown_order, vec!["web", "app", "db"]);

        let wakeup = compile(&strategy, &targets, Operation::Wakeup).unwrap();
        let wakeup_order: Vec<&str> = wakeup.iter().flat_map(|s| s.targets.iter()).map(|s| s.as_str()).collect();
        assert_eq!(wakeup_order, vec!["db", "app", "web"]);
    }

    #[test]
    fn dag_cycle_is_rejected_defensively() {
        let targets = vec![target("a"), target("b")];
        let deps = vec![
            DagEdge {
                from: "a".to_string(),
                to: "b".to_string(),
            },
            DagEdge {
                from: "b".to_string(),
                to: "a".to_string(),
            },
        ];
        let strategy = ExecutionStrategy::Dag {
            dependencies: deps,
            max_concurrency: None,
        };
        assert!(compile(&strategy, &targets, Operation::Shutdown).is_err());
    }

    #[test]
    fn isolated_targets_with_no_edges_land_in_the_first_layer() {
        let targets = vec![target("a"), target("b"), target("c")];
        let deps = vec![DagEdge {
            from: "a".to_string(),
            to: "b".to_string(),
        }];
        let strategy = ExecutionStrategy::Dag {
            dependencies: deps,
            max_concurrency: None,
        };
        let stages = compile(&strategy, &targets, Operation::Shutdown).unwrap();
        assert!(stages[0].targets.contains(&"a".to_string()));
        assert!(stages[0].targets.contains(&"c".to_string()));
    }

    #[test]
    fn staged_honors_parallel_flag_and_stage_caps() {
        let stages_spec = vec![
            StageSpec {
                name: "s1".to_string(),
                parallel: Some(false),
                max_concurrency: None,
                targets: vec!["b".to_string(), "a".to_string()],
            },
            StageSpec {
                name: "s2".to_string(),
                parallel: Some(true),
                max_concurrency: Some(3),
                targets: vec!["c".to_string()],
            },
        ];
        let strategy = ExecutionStrategy::Staged {
            stages: stages_spec,
            max_concurrency: None,
        };
        let stages = compile(&strategy, &[], Operation::Shutdown).unwrap();
        assert_eq!(stages[0].targets, vec!["a", "b"]);
        assert_eq!(stages[0].max_concurrency, Some(1));
        assert_eq!(stages[1].max_concurrency, Some(3));
    }
}
