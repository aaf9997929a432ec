//! Dependency graph of deployment targets
//!
//! Built once per run from the configured targets. Ordering is level-major:
//! targets are sorted by dependency depth, ties broken by declaration order,
//! so forward order, depth levels and reruns all agree.

use std::collections::HashMap;

use stagehand_common::config::DeploymentTarget;
use stagehand_common::{Error, Result};

/// Validated, ordered set of targets
#[derive(Clone, Debug)]
pub struct TargetGraph {
    /// Targets in forward (scale-up) order
    ordered: Vec<DeploymentTarget>,
    /// Depth of each target in `ordered`; roots are depth 0
    depths: Vec<usize>,
}

impl TargetGraph {
    /// Validate dependencies and compute the order.
    ///
    /// Unknown dependencies and cycles are configuration errors.
    pub fn new(targets: Vec<DeploymentTarget>) -> Result<Self> {
        let index: HashMap<&str, usize> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        if index.len() != targets.len() {
            return Err(Error::configuration_for_field(
                "targets",
                "target names must be unique",
            ));
        }

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            let mut resolved = Vec::with_capacity(target.depends_on.len());
            for dep in &target.depends_on {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    Error::configuration_for_field(
                        format!("targets[{}].dependsOn", i),
                        format!("'{}' depends on unknown target '{}'", target.name, dep),
                    )
                })?;
                resolved.push(d);
            }
            deps.push(resolved);
        }

        let mut placed = vec![false; targets.len()];
        let mut depth = vec![0usize; targets.len()];
        let mut order = Vec::with_capacity(targets.len());

        while order.len() < targets.len() {
            let next = (0..targets.len())
                .find(|&i| !placed[i] && deps[i].iter().all(|&d| placed[d]));
            let Some(i) = next else {
                let stuck: Vec<&str> = (0..targets.len())
                    .filter(|&i| !placed[i])
                    .map(|i| targets[i].name.as_str())
                    .collect();
                return Err(Error::configuration_for_field(
                    "targets",
                    format!("dependency cycle among: {}", stuck.join(", ")),
                ));
            };
            placed[i] = true;
            depth[i] = deps[i].iter().map(|&d| depth[d] + 1).max().unwrap_or(0);
            order.push(i);
        }
        order.sort_by_key(|&i| (depth[i], i));

        let depths = order.iter().map(|&i| depth[i]).collect();
        let mut slots: Vec<Option<DeploymentTarget>> = targets.into_iter().map(Some).collect();
        let ordered = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();

        Ok(Self { ordered, depths })
    }

    /// Targets in scale-up order
    pub fn forward(&self) -> impl DoubleEndedIterator<Item = &DeploymentTarget> {
        self.ordered.iter()
    }

    /// Targets in scale-down order (exact reverse of [`forward`](Self::forward))
    pub fn reverse(&self) -> impl Iterator<Item = &DeploymentTarget> {
        self.ordered.iter().rev()
    }

    /// Targets grouped by depth, shallowest first, each group in forward order
    pub fn levels(&self) -> Vec<Vec<&DeploymentTarget>> {
        let max = self.depths.iter().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<&DeploymentTarget>> = vec![Vec::new(); max + 1];
        for (target, &depth) in self.ordered.iter().zip(&self.depths) {
            levels[depth].push(target);
        }
        levels.retain(|l| !l.is_empty());
        levels
    }

    /// Number of targets
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the graph has no targets
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names<'a>(it: impl Iterator<Item = &'a DeploymentTarget>) -> Vec<&'a str> {
        it.map(|t| t.name.as_str()).collect()
    }

    fn cost_monitor() -> Vec<DeploymentTarget> {
        vec![
            DeploymentTarget::new("cost-dashboard").depends_on("cost-data-service"),
            DeploymentTarget::new("postgresql"),
            DeploymentTarget::new("cost-data-service")
                .depends_on("postgresql")
                .depends_on("redis"),
            DeploymentTarget::new("redis"),
        ]
    }

    #[test]
    fn forward_order_respects_dependencies_and_declaration() {
        let graph = TargetGraph::new(cost_monitor()).expect("acyclic");
        assert_eq!(
            names(graph.forward()),
            vec!["postgresql", "redis", "cost-data-service", "cost-dashboard"]
        );
    }

    #[test]
    fn reverse_is_exact_reverse_of_forward() {
        let graph = TargetGraph::new(cost_monitor()).expect("acyclic");
        let mut forward = names(graph.forward());
        forward.reverse();
        assert_eq!(names(graph.reverse()), forward);
    }

    #[test]
    fn every_dependency_precedes_its_dependent() {
        let graph = TargetGraph::new(cost_monitor()).expect("acyclic");
        let order = names(graph.forward());
        for target in graph.forward() {
            let pos = order.iter().position(|n| *n == target.name).expect("present");
            for dep in &target.depends_on {
                let dep_pos = order.iter().position(|n| n == dep).expect("present");
                assert!(dep_pos < pos, "{dep} must precede {}", target.name);
            }
        }
    }

    #[test]
    fn levels_group_same_depth_targets() {
        let graph = TargetGraph::new(cost_monitor()).expect("acyclic");
        let levels: Vec<Vec<&str>> = graph
            .levels()
            .into_iter()
            .map(|l| l.into_iter().map(|t| t.name.as_str()).collect())
            .collect();
        assert_eq!(
            levels,
            vec![
                vec!["postgresql", "redis"],
                vec!["cost-data-service"],
                vec!["cost-dashboard"]
            ]
        );
    }

    #[test]
    fn later_declared_root_precedes_deeper_targets() {
        let targets = vec![
            DeploymentTarget::new("db"),
            DeploymentTarget::new("api").depends_on("db"),
            DeploymentTarget::new("cache"),
        ];
        let graph = TargetGraph::new(targets).expect("acyclic");
        assert_eq!(names(graph.forward()), vec!["db", "cache", "api"]);
        let flattened: Vec<&str> = graph
            .levels()
            .into_iter()
            .flatten()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(flattened, names(graph.forward()));
    }

    #[test]
    fn cycle_is_a_configuration_error() {
        let targets = vec![
            DeploymentTarget::new("a").depends_on("c"),
            DeploymentTarget::new("b").depends_on("a"),
            DeploymentTarget::new("c").depends_on("b"),
            DeploymentTarget::new("d"),
        ];
        let err = TargetGraph::new(targets).unwrap_err();
        match err {
            Error::Configuration { message, .. } => {
                assert!(message.contains("a, b, c"), "got: {message}");
                assert!(!message.contains(", d"), "acyclic target is not reported");
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let targets = vec![DeploymentTarget::new("api").depends_on("db")];
        assert!(matches!(
            TargetGraph::new(targets),
            Err(Error::Configuration { .. })
        ));
    }
}
