//! Service ordering
//!
//! Services are ordered so that every link, `depends_on` and sibling
//! `extends` target comes before the service that references it. Services
//! with no constraint between them keep their declaration order.

use super::config::{ServiceConfig, ServiceMap};
use crate::error::{ConvoyError, Result};
use std::collections::{BTreeSet, HashSet};

/// Ordered sequence of service names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    order: Vec<String>,
}

impl ExecutionPlan {
    /// Services in start order
    pub fn services(&self) -> &[String] {
        &self.order
    }

    /// Services in stop order
    pub fn reversed(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    pub fn position(&self, service: &str) -> Option<usize> {
        self.order.iter().position(|s| s == service)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Restrict the plan to `selected`, keeping plan order.
    pub fn filter(&self, selected: &HashSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|s| selected.contains(*s))
            .cloned()
            .collect()
    }
}

/// Computes execution plans
pub struct DependencyPlanner;

impl DependencyPlanner {
    /// Services that `config` must come after.
    pub fn dependencies(config: &ServiceConfig) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        let mut push = |name: String| {
            if !deps.contains(&name) {
                deps.push(name);
            }
        };
        for link in config.link_refs() {
            push(link.service);
        }
        for dep in &config.depends_on {
            push(dep.clone());
        }
        if let Some(extends) = config.extends.as_ref().filter(|e| e.is_sibling()) {
            push(extends.service.clone());
        }
        deps
    }

    /// Order `services`, failing on unknown targets or cycles.
    pub fn plan(services: &ServiceMap) -> Result<ExecutionPlan> {
        let names: Vec<&str> = services.names().collect();
        let count = names.len();

        let mut edges: Vec<Vec<usize>> = Vec::with_capacity(count);
        for (name, config) in services.iter() {
            let mut targets = Vec::new();
            for dep in Self::dependencies(config) {
                let index = services.position(&dep).ok_or_else(|| {
                    ConvoyError::UnknownDependency {
                        service: name.to_string(),
                        dependency: dep.clone(),
                    }
                })?;
                targets.push(index);
            }
            edges.push(targets);
        }

        // Kahn's algorithm; the ready set is ordered by declaration index.
        let mut remaining: Vec<usize> = edges.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (service, targets) in edges.iter().enumerate() {
            for &target in targets {
                dependents[target].push(service);
            }
        }

        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(count);

        while let Some(next) = ready.pop_first() {
            order.push(names[next].to_string());
            for &dependent in &dependents[next] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < count {
            let chain = find_cycle(&edges, &remaining)
                .into_iter()
                .map(|i| names[i].to_string())
                .collect();
            return Err(ConvoyError::CyclicLink { chain });
        }

        tracing::debug!("Execution plan: {}", order.join(", "));
        Ok(ExecutionPlan { order })
    }
}

/// Find one cycle among the services Kahn's algorithm could not place.
///
/// Returns the chain with the repeated service at both ends.
fn find_cycle(edges: &[Vec<usize>], remaining: &[usize]) -> Vec<usize> {
    let mut visited = vec![false; edges.len()];
    for start in (0..edges.len()).filter(|&i| remaining[i] > 0) {
        let mut path: Vec<usize> = Vec::new();
        if let Some(cycle) = walk(start, edges, &mut visited, &mut path) {
            return cycle;
        }
    }
    Vec::new()
}

fn walk(
    node: usize,
    edges: &[Vec<usize>],
    visited: &mut [bool],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    if let Some(pos) = path.iter().position(|&n| n == node) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(node);
        return Some(cycle);
    }
    if visited[node] {
        return None;
    }
    visited[node] = true;
    path.push(node);
    for &next in &edges[node] {
        if let Some(cycle) = walk(next, edges, visited, path) {
            return Some(cycle);
        }
    }
    path.pop();
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::ExtendsRef;

    fn service(links: &[&str], depends_on: &[&str]) -> ServiceConfig {
        ServiceConfig {
            image: Some("busybox".into()),
            links: links.iter().map(|s| s.to_string()).collect(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dependencies_come_first() {
        let mut services = ServiceMap::new();
        services.insert("web", service(&["api:backend"], &[]));
        services.insert("api", service(&[], &["db"]));
        services.insert("db", service(&[], &[]));

        let plan = DependencyPlanner::plan(&services).unwrap();
        assert_eq!(plan.services(), &["db", "api", "web"]);
        assert_eq!(plan.reversed(), vec!["web", "api", "db"]);
    }

    #[test]
    fn test_unconstrained_services_keep_declaration_order() {
        let mut services = ServiceMap::new();
        services.insert("zeta", service(&[], &[]));
        services.insert("alpha", service(&["mid"], &[]));
        services.insert("mid", service(&[], &[]));
        services.insert("beta", service(&[], &[]));

        let plan = DependencyPlanner::plan(&services).unwrap();
        assert_eq!(plan.services(), &["zeta", "mid", "alpha", "beta"]);
    }

    #[test]
    fn test_sibling_extends_orders_parent_first() {
        let mut services = ServiceMap::new();
        let mut child = service(&[], &[]);
        child.extends = Some(ExtendsRef {
            file: None,
            service: "base".into(),
        });
        services.insert("child", child);
        services.insert("base", service(&[], &[]));

        let plan = DependencyPlanner::plan(&services).unwrap();
        assert_eq!(plan.services(), &["base", "child"]);
    }

    #[test]
    fn test_link_cycle_reports_chain() {
        let mut services = ServiceMap::new();
        services.insert("a", service(&["b"], &[]));
        services.insert("b", service(&["a"], &[]));
        services.insert("c", service(&[], &[]));

        match DependencyPlanner::plan(&services) {
            Err(ConvoyError::CyclicLink { chain }) => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let mut services = ServiceMap::new();
        services.insert("web", service(&["ghost"], &[]));
        assert!(matches!(
            DependencyPlanner::plan(&services),
            Err(ConvoyError::UnknownDependency { .. })
        ));
    }
}
