//! The computed-field dependency graph: acyclicity validation, an inverted
//! index from source path to dependent fields, and topological ordering
//! restricted to an affected subset (§3, §4.2).

use std::collections::{HashMap, HashSet};

use crate::error::{EngineError, Result, ValidationFailure, ValidationIssue};
use crate::expr::Expr;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    UseFallback,
    Propagate,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct ComputedField {
    pub name: String,
    /// Dotted paths this field reads, e.g. `state.x`, `computed.other`.
    pub dependencies: Vec<String>,
    pub transform: Expr,
    pub error_policy: ErrorPolicy,
    pub fallback: Option<Value>,
}

/// The validated, acyclic set of computed fields for one WorkflowDef,
/// precomputed into an inverted dependency index (§9 design note: "a fixed
/// node list with a precomputed topological order").
pub struct ComputedGraph {
    fields: HashMap<String, ComputedField>,
    /// source path -> computed field names that read it, directly.
    dependents: HashMap<String, Vec<String>>,
    full_order: Vec<String>,
}

impl ComputedGraph {
    /// Build the graph, validating acyclicity. A cycle is a load-time
    /// `ValidationError` naming the offending field (§8 boundary case).
    pub fn new(fields: Vec<ComputedField>) -> Result<ComputedGraph> {
        let mut by_name = HashMap::new();
        for f in &fields {
            by_name.insert(f.name.clone(), f.clone());
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for f in &fields {
            for dep in &f.dependencies {
                dependents.entry(dep.clone()).or_default().push(f.name.clone());
                if let Some(computed_name) = dep.strip_prefix("computed.") {
                    dependents
                        .entry(computed_name.to_string())
                        .or_default()
                        .push(f.name.clone());
                }
            }
        }

        let full_order = toposort(&fields)?;

        Ok(ComputedGraph {
            fields: by_name,
            dependents,
            full_order,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ComputedField> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.full_order.clone()
    }

    /// The set of computed fields whose transitive dependencies intersect
    /// any of `touched_paths`, in the graph's global topological order.
    pub fn affected_by(&self, touched_paths: &[String]) -> Vec<String> {
        let mut frontier: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for path in touched_paths {
            if let Some(direct) = self.dependents.get(path) {
                for name in direct {
                    if seen.insert(name.clone()) {
                        frontier.push(name.clone());
                    }
                }
            }
        }

        // Transitive closure: a field that just became affected may itself
        // be a dependency of other fields.
        let mut i = 0;
        while i < frontier.len() {
            let name = frontier[i].clone();
            if let Some(more) = self.dependents.get(&name) {
                for next in more {
                    if seen.insert(next.clone()) {
                        frontier.push(next.clone());
                    }
                }
            }
            i += 1;
        }

        self.full_order
            .iter()
            .filter(|n| seen.contains(*n))
            .cloned()
            .collect()
    }

    /// The subset of `names` in the graph's global topological order.
    pub fn topological_order(&self, names: &[String]) -> Result<Vec<String>> {
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        Ok(self
            .full_order
            .iter()
            .filter(|n| wanted.contains(n.as_str()))
            .cloned()
            .collect())
    }
}

fn toposort(fields: &[ComputedField]) -> Result<Vec<String>> {
    let by_name: HashMap<&str, &ComputedField> =
        fields.iter().map(|f| (f.name.as_str(), f)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: HashMap<&str, Mark> =
        fields.iter().map(|f| (f.name.as_str(), Mark::Unvisited)).collect();
    let mut order = Vec::with_capacity(fields.len());

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a ComputedField>,
        marks: &mut HashMap<&'a str, Mark>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) | None => return Ok(()),
            Some(Mark::InProgress) => {
                return Err(EngineError::Validation(ValidationFailure {
                    issues: vec![ValidationIssue {
                        location: format!("/state_schema/computed/{name}"),
                        message: format!("circular computed dependency involving '{name}'"),
                    }],
                }))
            }
            Some(Mark::Unvisited) => {}
        }
        marks.insert(name, Mark::InProgress);
        if let Some(field) = by_name.get(name) {
            for dep in &field.dependencies {
                let dep_name = dep.strip_prefix("computed.").unwrap_or(dep.as_str());
                if by_name.contains_key(dep_name) {
                    visit(dep_name, by_name, marks, order)?;
                }
            }
        }
        marks.insert(name, Mark::Done);
        order.push(name.to_string());
        Ok(())
    }

    for f in fields {
        visit(&f.name, &by_name, &mut marks, &mut order)?;
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expression;

    fn field(name: &str, deps: &[&str]) -> ComputedField {
        ComputedField {
            name: name.to_string(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            transform: parse_expression("1").unwrap(),
            error_policy: ErrorPolicy::Propagate,
            fallback: None,
        }
    }

    #[test]
    fn acyclic_graph_builds() {
        let graph = ComputedGraph::new(vec![field("y", &["state.x"]), field("z", &["computed.y"])]).unwrap();
        assert_eq!(graph.field_names(), vec!["y".to_string(), "z".to_string()]);
    }

    #[test]
    fn cycle_is_rejected() {
        let err = ComputedGraph::new(vec![field("a", &["computed.b"]), field("b", &["computed.a"])])
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[test]
    fn affected_by_includes_transitive_dependents() {
        let graph = ComputedGraph::new(vec![field("y", &["state.x"]), field("z", &["computed.y"])]).unwrap();
        let affected = graph.affected_by(&["state.x".to_string()]);
        assert_eq!(affected, vec!["y".to_string(), "z".to_string()]);
    }

    #[test]
    fn affected_by_unrelated_path_is_empty() {
        let graph = ComputedGraph::new(vec![field("y", &["state.x"])]).unwrap();
        assert!(graph.affected_by(&["state.other".to_string()]).is_empty());
    }
}
