//! The three-tier state store (§4.2): `inputs` / `state` / `computed`,
//! reactive recomputation, and batched atomic updates.

mod computed;

pub use computed::{ComputedField, ComputedGraph, ErrorPolicy};

use std::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::expr::{eval, Scope};
use crate::path::{Path, Root, Segment};
use crate::value::Value;

/// A single requested mutation against `state.*`.
#[derive(Debug, Clone)]
pub struct Update {
    pub path: Path,
    pub op: Op,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Set,
    Increment,
    Decrement,
    Multiply,
    Append,
    Merge,
}

/// The flattened, read-only view handed to the expression engine: `computed`
/// shadows `state` shadows `inputs` (§3, glossary).
pub struct FlatView {
    pub inputs: Value,
    pub state: Value,
    pub computed: Value,
}

impl FlatView {
    pub fn to_scope(&self) -> Scope {
        Scope {
            inputs: self.inputs.clone(),
            state: self.state.clone(),
            computed: self.computed.clone(),
            locals: Default::default(),
        }
    }
}

struct Inner {
    inputs: Value,
    state: Value,
    computed_values: Value,
    graph: ComputedGraph,
}

/// Owns one workflow instance's state. All mutation goes through `apply`,
/// which is the sole write path and the sole point where computed fields
/// recompute (§4.2 concurrency/reactive-recomputation invariants).
pub struct StateStore {
    inner: Mutex<Inner>,
}

impl StateStore {
    pub fn new(inputs: Value, initial_state: Value, graph: ComputedGraph) -> Result<StateStore> {
        let mut inner = Inner {
            inputs,
            state: initial_state,
            computed_values: Value::object(Default::default()),
            graph,
        };
        recompute_all(&mut inner)?;
        Ok(StateStore { inner: Mutex::new(inner) })
    }

    /// Read a single path against the current flattened view.
    pub fn read(&self, path: &Path) -> Result<Value> {
        let inner = self.inner.lock().expect("state lock poisoned");
        read_from(&inner, path)
    }

    pub fn read_flat(&self) -> FlatView {
        let inner = self.inner.lock().expect("state lock poisoned");
        FlatView {
            inputs: inner.inputs.clone(),
            state: inner.state.clone(),
            computed: inner.computed_values.clone(),
        }
    }

    /// Apply a batch of updates atomically, then recompute every computed
    /// field whose transitive dependencies intersect a written path, in
    /// topological order. Returns the names of computed fields that were
    /// recomputed, once recomputation has settled (§4.2).
    pub fn apply(&self, updates: &[Update]) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        let mut touched = Vec::with_capacity(updates.len());
        for update in updates {
            if !update.path.is_writable() {
                return Err(EngineError::Path(format!(
                    "'{}' is not a writable path",
                    update.path.to_dotted()
                )));
            }
            apply_one(&mut inner.state, update)?;
            touched.push(update.path.to_dotted());
        }
        let affected = inner.graph.affected_by(&touched);
        recompute_fields(&mut inner, &affected)?;
        Ok(affected)
    }

    /// Overwrite the computed tier directly rather than deriving it from a
    /// graph recompute. Used to give a sub-agent context a frozen, read-only
    /// snapshot of its parent's computed fields at fan-out time (§4.6) —
    /// the sub-agent's own computed graph is empty, so nothing would ever
    /// repopulate this tier otherwise.
    pub fn seed_computed(&self, values: Value) {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.computed_values = values;
    }

    /// Serialized byte size of the current state tier. The caller (an
    /// instance's `observe_state_bytes`) compares this against
    /// `EngineConfig.limits.max_state_bytes` to enforce the resource policy;
    /// this function itself does no enforcement.
    pub fn state_size_bytes(&self) -> usize {
        let inner = self.inner.lock().expect("state lock poisoned");
        serde_json::to_vec(&inner.state.clone().into_json())
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

fn read_from(inner: &Inner, path: &Path) -> Result<Value> {
    let mut current = match path.root {
        Root::Inputs => inner.inputs.clone(),
        Root::State => inner.state.clone(),
        Root::Computed => inner.computed_values.clone(),
        Root::Local => {
            return Err(EngineError::Path(
                "cannot read a local-rooted path from the state store".to_string(),
            ))
        }
    };
    for seg in &path.segments {
        current = match seg {
            Segment::Key(k) => current
                .get(k)
                .ok_or_else(|| EngineError::Path(format!("no such field '{k}' in '{}'", path.to_dotted())))?,
            Segment::Index(i) => current
                .index(*i)
                .ok_or_else(|| EngineError::Path(format!("index {i} out of bounds in '{}'", path.to_dotted())))?,
        };
    }
    Ok(current)
}

fn apply_one(state: &mut Value, update: &Update) -> Result<()> {
    let mut json = state.clone().into_json();
    {
        let target = navigate_mut(&mut json, &update.path)?;
        *target = compute_new_value(target, update)?.into_json();
    }
    *state = Value::from_json(json);
    Ok(())
}

fn navigate_mut<'a>(root: &'a mut serde_json::Value, path: &Path) -> Result<&'a mut serde_json::Value> {
    use serde_json::Value as Json;
    let mut current = root;
    for seg in path.segments.iter() {
        match seg {
            Segment::Key(k) => {
                if !current.is_object() {
                    *current = Json::Object(Default::default());
                }
                let obj = current.as_object_mut().expect("just coerced to object");
                current = obj.entry(k.clone()).or_insert(Json::Null);
            }
            Segment::Index(idx) => {
                if !current.is_array() {
                    *current = Json::Array(Default::default());
                }
                let arr = current.as_array_mut().expect("just coerced to array");
                while arr.len() <= *idx {
                    arr.push(Json::Null);
                }
                current = &mut arr[*idx];
            }
        }
    }
    Ok(current)
}

fn compute_new_value(current: &serde_json::Value, update: &Update) -> Result<Value> {
    let current = Value::from_json(current.clone());
    match update.op {
        Op::Set => Ok(update.value.clone()),
        Op::Increment | Op::Decrement | Op::Multiply => {
            let base = current.as_f64().unwrap_or(0.0);
            let delta = update
                .value
                .as_f64()
                .ok_or_else(|| EngineError::Expression("operand must be numeric".to_string()))?;
            let result = match update.op {
                Op::Increment => base + delta,
                Op::Decrement => base - delta,
                Op::Multiply => base * delta,
                _ => unreachable!(),
            };
            Ok(Value::number(result))
        }
        Op::Append => {
            let mut arr = current.as_array().cloned().unwrap_or_default();
            arr.push(update.value.clone().into_json());
            Ok(Value::from_json(serde_json::Value::Array(arr)))
        }
        Op::Merge => {
            let mut base = current.as_object().cloned().unwrap_or_default();
            let incoming = update
                .value
                .as_object()
                .ok_or_else(|| EngineError::Expression("merge operand must be an object".to_string()))?;
            for (k, v) in incoming {
                base.insert(k.clone(), v.clone());
            }
            Ok(Value::from_json(serde_json::Value::Object(base)))
        }
    }
}

fn recompute_all(inner: &mut Inner) -> Result<()> {
    let all: Vec<String> = inner.graph.field_names();
    recompute_fields(inner, &all)
}

fn recompute_fields(inner: &mut Inner, names: &[String]) -> Result<()> {
    let order = inner.graph.topological_order(names)?;
    let mut computed_obj = inner
        .computed_values
        .as_object()
        .cloned()
        .unwrap_or_default();

    for name in order {
        let field = inner
            .graph
            .get(&name)
            .expect("topological order only lists known fields");
        let scope = Scope {
            inputs: inner.inputs.clone(),
            state: inner.state.clone(),
            computed: Value::from_json(serde_json::Value::Object(computed_obj.clone())),
            locals: Default::default(),
        };
        match eval(&field.transform, &scope) {
            Ok(value) => {
                computed_obj.insert(name.clone(), value.into_json());
            }
            Err(err) => match field.error_policy {
                ErrorPolicy::UseFallback => {
                    let fallback = field.fallback.clone().unwrap_or_else(Value::null);
                    computed_obj.insert(name.clone(), fallback.into_json());
                }
                ErrorPolicy::Propagate => return Err(err),
                ErrorPolicy::Ignore => {
                    computed_obj.entry(name.clone()).or_insert(serde_json::Value::Null);
                }
            },
        }
    }

    inner.computed_values = Value::from_json(serde_json::Value::Object(computed_obj));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expression;

    fn empty_graph() -> ComputedGraph {
        ComputedGraph::new(vec![]).unwrap()
    }

    fn obj(pairs: Vec<(&str, Value)>) -> Value {
        Value::object(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn set_then_read_round_trips() {
        let store = StateStore::new(Value::null(), obj(vec![("x", Value::number(1.0))]), empty_graph()).unwrap();
        store
            .apply(&[Update {
                path: Path::parse("state.x").unwrap(),
                op: Op::Set,
                value: Value::number(5.0),
            }])
            .unwrap();
        assert_eq!(store.read(&Path::parse("state.x").unwrap()).unwrap().as_f64(), Some(5.0));
    }

    #[test]
    fn increment_on_missing_path_defaults_to_zero() {
        let store = StateStore::new(Value::null(), obj(vec![]), empty_graph()).unwrap();
        store
            .apply(&[Update {
                path: Path::parse("state.counters.n").unwrap(),
                op: Op::Increment,
                value: Value::number(1.0),
            }])
            .unwrap();
        assert_eq!(
            store.read(&Path::parse("state.counters.n").unwrap()).unwrap().as_f64(),
            Some(1.0)
        );
    }

    #[test]
    fn append_grows_array() {
        let store = StateStore::new(Value::null(), obj(vec![("items", Value::array(vec![]))]), empty_graph()).unwrap();
        store
            .apply(&[Update {
                path: Path::parse("state.items").unwrap(),
                op: Op::Append,
                value: Value::number(7.0),
            }])
            .unwrap();
        let items = store.read(&Path::parse("state.items").unwrap()).unwrap();
        assert_eq!(items.as_array().unwrap().len(), 1);
    }

    #[test]
    fn write_to_inputs_is_rejected() {
        let store = StateStore::new(obj(vec![("x", Value::number(1.0))]), obj(vec![]), empty_graph()).unwrap();
        let err = store
            .apply(&[Update {
                path: Path::parse("inputs.x").unwrap(),
                op: Op::Set,
                value: Value::number(2.0),
            }])
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PathError);
    }

    #[test]
    fn computed_field_recomputes_after_write() {
        let graph = ComputedGraph::new(vec![ComputedField {
            name: "y".to_string(),
            dependencies: vec!["state.x".to_string()],
            transform: parse_expression("state.x * 3").unwrap(),
            error_policy: ErrorPolicy::Propagate,
            fallback: None,
        }])
        .unwrap();
        let store = StateStore::new(Value::null(), obj(vec![("x", Value::number(2.0))]), graph).unwrap();
        assert_eq!(
            store.read(&Path::parse("computed.y").unwrap()).unwrap().as_f64(),
            Some(6.0)
        );
        store
            .apply(&[Update {
                path: Path::parse("state.x").unwrap(),
                op: Op::Set,
                value: Value::number(5.0),
            }])
            .unwrap();
        assert_eq!(
            store.read(&Path::parse("computed.y").unwrap()).unwrap().as_f64(),
            Some(15.0)
        );
    }

    #[test]
    fn computed_error_uses_fallback_policy() {
        let graph = ComputedGraph::new(vec![ComputedField {
            name: "y".to_string(),
            dependencies: vec!["state.x".to_string()],
            transform: parse_expression("state.missing_field + 1").unwrap(),
            error_policy: ErrorPolicy::UseFallback,
            fallback: Some(Value::number(-1.0)),
        }])
        .unwrap();
        let store = StateStore::new(Value::null(), obj(vec![("x", Value::number(2.0))]), graph).unwrap();
        assert_eq!(
            store.read(&Path::parse("computed.y").unwrap()).unwrap().as_f64(),
            Some(-1.0)
        );
    }
}
