//! The control-flow stack (§3 Frame, §4.5): an explicit vector of frame
//! records rather than native recursion, so suspension, cancellation, and
//! debug tracing are mechanical instead of coroutine-shaped (§9).

use std::collections::HashMap;

use crate::loader::Step;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum FrameKind {
    Root,
    Conditional,
    While { condition: String, max_iterations: u32, attempt_number: u32 },
    Foreach { items: Vec<Value>, index: usize },
    /// The root frame of a sub-agent task body (§4.6): a one-shot frame
    /// (never re-entered) that binds `item`/`index`/`total` the same way a
    /// `Foreach` iteration would, without the fan-out being driven as a
    /// literal foreach over its siblings.
    SubAgentItem { item: Value, index: usize, total: usize },
}

/// One level of the control stack: a step list plus a program counter into
/// it, and (for loop frames) the loop's iteration state (§3).
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub steps: Vec<Step>,
    pub pc: usize,
}

impl Frame {
    pub fn root(steps: Vec<Step>) -> Frame {
        Frame { kind: FrameKind::Root, steps, pc: 0 }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, FrameKind::While { .. } | FrameKind::Foreach { .. })
    }
}

/// The per-instance (or per-sub-agent-context) control stack.
#[derive(Debug, Clone, Default)]
pub struct ControlStack(Vec<Frame>);

impl ControlStack {
    pub fn new(root_steps: Vec<Step>) -> ControlStack {
        ControlStack(vec![Frame::root(root_steps)])
    }

    pub fn is_done(&self) -> bool {
        self.0.is_empty()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.0.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.0.last_mut()
    }

    pub fn push(&mut self, frame: Frame) {
        self.0.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.0.pop()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// `break`: pop frames (closing any enclosing conditionals) until the
    /// nearest loop frame is found, then pop that loop frame too and bump
    /// the new top's cursor past the loop step, exactly as a natural loop
    /// exit would (§4.5).
    pub fn apply_break(&mut self) {
        while let Some(frame) = self.0.last() {
            if frame.is_loop() {
                self.0.pop();
                if let Some(parent) = self.0.last_mut() {
                    parent.pc += 1;
                }
                return;
            }
            self.0.pop();
        }
    }

    /// `continue`: pop enclosing conditionals, then force the nearest loop
    /// frame's cursor past its body so the interpreter's "exiting block"
    /// path re-evaluates the loop condition / advances the foreach index.
    pub fn apply_continue(&mut self) {
        while let Some(frame) = self.0.last_mut() {
            if frame.is_loop() {
                frame.pc = frame.steps.len();
                return;
            }
            self.0.pop();
        }
    }

    /// Loop variable bindings visible at the current cursor: `item`,
    /// `index`, `total` from the nearest enclosing `Foreach`, and
    /// `attempt_number` from the nearest enclosing `While` (§4.5 scoping:
    /// inner loops shadow outer ones, each iteration has its own bindings).
    pub fn loop_locals(&self) -> HashMap<String, Value> {
        let mut locals = HashMap::new();
        for frame in self.0.iter().rev() {
            match &frame.kind {
                FrameKind::Foreach { items, index } => {
                    if !locals.contains_key("item") {
                        locals.insert("item".to_string(), items.get(*index).cloned().unwrap_or_else(Value::null));
                        locals.insert("index".to_string(), Value::number(*index as f64));
                        locals.insert("total".to_string(), Value::number(items.len() as f64));
                    }
                }
                FrameKind::While { attempt_number, .. } => {
                    locals.entry("attempt_number".to_string()).or_insert_with(|| Value::number(*attempt_number as f64));
                }
                FrameKind::SubAgentItem { item, index, total } => {
                    if !locals.contains_key("item") {
                        locals.insert("item".to_string(), item.clone());
                        locals.insert("index".to_string(), Value::number(*index as f64));
                        locals.insert("total".to_string(), Value::number(*total as f64));
                    }
                }
                _ => {}
            }
        }
        locals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_pops_through_conditional_into_loop_exit() {
        let mut stack = ControlStack::new(vec![]);
        stack.push(Frame {
            kind: FrameKind::While { condition: "true".to_string(), max_iterations: 10, attempt_number: 1 },
            steps: vec![],
            pc: 0,
        });
        stack.push(Frame { kind: FrameKind::Conditional, steps: vec![], pc: 0 });
        assert_eq!(stack.depth(), 3);
        stack.apply_break();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.top().unwrap().pc, 1);
    }

    #[test]
    fn continue_resets_nearest_loop_cursor_to_end() {
        let mut stack = ControlStack::new(vec![]);
        stack.push(Frame {
            kind: FrameKind::Foreach { items: vec![Value::number(1.0), Value::number(2.0)], index: 0 },
            steps: vec![crate::loader::Step { id: None, body: crate::loader::StepBody::WaitStep, error_handling: None }],
            pc: 0,
        });
        stack.apply_continue();
        let top = stack.top().unwrap();
        assert_eq!(top.pc, top.steps.len());
    }

    #[test]
    fn sub_agent_item_frame_binds_its_own_item_index_total() {
        let mut stack = ControlStack::new(vec![]);
        stack.push(Frame { kind: FrameKind::SubAgentItem { item: Value::number(9.0), index: 2, total: 4 }, steps: vec![], pc: 0 });
        let locals = stack.loop_locals();
        assert_eq!(locals["item"].as_f64(), Some(9.0));
        assert_eq!(locals["index"].as_f64(), Some(2.0));
        assert_eq!(locals["total"].as_f64(), Some(4.0));
        assert!(!stack.top().unwrap().is_loop());
    }

    #[test]
    fn loop_locals_exposes_item_index_total() {
        let mut stack = ControlStack::new(vec![]);
        stack.push(Frame {
            kind: FrameKind::Foreach { items: vec![Value::number(10.0), Value::number(20.0)], index: 1 },
            steps: vec![],
            pc: 0,
        });
        let locals = stack.loop_locals();
        assert_eq!(locals["item"].as_f64(), Some(20.0));
        assert_eq!(locals["index"].as_f64(), Some(1.0));
        assert_eq!(locals["total"].as_f64(), Some(2.0));
    }
}
