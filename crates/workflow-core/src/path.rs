//! Dot-notation path parsing and validation (§3).
//!
//! Paths are rooted in `inputs`, `state`, or `computed`, followed by
//! dotted and bracketed segments: `state.items[0].name`.

use crate::error::{EngineError, Result};

/// One segment of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A root-qualified dotted path, e.g. `state.counters.retries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub root: Root,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    Inputs,
    State,
    Computed,
    /// A loop variable (`item`, `index`, `total`, `attempt_number`) or a
    /// sub-agent-local namespace root, resolved against the in-scope
    /// binding set rather than a state tier.
    Local,
}

impl Path {
    /// Parse `raw` into a root-qualified path. Accepts `inputs.x`,
    /// `state.x.y[0]`, `computed.z`, or a bare local identifier.
    pub fn parse(raw: &str) -> Result<Path> {
        if raw.is_empty() {
            return Err(EngineError::Path("empty path".to_string()));
        }

        let mut chars = raw.char_indices().peekable();
        let mut tokens: Vec<String> = Vec::new();
        let mut current = String::new();

        while let Some((_, c)) = chars.next() {
            match c {
                '.' => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                '[' => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                    let mut idx = String::new();
                    for (_, c2) in chars.by_ref() {
                        if c2 == ']' {
                            break;
                        }
                        idx.push(c2);
                    }
                    tokens.push(format!("#{idx}"));
                }
                _ => current.push(c),
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }

        if tokens.is_empty() {
            return Err(EngineError::Path(format!("cannot parse path '{raw}'")));
        }

        let root = match tokens[0].as_str() {
            "inputs" => Root::Inputs,
            "state" => Root::State,
            "computed" => Root::Computed,
            _ => Root::Local,
        };

        let rest = if matches!(root, Root::Local) {
            &tokens[..]
        } else {
            &tokens[1..]
        };

        let mut segments = Vec::with_capacity(rest.len());
        for tok in rest {
            if let Some(idx) = tok.strip_prefix('#') {
                let n: usize = idx
                    .parse()
                    .map_err(|_| EngineError::Path(format!("invalid array index '{idx}' in '{raw}'")))?;
                segments.push(Segment::Index(n));
            } else {
                segments.push(Segment::Key(tok.clone()));
            }
        }

        Ok(Path { root, segments })
    }

    /// True if this path is rooted in `state` and therefore a legal write
    /// target. `inputs.*` and `computed.*` are read-only; writes into an
    /// undeclared root are also rejected by the caller.
    pub fn is_writable(&self) -> bool {
        matches!(self.root, Root::State)
    }

    pub fn to_dotted(&self) -> String {
        let root = match self.root {
            Root::Inputs => "inputs",
            Root::State => "state",
            Root::Computed => "computed",
            Root::Local => "",
        };
        let mut out = root.to_string();
        for seg in &self.segments {
            match seg {
                Segment::Key(k) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(k);
                }
                Segment::Index(i) => out.push_str(&format!("[{i}]")),
            }
        }
        out
    }
}
