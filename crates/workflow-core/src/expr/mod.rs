//! The expression and template engine (§4.3): a conservative JS subset
//! parsed and evaluated in-process, plus `{{ ... }}` template rendering.

mod ast;
mod eval;
mod lexer;
mod parser;

pub use ast::Expr;
pub use eval::{eval, Scope};
pub use parser::parse as parse_expression;

use crate::error::{EngineError, Result};
use crate::value::Value;

/// One fragment of a parsed template string: either literal text or a
/// parsed `{{ expr }}` interpolation.
#[derive(Debug, Clone)]
enum TemplateFragment {
    Literal(String),
    Expr(Expr),
}

/// A pre-parsed template string, e.g. `"retry {{ state.attempt }} of {{ inputs.max }}"`.
#[derive(Debug, Clone)]
pub struct Template {
    fragments: Vec<TemplateFragment>,
}

impl Template {
    /// Parse a raw string, splitting literal text from `{{ expr }}` runs.
    /// A template containing no `{{ }}` markers is a single literal
    /// fragment and renders to itself unchanged.
    pub fn parse(raw: &str) -> Result<Template> {
        let mut fragments = Vec::new();
        let mut rest = raw;
        loop {
            match rest.find("{{") {
                None => {
                    if !rest.is_empty() {
                        fragments.push(TemplateFragment::Literal(rest.to_string()));
                    }
                    break;
                }
                Some(start) => {
                    if start > 0 {
                        fragments.push(TemplateFragment::Literal(rest[..start].to_string()));
                    }
                    let after_open = &rest[start + 2..];
                    let end = after_open.find("}}").ok_or_else(|| {
                        EngineError::Expression(format!("unterminated '{{{{' in template '{raw}'"))
                    })?;
                    let expr_src = after_open[..end].trim();
                    let expr = parse_expression(expr_src)?;
                    fragments.push(TemplateFragment::Expr(expr));
                    rest = &after_open[end + 2..];
                }
            }
        }
        Ok(Template { fragments })
    }

    /// True if this template is a single bare `{{ expr }}` with no
    /// surrounding literal text -- callers may then render it to a
    /// non-string `Value` instead of a string.
    pub fn as_bare_expr(&self) -> Option<&Expr> {
        match self.fragments.as_slice() {
            [TemplateFragment::Expr(e)] => Some(e),
            _ => None,
        }
    }

    /// Render every fragment, concatenating expression results via the
    /// canonical template string printer (§4.3).
    pub fn render(&self, scope: &Scope) -> Result<String> {
        let mut out = String::new();
        for fragment in &self.fragments {
            match fragment {
                TemplateFragment::Literal(s) => out.push_str(s),
                TemplateFragment::Expr(e) => {
                    out.push_str(&eval(e, scope)?.to_template_string());
                }
            }
        }
        Ok(out)
    }
}

/// Parse and render a template string in one call.
pub fn render_template(raw: &str, scope: &Scope) -> Result<String> {
    Template::parse(raw)?.render(scope)
}

/// Render a template. If `raw` is a single bare `{{ expr }}` interpolation,
/// preserve the expression's native `Value` type (so a condition field or a
/// `state.*` write source can carry a number, bool, or object rather than
/// always being coerced to a string).
pub fn render_template_value(raw: &str, scope: &Scope) -> Result<Value> {
    let template = Template::parse(raw)?;
    if let Some(expr) = template.as_bare_expr() {
        eval(expr, scope)
    } else {
        Ok(Value::string(template.render(scope)?))
    }
}

/// Parse and evaluate a boolean condition expression (used for `condition`,
/// `while`, and loop `break`/`continue` guards). Non-boolean results are
/// coerced via JS truthiness rather than rejected.
pub fn evaluate_condition(raw: &str, scope: &Scope) -> Result<bool> {
    let expr = parse_expression(strip_braces(raw))?;
    Ok(eval(&expr, scope)?.is_truthy())
}

/// Conditions are conventionally authored as `{{ expr }}` but the bare
/// expression form is also accepted.
fn strip_braces(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}
