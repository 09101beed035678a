//! `${{ path }}` template rendering.
//!
//! Expressions are dotted lookups into a JSON context, for example
//! `${{ repository.name }}` or `${{ outputs.report.total }}`. Unknown paths
//! render as the empty string. The roots `outputs`, `previous_step` and
//! `step` only exist while a task runs; a template that references none of
//! them can be evaluated ahead of execution.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::{Map, Value};

use crate::step::Condition;

/// Context roots that are only populated during execution.
const RUNTIME_ROOTS: &[&str] = &["outputs", "previous_step", "step"];

fn expression() -> &'static Regex {
    static EXPRESSION: OnceLock<Regex> = OnceLock::new();
    EXPRESSION.get_or_init(|| {
        Regex::new(r"\$\{\{\s*([A-Za-z0-9_.\-]*)\s*\}\}").expect("static template regex")
    })
}

/// Values available to templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateContext {
    root: Map<String, Value>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of a root value.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.root.insert(key.to_string(), value);
    }

    /// Look up a dotted path. Array elements are addressed by index.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Render every `${{ path }}` expression in `template`.
pub fn render(template: &str, ctx: &TemplateContext) -> String {
    expression()
        .replace_all(template, |caps: &regex_lite::Captures<'_>| {
            ctx.lookup(&caps[1]).map(stringify).unwrap_or_default()
        })
        .into_owned()
}

/// True when the template references no execution-time values.
pub fn is_static(template: &str) -> bool {
    expression().captures_iter(template).all(|caps| {
        let root = caps[1].split('.').next().unwrap_or_default();
        !RUNTIME_ROOTS.contains(&root)
    })
}

impl Condition {
    /// True when the condition can be decided before the task runs.
    pub fn is_static(&self) -> bool {
        match self {
            Condition::Bool(_) => true,
            Condition::Template(t) => is_static(t),
        }
    }
}

/// Evaluate a skip condition. A rendered template counts as false when it
/// is empty, `false` or `0`.
pub fn evaluate_condition(condition: &Condition, ctx: &TemplateContext) -> bool {
    match condition {
        Condition::Bool(b) => *b,
        Condition::Template(t) => {
            let rendered = render(t, ctx);
            let rendered = rendered.trim();
            !(rendered.is_empty()
                || rendered.eq_ignore_ascii_case("false")
                || rendered == "0")
        }
    }
}
