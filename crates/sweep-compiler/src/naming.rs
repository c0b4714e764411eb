//! `{{ path | filter }}` substitution for run names and output prefixes.

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use sweep_core::{Result, SweepError};

const PLACEHOLDER: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(?:\|\s*([A-Za-z_]+)\s*)?\}\}";

/// Filesystem-friendly form of a value: `.` becomes `p` (`1.5e-3` -> `1p5e-3`).
pub fn fs_safe(value: &str) -> String {
    value.replace('.', "p")
}

/// Shortest round-trip form, switching to `1e-05` / `1e+16` style outside
/// `[1e-4, 1e16)`.
fn format_float(f: f64) -> String {
    let magnitude = f.abs();
    if f.is_finite() && f != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let text = format!("{:e}", f);
        if let Some((mantissa, exponent)) = text.split_once('e') {
            if let Ok(exp) = exponent.parse::<i32>() {
                let sign = if exp < 0 { '-' } else { '+' };
                return format!("{}e{}{:02}", mantissa, sign, exp.abs());
            }
        }
        return text;
    }
    let text = f.to_string();
    if text.contains('.') || !f.is_finite() {
        text
    } else {
        format!("{}.0", text)
    }
}

/// Text form of a context value as it appears in names.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "none".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if n.is_f64() {
                format_float(n.as_f64().unwrap_or_default())
            } else {
                n.to_string()
            }
        }
        other => other.to_string(),
    }
}

fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn apply_filter(filter: &str, text: String) -> Result<String> {
    match filter {
        "fs_safe" => Ok(fs_safe(&text)),
        "lower" => Ok(text.to_lowercase()),
        "upper" => Ok(text.to_uppercase()),
        other => Err(SweepError::config(format!(
            "unknown template filter '{}'",
            other
        ))),
    }
}

/// Render `template` against `context`. Unknown names, unknown filters and
/// unsupported `{{ ... }}` syntax are configuration errors.
pub fn render_template(template: &str, context: &Map<String, Value>) -> Result<String> {
    let placeholder = Regex::new(PLACEHOLDER)
        .map_err(|e| SweepError::config(format!("could not compile placeholder regex: {}", e)))?;

    for captures in placeholder.captures_iter(template) {
        let path = &captures[1];
        if lookup(context, path).is_none() {
            return Err(SweepError::config(format!(
                "template '{}' references unknown name '{}'",
                template, path
            )));
        }
        if let Some(filter) = captures.get(2) {
            apply_filter(filter.as_str(), String::new())?;
        }
    }

    let rendered = placeholder
        .replace_all(template, |captures: &Captures<'_>| {
            let text = lookup(context, &captures[1])
                .map(format_value)
                .unwrap_or_default();
            match captures.get(2) {
                Some(filter) => apply_filter(filter.as_str(), text).unwrap_or_default(),
                None => text,
            }
        })
        .to_string();

    if rendered.contains("{{") || rendered.contains("}}") {
        return Err(SweepError::config(format!(
            "template '{}' has an unsupported placeholder",
            template
        )));
    }
    Ok(rendered)
}

/// Keep `[A-Za-z0-9._-]`, map everything else to `_`.
pub fn sanitize_token(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `<prefix>_<branch>_<key><value>_...` with empty parts dropped.
pub fn fallback_run_name<'a>(
    output_prefix: &str,
    branch: &str,
    params: impl IntoIterator<Item = (&'a str, &'a Value)>,
) -> String {
    let params_str = params
        .into_iter()
        .map(|(k, v)| sanitize_token(&format!("{}{}", k, fs_safe(&format_value(v)))))
        .collect::<Vec<_>>()
        .join("_");
    [output_prefix.to_string(), sanitize_token(branch), params_str]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}
