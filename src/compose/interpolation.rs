//! Environment variable interpolation
//!
//! Supported forms are `$NAME`, `${NAME}`, `${NAME:-default}` (default when
//! unset or empty), `${NAME-default}` (default when unset) and `$$` for a
//! literal dollar sign. Unset variables without a default become the empty
//! string.

use crate::error::{ConvoyError, Result};
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:(\$)|\{([^}]*)\}|([A-Za-z_][A-Za-z0-9_]*))").unwrap_or_else(|e| {
            unreachable!("interpolation pattern is valid: {}", e)
        })
    })
}

fn braced_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)(.*))?$").unwrap_or_else(|e| {
            unreachable!("braced pattern is valid: {}", e)
        })
    })
}

/// Interpolate a single string. `field` names the value in error messages.
pub fn interpolate_str(input: &str, env: &HashMap<String, String>, field: &str) -> Result<String> {
    let error = |message: String| ConvoyError::Interpolation {
        field: field.to_string(),
        message,
    };

    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for caps in token_pattern().captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        check_literal(&input[last..whole.start()]).map_err(error)?;
        output.push_str(&input[last..whole.start()]);
        output.push_str(&substitute(&caps, env).map_err(error)?);
        last = whole.end();
    }

    check_literal(&input[last..]).map_err(error)?;
    output.push_str(&input[last..]);
    Ok(output)
}

/// Text between tokens may not open an unterminated `${`.
fn check_literal(text: &str) -> std::result::Result<(), String> {
    if text.contains("${") {
        return Err(format!("unterminated '${{' in \"{}\"", text));
    }
    Ok(())
}

fn substitute(caps: &Captures<'_>, env: &HashMap<String, String>) -> std::result::Result<String, String> {
    if caps.get(1).is_some() {
        return Ok("$".to_string());
    }
    if let Some(name) = caps.get(3) {
        return Ok(env.get(name.as_str()).cloned().unwrap_or_default());
    }

    let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let parts = braced_pattern()
        .captures(body)
        .ok_or_else(|| format!("invalid variable reference '${{{}}}'", body))?;

    let name = parts.get(1).map(|m| m.as_str()).unwrap_or_default();
    let value = env.get(name);

    let resolved = match (parts.get(2).map(|m| m.as_str()), parts.get(3)) {
        (Some(":-"), Some(default)) => match value {
            Some(v) if !v.is_empty() => v.clone(),
            _ => default.as_str().to_string(),
        },
        (Some("-"), Some(default)) => match value {
            Some(v) => v.clone(),
            None => default.as_str().to_string(),
        },
        _ => value.cloned().unwrap_or_default(),
    };
    Ok(resolved)
}

/// Interpolate every string value in a YAML tree. Mapping keys are left
/// untouched.
pub fn interpolate_value(value: &mut Value, env: &HashMap<String, String>, field: &str) -> Result<()> {
    match value {
        Value::String(s) => {
            *s = interpolate_str(s, env, field)?;
        }
        Value::Sequence(items) => {
            for item in items.iter_mut() {
                interpolate_value(item, env, field)?;
            }
        }
        Value::Mapping(map) => {
            for (key, item) in map.iter_mut() {
                let nested = match key.as_str() {
                    Some(k) => format!("{}.{}", field, k),
                    None => field.to_string(),
                };
                interpolate_value(item, env, &nested)?;
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env, field)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_unset_variable_is_empty() {
        assert_eq!(interpolate_str("$VAR", &env(&[]), "image").unwrap(), "");
        assert_eq!(interpolate_str("${VAR}", &env(&[]), "image").unwrap(), "");
        assert_eq!(interpolate_str("$VAR", &env(&[("VAR", "x")]), "image").unwrap(), "x");
    }

    #[test]
    fn test_mixed_text() {
        let vars = env(&[("TAG", "1.0.0"), ("REPO", "nginx")]);
        assert_eq!(
            interpolate_str("$REPO:${TAG}-alpine", &vars, "image").unwrap(),
            "nginx:1.0.0-alpine"
        );
        assert_eq!(interpolate_str("cost $$5", &vars, "x").unwrap(), "cost $5");
        assert_eq!(interpolate_str("trailing $", &vars, "x").unwrap(), "trailing $");
    }

    #[test]
    fn test_defaults() {
        let vars = env(&[("EMPTY", "")]);
        assert_eq!(interpolate_str("${NOPE:-busybox}", &vars, "x").unwrap(), "busybox");
        assert_eq!(interpolate_str("${EMPTY:-busybox}", &vars, "x").unwrap(), "busybox");
        assert_eq!(interpolate_str("${EMPTY-busybox}", &vars, "x").unwrap(), "");
        assert_eq!(interpolate_str("${NOPE-busybox}", &vars, "x").unwrap(), "busybox");
    }

    #[test]
    fn test_bad_syntax_is_an_error() {
        let vars = env(&[]);
        assert!(matches!(
            interpolate_str("${VAR", &vars, "image"),
            Err(ConvoyError::Interpolation { .. })
        ));
        assert!(interpolate_str("${}", &vars, "image").is_err());
        assert!(interpolate_str("${1BAD}", &vars, "image").is_err());
    }

    #[test]
    fn test_value_tree_interpolation_skips_keys() {
        let mut value: Value = serde_yaml::from_str(
            "image: $IMAGE\nenvironment:\n  $KEY: $VAL\nports:\n  - \"${PORT}:80\"\nmem_limit: 1024\n",
        )
        .unwrap();
        let vars = env(&[("IMAGE", "busybox"), ("VAL", "v"), ("PORT", "8080")]);
        interpolate_value(&mut value, &vars, "web").unwrap();

        assert_eq!(value["image"].as_str(), Some("busybox"));
        assert_eq!(value["environment"]["$KEY"].as_str(), Some("v"));
        assert_eq!(value["ports"][0].as_str(), Some("8080:80"));
        assert_eq!(value["mem_limit"].as_u64(), Some(1024));
    }

    #[test]
    fn test_error_names_the_field() {
        let mut value: Value = serde_yaml::from_str("command: echo ${oops\n").unwrap();
        let err = interpolate_value(&mut value, &env(&[]), "web").unwrap_err();
        assert!(err.to_string().contains("web.command"));
    }
}
