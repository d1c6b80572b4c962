// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `${name}` variable interpolation for action parameters.
//!
//! Resolution is deliberately permissive at run time: a reference to an
//! unknown variable passes through as literal text instead of failing.
//! Definition authors can opt into strictness at publish time via
//! [`crate::definition::WorkflowDefinition::validate`], which reports
//! unresolved references.

use serde_json::{Map, Value};

/// Resolve `${name}` tokens in a string against instance variables.
///
/// A string value is inserted verbatim; any other JSON value is inserted in
/// its serialized form. Unknown references are left untouched.
pub fn resolve_template(input: &str, variables: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match variables.get(name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        // Unknown reference: pass through as literal text
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated token: keep the remainder as-is
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolve templates recursively inside a JSON value.
///
/// A string that consists of exactly one `${name}` token resolves to the
/// variable's JSON value, preserving its type; any other string is
/// interpolated as text.
pub fn resolve_value(value: &Value, variables: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(name) = exact_reference(s)
                && let Some(resolved) = variables.get(name)
            {
                return resolved.clone();
            }
            Value::String(resolve_template(s, variables))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, variables))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Collect the `${name}` references appearing in a string.
pub fn template_refs(input: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                refs.push(after[..end].to_string());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    refs
}

/// If the string is exactly one `${name}` token, return the name.
fn exact_reference(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") || inner.contains('}') {
        return None;
    }
    Some(inner)
}
