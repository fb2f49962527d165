// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Role claim normalization.
//!
//! Identity providers encode roles in whatever shape the custom claim was
//! written with. All of these normalize to the same set:
//!
//! - `"admin"`
//! - `["admin", "staff"]`
//! - `["admin", 42, null, "staff"]` (non-strings dropped)
//! - `{"admin": true, "staff": true, "viewer": false}` (true-valued keys only)
//!
//! Roles are compared case-insensitively, so they are stored trimmed and
//! lowercased.

use std::collections::BTreeSet;

use serde_json::Value;

/// Deduplicated, lowercased roles.
pub type RoleSet = BTreeSet<String>;

/// Normalize a single role name (case-insensitive). Blank names yield `None`.
pub fn normalize_role(raw: &str) -> Option<String> {
    let role = raw.trim();
    if role.is_empty() {
        None
    } else {
        Some(role.to_lowercase())
    }
}

/// Extract roles from a claim value of any supported shape.
pub fn roles_from_claim(value: &Value) -> RoleSet {
    match value {
        Value::String(role) => normalize_role(role).into_iter().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(normalize_role)
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter(|(_, granted)| granted.as_bool() == Some(true))
            .filter_map(|(role, _)| normalize_role(role))
            .collect(),
        _ => RoleSet::new(),
    }
}

/// Normalize a configured list of role names.
pub fn role_set<I, S>(roles: I) -> RoleSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    roles
        .into_iter()
        .filter_map(|role| normalize_role(role.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(roles: &[&str]) -> RoleSet {
        roles.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn list_with_duplicates_and_case_variants_collapses() {
        let roles = roles_from_claim(&json!(["staff", "admin", "ADMIN", " Staff "]));
        assert_eq!(roles, set(&["admin", "staff"]));
    }

    #[test]
    fn single_string_claim() {
        assert_eq!(roles_from_claim(&json!("Admin")), set(&["admin"]));
        assert!(roles_from_claim(&json!("   ")).is_empty());
    }

    #[test]
    fn mixed_list_keeps_strings_only() {
        let roles = roles_from_claim(&json!(["viewer", 7, null, {"x": 1}, "editor"]));
        assert_eq!(roles, set(&["editor", "viewer"]));
    }

    #[test]
    fn boolean_map_keeps_true_keys() {
        let roles = roles_from_claim(&json!({"admin": true, "staff": true, "viewer": false, "x": "true"}));
        assert_eq!(roles, set(&["admin", "staff"]));
    }

    #[test]
    fn unsupported_shapes_are_empty() {
        assert!(roles_from_claim(&json!(42)).is_empty());
        assert!(roles_from_claim(&Value::Null).is_empty());
    }

    #[test]
    fn configured_roles_are_normalized() {
        assert_eq!(role_set(["Admin", "", "staff"]), set(&["admin", "staff"]));
    }
}
