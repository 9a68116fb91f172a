//! Admission-style checks on declared specs.

use std::collections::HashSet;

use crate::crd::{AdminConnection, DatabasePermission, DatabaseSpec};
use crate::error::{Error, Result};
use crate::sql::normalize_privilege;

const FORBIDDEN_DATABASE_CHARS: &[char] = &['\\', '/', '?', '%', '*', ':', '|', '"', '<', '>', '.'];
const MAX_DATABASE_NAME: usize = 64;
const MAX_USERNAME: usize = 32;

/// Outcome of checking a charset/collation pair against a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CharsetCheck {
    Ok,
    Warning(&'static str),
    Rejected(&'static str),
}

pub fn validate_database_name(name: &str) -> Result<()> {
    let length = name.chars().count();
    if length == 0 || length > MAX_DATABASE_NAME {
        return Err(Error::InvalidSpec(format!(
            "database name must be 1 to {} characters",
            MAX_DATABASE_NAME
        )));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_DATABASE_CHARS.contains(c)) {
        return Err(Error::InvalidSpec(format!(
            "database name '{}' contains forbidden character '{}'",
            name, c
        )));
    }
    Ok(())
}

/// The live name cannot change once resolved.
pub fn validate_database_update(live_name: &str, spec: &DatabaseSpec) -> Result<()> {
    if live_name != spec.name {
        return Err(Error::InvalidSpec(format!(
            "database name is immutable (was '{}', now '{}')",
            live_name, spec.name
        )));
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<()> {
    let length = username.chars().count();
    if length == 0 || length > MAX_USERNAME {
        return Err(Error::InvalidSpec(format!(
            "username must be 1 to {} characters",
            MAX_USERNAME
        )));
    }
    Ok(())
}

pub fn validate_permissions(permissions: &[DatabasePermission]) -> Result<()> {
    let mut seen = HashSet::new();
    for permission in permissions {
        if !seen.insert(permission.database_name.as_str()) {
            return Err(Error::InvalidSpec(format!(
                "database '{}' listed more than once in permissions",
                permission.database_name
            )));
        }
        for grant in &permission.grants {
            normalize_privilege(grant)?;
        }
    }
    Ok(())
}

/// Check a declared pair against the charset table the admin connection observed.
///
/// Unset values fall back to the server defaults. Without an observed table
/// nothing can be said and the pair is accepted.
pub fn validate_charset_collation(
    admin: &AdminConnection,
    character_set: Option<&str>,
    collation: Option<&str>,
) -> CharsetCheck {
    let Some(status) = admin.status.as_ref().filter(|s| !s.available_charsets.is_empty()) else {
        return CharsetCheck::Ok;
    };

    let character_set = character_set
        .filter(|s| !s.is_empty())
        .or(status.character_set.as_deref());
    let Some(charset) = character_set
        .and_then(|cs| status.available_charsets.iter().find(|c| c.name == cs))
    else {
        return CharsetCheck::Rejected("Charset not valid for this server");
    };

    let collation = collation.filter(|s| !s.is_empty());
    let Some(collation) = collation else {
        return CharsetCheck::Ok;
    };
    match charset.collations.iter().find(|c| c.name == collation) {
        None => CharsetCheck::Rejected("Charset and collation combination not valid for this server"),
        Some(c) if !c.default => CharsetCheck::Warning("Collation not the default for this charset"),
        Some(_) => CharsetCheck::Ok,
    }
}
