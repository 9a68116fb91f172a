//! Statement builders for the DDL this operator issues.
//!
//! Usernames, passwords and plugin names cannot be bound as parameters in
//! these statements, so every such value goes through [`escape`] before it is
//! interpolated. Schema names are quoted with [`quote_identifier`].

use crate::crd::{Identification, TlsRequirement};
use crate::error::{Error, Result};

/// MySQL string escaping for values placed inside single quotes.
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() * 2);
    for c in value.chars() {
        match c {
            '\0' => escaped.push_str("\\0"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            '\x1a' => escaped.push_str("\\Z"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Backtick-quote a schema identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn quote_string(value: &str) -> String {
    format!("'{}'", escape(value))
}

pub fn create_database(name: &str, character_set: Option<&str>, collation: Option<&str>) -> String {
    format!(
        "CREATE DATABASE {}{}",
        quote_identifier(name),
        charset_clauses(character_set, collation)
    )
}

/// `None` when neither clause is needed.
pub fn alter_database(
    name: &str,
    character_set: Option<&str>,
    collation: Option<&str>,
) -> Option<String> {
    let clauses = charset_clauses(character_set, collation);
    if clauses.is_empty() {
        return None;
    }
    Some(format!("ALTER DATABASE {}{}", quote_identifier(name), clauses))
}

pub fn drop_database(name: &str) -> String {
    format!("DROP DATABASE IF EXISTS {}", quote_identifier(name))
}

fn charset_clauses(character_set: Option<&str>, collation: Option<&str>) -> String {
    let mut clauses = String::new();
    if let Some(cs) = character_set.filter(|cs| !cs.is_empty()) {
        clauses.push_str(" CHARACTER SET ");
        clauses.push_str(&quote_identifier(cs));
    }
    if let Some(co) = collation.filter(|co| !co.is_empty()) {
        clauses.push_str(" COLLATE ");
        clauses.push_str(&quote_identifier(co));
    }
    clauses
}

/// `IDENTIFIED ...` clause, empty when there is nothing to identify with.
///
/// Clear-text values use `BY`; hashed values use `AS` with a plugin and
/// `BY PASSWORD` without one.
pub fn identified_clause(identification: Option<&Identification>, auth_string: Option<&str>) -> String {
    let Some(identification) = identification else {
        return String::new();
    };
    let auth_string = auth_string.filter(|s| !s.is_empty());
    match identification.auth_plugin.as_deref().filter(|p| !p.is_empty()) {
        Some(plugin) => {
            let mut clause = format!(" IDENTIFIED WITH {}", quote_string(plugin));
            if let Some(auth) = auth_string {
                let keyword = if identification.clear_text { "BY" } else { "AS" };
                clause.push_str(&format!(" {} {}", keyword, quote_string(auth)));
            }
            clause
        }
        None => match auth_string {
            Some(auth) if identification.clear_text => {
                format!(" IDENTIFIED BY {}", quote_string(auth))
            }
            Some(auth) => format!(" IDENTIFIED BY PASSWORD {}", quote_string(auth)),
            None => String::new(),
        },
    }
}

/// `IDENTIFIED ...` clause for ALTER USER. A hashed value without a plugin
/// has no ALTER form, so it yields nothing.
pub fn alter_identified_clause(identification: Option<&Identification>, auth_string: Option<&str>) -> String {
    match identification {
        Some(i) if !i.clear_text && i.auth_plugin.as_deref().map_or(true, str::is_empty) => String::new(),
        _ => identified_clause(identification, auth_string),
    }
}

pub fn require_clause(tls: Option<&TlsRequirement>) -> String {
    match tls {
        Some(t) if t.x509 => " REQUIRE X509".to_string(),
        Some(t) if t.ssl => " REQUIRE SSL".to_string(),
        _ => " REQUIRE NONE".to_string(),
    }
}

pub fn create_user(username: &str, details: &str) -> String {
    format!("CREATE USER {}{}", quote_string(username), details)
}

pub fn alter_user(username: &str, details: &str) -> String {
    format!("ALTER USER {}{}", quote_string(username), details)
}

pub fn rename_user(from: &str, to: &str) -> String {
    format!("RENAME USER {} TO {}", quote_string(from), quote_string(to))
}

pub fn drop_user(username: &str) -> String {
    format!("DROP USER IF EXISTS {}", quote_string(username))
}

pub fn show_grants(username: &str) -> String {
    format!("SHOW GRANTS FOR {}", quote_string(username))
}

pub fn revoke_all(username: &str) -> String {
    format!(
        "REVOKE ALL PRIVILEGES, GRANT OPTION FROM {}",
        quote_string(username)
    )
}

/// `GRANT <privileges|ALL PRIVILEGES> ON <db>.* TO <user>`
pub fn grant(database: &str, privileges: &[String], username: &str) -> Result<String> {
    let privileges = if privileges.is_empty() {
        "ALL PRIVILEGES".to_string()
    } else {
        privileges
            .iter()
            .map(|p| normalize_privilege(p))
            .collect::<Result<Vec<_>>>()?
            .join(", ")
    };
    Ok(format!(
        "GRANT {} ON {}.* TO {}",
        privileges,
        quote_identifier(database),
        quote_string(username)
    ))
}

/// Privileges are keywords, so only letters, spaces and underscores are accepted.
pub fn normalize_privilege(privilege: &str) -> Result<String> {
    let words: Vec<&str> = privilege.split_whitespace().collect();
    let valid = !words.is_empty()
        && words
            .iter()
            .all(|w| w.chars().all(|c| c.is_ascii_alphabetic() || c == '_'));
    if !valid {
        return Err(Error::InvalidSpec(format!("invalid privilege '{}'", privilege)));
    }
    Ok(words.join(" ").to_ascii_uppercase())
}

/// Statement text safe to log or publish: anything from `IDENTIFIED` on is cut.
pub fn redact(statement: &str) -> String {
    match statement.find(" IDENTIFIED") {
        Some(at) => format!("{} IDENTIFIED <redacted>", &statement[..at]),
        None => statement.to_string(),
    }
}

/// `SHOW GRANTS` always reports `GRANT USAGE ON *.*`, which grants nothing.
pub fn is_baseline_grant(grant: &str) -> bool {
    grant.starts_with("GRANT USAGE ON *.* TO ")
}
