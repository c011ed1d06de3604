//! CR-002: Declaration parsing and range shorthand expansion.
//!
//! Parses a stack or plan declaration (YAML file or string) into a JSON value tree
//! and unrolls `name[01-03]` style instance names:
//! - `node[01-03]` → `node01`, `node02`, `node03`
//! - numbers are zero-padded to two digits, or to the width of the start token
//! - text after the closing bracket is kept as a suffix

use super::error::ConfigError;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;

static RANGE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(?P<prefix>[^\[\]]*)\[(?P<start>\d+)-(?P<stop>\d+)\](?P<suffix>[^\[\]]*)$"));

const MIN_WIDTH: usize = 2;

/// Parse a declaration file from disk.
pub fn parse_declaration_file(path: &Path) -> Result<Value, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_declaration(&content)
}

/// Parse a declaration from a YAML (or JSON) string. The root must be a mapping.
pub fn parse_declaration(yaml: &str) -> Result<Value, ConfigError> {
    let value: Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    if !value.is_object() {
        return Err(ConfigError::InvalidDeclaration(
            "declaration root must be a mapping".to_string(),
        ));
    }
    Ok(value)
}

/// Does the name carry a `[start-stop]` token?
pub fn is_range(name: &str) -> bool {
    name.contains('[') || name.contains(']')
}

/// Expand a possibly ranged name into its concrete names.
pub fn expand_range(name: &str) -> Result<Vec<String>, ConfigError> {
    if !is_range(name) {
        return Ok(vec![name.to_string()]);
    }
    let invalid = |reason: &str| ConfigError::InvalidRange {
        instance: name.to_string(),
        reason: reason.to_string(),
    };
    let re = RANGE
        .as_ref()
        .map_err(|e| invalid(&format!("range pattern: {}", e)))?;
    let caps = re
        .captures(name)
        .ok_or_else(|| invalid("expected <prefix>[<start>-<stop>]"))?;

    let start_raw = &caps["start"];
    let start: u64 = start_raw
        .parse()
        .map_err(|_| invalid("start is not a number"))?;
    let stop: u64 = caps["stop"]
        .parse()
        .map_err(|_| invalid("stop is not a number"))?;
    if stop < start {
        return Err(invalid(&format!("stop {} is before start {}", stop, start)));
    }

    let width = start_raw.len().max(MIN_WIDTH);
    let prefix = &caps["prefix"];
    let suffix = &caps["suffix"];
    Ok((start..=stop)
        .map(|n| format!("{}{:0width$}{}", prefix, n, suffix, width = width))
        .collect())
}

/// Expand every name in a list, keeping order and dropping repeats.
pub fn expand_names<'a, I>(names: I) -> Result<Vec<String>, ConfigError>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut out: Vec<String> = Vec::new();
    for name in names {
        for concrete in expand_range(name)? {
            if !out.contains(&concrete) {
                out.push(concrete);
            }
        }
    }
    Ok(out)
}
