//! Metadata tag projection.
//!
//! The `[Metadata]` config maps BagIt tag files to tag names to *tag paths*:
//! a dot-separated sequence of steps, each either a map key or a list index,
//! descending into the package's METADATA JSON. The descent either lands on
//! a scalar leaf or reports a structured error; there is no reflection.
//! There is also no partial success: one unresolvable tag invalidates the
//! whole projection, because DART would otherwise upload a bag with
//! silently missing tags.

use serde_json::Value;
use thiserror::Error;

use crate::config::MetadataConfig;
use crate::strip::strip_tags;

/// One resolved BagIt tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub tag_file: String,
    pub tag_name: String,
    pub value: String,
}

/// One step of a tag path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Key(String),
    Index(usize),
}

#[derive(Debug, Error)]
pub enum DescentError {
    #[error("key '{0}' not found in metadata JSON")]
    MissingKey(String),
    #[error("index {0} is out of bounds in metadata JSON")]
    IndexOutOfBounds(usize),
    #[error("cannot descend into a leaf value at '{0}'")]
    NotAContainer(String),
    #[error("tag path '{0}' resolved to a non-scalar value")]
    NotALeaf(String),
    #[error("empty tag path")]
    EmptyPath,
}

/// Split a dotted tag source into steps; purely numeric segments index into
/// lists.
pub fn parse_tag_path(source: &str) -> Vec<PathStep> {
    source
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|segment| match segment.parse::<usize>() {
            Ok(index) => PathStep::Index(index),
            Err(_) => PathStep::Key(segment.to_string()),
        })
        .collect()
}

/// Walk a tag path down to the value it names.
pub fn descend<'a>(value: &'a Value, path: &[PathStep]) -> Result<&'a Value, DescentError> {
    if path.is_empty() {
        return Err(DescentError::EmptyPath);
    }
    let mut current = value;
    for step in path {
        current = match (step, current) {
            (PathStep::Key(key), Value::Object(map)) => map
                .get(key)
                .ok_or_else(|| DescentError::MissingKey(key.clone()))?,
            (PathStep::Index(index), Value::Array(items)) => items
                .get(*index)
                .ok_or(DescentError::IndexOutOfBounds(*index))?,
            (PathStep::Key(key), _) => return Err(DescentError::NotAContainer(key.clone())),
            (PathStep::Index(index), _) => {
                return Err(DescentError::NotAContainer(index.to_string()));
            }
        };
    }
    Ok(current)
}

fn leaf_string(source: &str, value: &Value) -> Result<String, DescentError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(DescentError::NotALeaf(source.to_string())),
    }
}

/// Truncate on a word boundary to at most `width` characters, appending the
/// `[...]` placeholder when anything was cut.
pub fn shorten(text: &str, width: usize) -> String {
    const PLACEHOLDER: &str = " [...]";
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= width {
        return collapsed;
    }
    let budget = width.saturating_sub(PLACEHOLDER.len());
    let mut kept = String::new();
    for word in collapsed.split(' ') {
        let needed = if kept.is_empty() {
            word.len()
        } else {
            kept.len() + 1 + word.len()
        };
        if needed > budget {
            break;
        }
        if !kept.is_empty() {
            kept.push(' ');
        }
        kept.push_str(word);
    }
    kept.push_str(PLACEHOLDER);
    kept
}

/// Resolve every configured tag against the package metadata.
pub fn project_tags(config: &MetadataConfig, metadata: &Value) -> Result<Vec<Tag>, DescentError> {
    let mut tags = Vec::new();
    for (tag_file, rules) in config {
        let file_name = format!("{tag_file}.txt");
        for (tag_name, rule) in rules {
            let source = rule.tag_source();
            let path = parse_tag_path(source);
            let leaf = descend(metadata, &path)?;
            let mut value = leaf_string(source, leaf)?;
            if rule.strip_html() {
                value = strip_tags(&value);
            }
            if let Some(width) = rule.shorten() {
                value = shorten(&value, width);
            }
            tags.push(Tag {
                tag_file: file_name.clone(),
                tag_name: tag_name.clone(),
                value,
            });
        }
    }
    Ok(tags)
}
