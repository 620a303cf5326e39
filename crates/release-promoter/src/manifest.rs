//! Release manifest: nested groups of file-name patterns whose key path is the
//! destination label (`ee: { server: [a.zip] }` puts `a.zip` in `ee/server`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Literal file name -> destination label.
pub type FileToLabelMap = BTreeMap<String, String>;

/// How to recognise an entry whose template variable was never substituted.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UnresolvedPolicy {
    /// Skip entries that still contain a `${` token opener, closed or not.
    #[default]
    Template,
    /// Skip only entries containing both `$` and `{`, wherever they appear.
    Legacy,
}

impl UnresolvedPolicy {
    pub fn is_unresolved(self, entry: &str) -> bool {
        match self {
            UnresolvedPolicy::Template => entry.contains("${"),
            UnresolvedPolicy::Legacy => entry.contains('$') && entry.contains('{'),
        }
    }
}

impl std::str::FromStr for UnresolvedPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "template" => Ok(Self::Template),
            "legacy" => Ok(Self::Legacy),
            other => Err(Error::msg(format!(
                "unknown unresolved policy '{other}' (expected template or legacy)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Keys in document order.
    Group(Vec<(String, Node)>),
    Leaf(Vec<String>),
}

impl Node {
    pub fn from_yaml(value: &Value) -> Result<Node> {
        match value {
            Value::Mapping(_) | Value::Null | Value::Tagged(_) => from_yaml_at(value, ""),
            _ => Err(Error::msg("manifest root must be a mapping of groups")),
        }
    }

    /// Walk the tree and map every leaf entry to the `/`-joined keys above it.
    /// A name listed under two labels keeps the last one in document order.
    pub fn flatten(&self, policy: UnresolvedPolicy) -> FileToLabelMap {
        let mut out = FileToLabelMap::new();
        let mut stack: Vec<(&Node, String)> = vec![(self, String::new())];
        let mut leaves: Vec<(&[String], String)> = Vec::new();

        // Depth-first, children pushed in reverse so leaves come out in document order.
        while let Some((node, label)) = stack.pop() {
            match node {
                Node::Group(children) => {
                    for (key, child) in children.iter().rev() {
                        let child_label = if label.is_empty() {
                            key.clone()
                        } else {
                            format!("{label}/{key}")
                        };
                        stack.push((child, child_label));
                    }
                }
                Node::Leaf(entries) => leaves.push((entries.as_slice(), label)),
            }
        }

        for (entries, label) in leaves {
            for entry in entries {
                if policy.is_unresolved(entry) {
                    debug!(entry = %entry, label = %label, "skipping unresolved manifest entry");
                    continue;
                }
                if let Some(prev) = out.insert(entry.clone(), label.clone()) {
                    if prev != label {
                        warn!(entry = %entry, from = %prev, to = %label, "manifest entry listed twice; last label wins");
                    }
                }
            }
        }
        out
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn from_yaml_at(value: &Value, at: &str) -> Result<Node> {
    match value {
        Value::Mapping(map) => {
            let mut children = Vec::with_capacity(map.len());
            for (k, v) in map {
                let Some(key) = scalar_text(k) else {
                    return Err(Error::msg(format!(
                        "manifest key under '{at}' is not a scalar"
                    )));
                };
                let here = if at.is_empty() {
                    key.clone()
                } else {
                    format!("{at}/{key}")
                };
                match v {
                    Value::Mapping(_) | Value::Sequence(_) => {
                        children.push((key, from_yaml_at(v, &here)?));
                    }
                    Value::Null => children.push((key, Node::Leaf(Vec::new()))),
                    Value::Tagged(t) => children.push((key, from_yaml_at(&t.value, &here)?)),
                    _ => {
                        warn!(label = %here, "ignoring scalar manifest value (expected a list or a group)");
                    }
                }
            }
            Ok(Node::Group(children))
        }
        Value::Sequence(items) => {
            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                match scalar_text(item) {
                    Some(s) => entries.push(s),
                    None => {
                        return Err(Error::msg(format!(
                            "manifest list '{at}' contains a non-scalar entry"
                        )));
                    }
                }
            }
            Ok(Node::Leaf(entries))
        }
        Value::Null => Ok(Node::Group(Vec::new())),
        Value::Tagged(t) => from_yaml_at(&t.value, at),
        _ => Err(Error::msg(format!("manifest value at '{at}' must be a list or a group"))),
    }
}

/// Plain text replacement; runs before parsing so placeholders may sit anywhere.
pub fn substitute(template: &str, placeholder: &str, version: &str) -> String {
    if placeholder.is_empty() {
        return template.to_string();
    }
    template.replace(placeholder, version)
}

pub fn parse(text: &str) -> Result<Node> {
    let value: Value = serde_yaml::from_str(text)?;
    Node::from_yaml(&value)
}

pub fn resolve_text(
    template: &str,
    placeholder: &str,
    version: &str,
    policy: UnresolvedPolicy,
) -> Result<FileToLabelMap> {
    let tree = parse(&substitute(template, placeholder, version))?;
    Ok(tree.flatten(policy))
}

pub fn load(
    path: &Path,
    placeholder: &str,
    version: &str,
    policy: UnresolvedPolicy,
) -> Result<FileToLabelMap> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read manifest {}: {e}", path.display())))?;
    let map = resolve_text(&raw, placeholder, version, policy)
        .map_err(|e| e.context(format!("manifest {}", path.display())))?;
    info!(path = %path.display(), version = %version, entries = map.len(), "manifest resolved");
    Ok(map)
}
