//! Filename attribute extraction for intake.
//!
//! Configured as a YAML map of attribute name to `{Id, DataType}`:
//!
//! ```yaml
//! timepoint: { Id: t, DataType: int }
//! stained: { Id: stain, DataType: bool }
//! lab: { Id: lab, DataType: string }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::FileInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Bool,
    Int,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeInfo {
    pub id: String,
    pub data_type: AttributeType,
}

#[derive(Debug, Error)]
pub enum AttributeError {
    #[error("reading attribute parser config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing attribute parser config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("attribute {name}: {source}")]
    Pattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
struct Rule {
    name: String,
    data_type: AttributeType,
    pattern: Regex,
}

#[derive(Debug, Clone, Default)]
pub struct AttributeParser {
    rules: Vec<Rule>,
}

impl AttributeParser {
    pub fn new(config: BTreeMap<String, AttributeInfo>) -> Result<Self, AttributeError> {
        let mut rules = Vec::with_capacity(config.len());
        for (name, info) in config {
            let id = regex::escape(&info.id);
            let raw = match info.data_type {
                AttributeType::Bool => format!("[^a-z]{id}[^a-z]"),
                AttributeType::Int => format!(r"{id}(\d+)"),
                AttributeType::String => format!(r"{id}\W([a-z]+)"),
            };
            let pattern = Regex::new(&raw).map_err(|source| AttributeError::Pattern {
                name: name.clone(),
                source,
            })?;
            rules.push(Rule {
                name,
                data_type: info.data_type,
                pattern,
            });
        }
        Ok(Self { rules })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, AttributeError> {
        let config: BTreeMap<String, AttributeInfo> = serde_yaml::from_str(text)?;
        Self::new(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, AttributeError> {
        let text = std::fs::read_to_string(path).map_err(|source| AttributeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Adds every attribute found in `file.name` to `file.attributes`.
    pub fn parse_into(&self, file: &mut FileInfo) {
        for rule in &self.rules {
            let value = match rule.data_type {
                // A leading separator lets a flag match at the start of the name.
                AttributeType::Bool => {
                    Some(rule.pattern.is_match(&format!("-{}", file.name)).to_string())
                }
                AttributeType::Int => rule
                    .pattern
                    .captures(&file.name)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<u64>().ok())
                    .map(|n| n.to_string()),
                AttributeType::String => rule
                    .pattern
                    .captures(&file.name)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string()),
            };
            if let Some(value) = value {
                file.attributes.insert(rule.name.clone(), value);
            }
        }
    }
}
