//! Field-level bindings between a source node's declared outputs and a
//! target node's declared inputs.
//!
//! Checked for the editor's benefit only. Execution always pipes raw
//! stdout into stdin regardless of what the contracts say.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ContractField, Workflow};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldBinding {
    pub target_input: String,
    pub source: BindingSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingSource {
    /// Take the named output field of the edge's source node.
    Upstream { output: String },
    /// Use a fixed default.
    Static { value: serde_json::Value },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingIssue {
    UnknownTargetInput { edge_id: String, input: String },
    UnknownUpstreamOutput { edge_id: String, output: String },
    TypeMismatch {
        edge_id: String,
        input: String,
        expected: String,
        found: String,
    },
    DuplicateBinding { edge_id: String, input: String },
    UnboundInput { edge_id: String, input: String },
}

impl fmt::Display for MappingIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingIssue::UnknownTargetInput { edge_id, input } => {
                write!(f, "{edge_id}: target has no input named '{input}'")
            }
            MappingIssue::UnknownUpstreamOutput { edge_id, output } => {
                write!(f, "{edge_id}: source has no output named '{output}'")
            }
            MappingIssue::TypeMismatch {
                edge_id,
                input,
                expected,
                found,
            } => write!(f, "{edge_id}: input '{input}' expects {expected}, got {found}"),
            MappingIssue::DuplicateBinding { edge_id, input } => {
                write!(f, "{edge_id}: input '{input}' is bound more than once")
            }
            MappingIssue::UnboundInput { edge_id, input } => {
                write!(f, "{edge_id}: required input '{input}' is not bound")
            }
        }
    }
}

/// Check every edge that carries bindings. Edges without bindings, and
/// edges whose endpoints are missing, are skipped.
pub fn validate_mappings(workflow: &Workflow) -> Vec<MappingIssue> {
    let mut issues = Vec::new();

    for edge in workflow.edges.iter().filter(|e| !e.mappings.is_empty()) {
        let (Some(source), Some(target)) = (workflow.node(&edge.source), workflow.node(&edge.target))
        else {
            continue;
        };

        let mut bound: HashSet<&str> = HashSet::new();
        for binding in &edge.mappings {
            if !bound.insert(binding.target_input.as_str()) {
                issues.push(MappingIssue::DuplicateBinding {
                    edge_id: edge.id.clone(),
                    input: binding.target_input.clone(),
                });
                continue;
            }

            let Some(input) = find_field(&target.spec.inputs, &binding.target_input) else {
                issues.push(MappingIssue::UnknownTargetInput {
                    edge_id: edge.id.clone(),
                    input: binding.target_input.clone(),
                });
                continue;
            };

            let found = match &binding.source {
                BindingSource::Upstream { output } => {
                    match find_field(&source.spec.outputs, output) {
                        Some(field) => field.field_type.clone(),
                        None => {
                            issues.push(MappingIssue::UnknownUpstreamOutput {
                                edge_id: edge.id.clone(),
                                output: output.clone(),
                            });
                            continue;
                        }
                    }
                }
                BindingSource::Static { value } => json_type_name(value).to_string(),
            };

            if !types_compatible(&input.field_type, &found) {
                issues.push(MappingIssue::TypeMismatch {
                    edge_id: edge.id.clone(),
                    input: input.name.clone(),
                    expected: input.field_type.clone(),
                    found,
                });
            }
        }

        for input in target.spec.inputs.iter().filter(|i| !i.optional) {
            if !bound.contains(input.name.as_str()) {
                issues.push(MappingIssue::UnboundInput {
                    edge_id: edge.id.clone(),
                    input: input.name.clone(),
                });
            }
        }
    }

    issues
}

fn find_field<'a>(fields: &'a [ContractField], name: &str) -> Option<&'a ContractField> {
    fields.iter().find(|f| f.name == name)
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Case-insensitive; `any` and unrecognized type names match everything.
fn types_compatible(expected: &str, found: &str) -> bool {
    const KNOWN: [&str; 6] = ["string", "number", "boolean", "array", "object", "null"];
    let expected = expected.to_ascii_lowercase();
    let found = found.to_ascii_lowercase();
    if expected == found || expected == "any" || found == "any" {
        return true;
    }
    !(KNOWN.contains(&expected.as_str()) && KNOWN.contains(&found.as_str()))
}
