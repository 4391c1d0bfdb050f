// descriptor.rs — Flowunit descriptor model and registry
//
// A descriptor identifies one kind of processing node: its input/output port
// sets, its branching category, and (for stream flowunits) the stream-count
// policy. Descriptors are registered once at init and frozen; the graph
// builder resolves node declarations against the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::diag::GraphError;

// ── Category ────────────────────────────────────────────────────────────────

/// Branching category of a flowunit. `Normal` and `Stream` are plain flow
/// types; the remaining four drive hierarchy checking. A descriptor carries
/// exactly one category; for branching flowunits the branching kind
/// dominates the flow type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowunitCategory {
    Normal,
    Stream,
    Condition,
    Expand,
    Collapse,
    Loop,
}

impl FlowunitCategory {
    /// True for categories that open a new hierarchy level.
    pub fn is_opener(self) -> bool {
        matches!(
            self,
            FlowunitCategory::Expand | FlowunitCategory::Condition | FlowunitCategory::Loop
        )
    }
}

impl fmt::Display for FlowunitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowunitCategory::Normal => "normal",
            FlowunitCategory::Stream => "stream",
            FlowunitCategory::Condition => "condition",
            FlowunitCategory::Expand => "expand",
            FlowunitCategory::Collapse => "collapse",
            FlowunitCategory::Loop => "loop",
        };
        write!(f, "{}", name)
    }
}

// ── Descriptor ──────────────────────────────────────────────────────────────

/// Immutable description of one kind of flowunit.
///
/// Port order within a set is cosmetic except for loops, where the first
/// output feeds the loop body and the remaining outputs exit the loop, and
/// the first input receives both the external stream and the back-edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowunitDesc {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    category: FlowunitCategory,
    /// For stream flowunits: output stream length equals input stream length.
    /// Carried as metadata for the execution engine; the checker ignores it.
    stream_same_count: bool,
}

impl FlowunitDesc {
    pub fn new(
        name: impl Into<String>,
        inputs: &[&str],
        outputs: &[&str],
        category: FlowunitCategory,
    ) -> Self {
        FlowunitDesc {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            category,
            stream_same_count: false,
        }
    }

    pub fn with_stream_same_count(mut self, same: bool) -> Self {
        self.stream_same_count = same;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn category(&self) -> FlowunitCategory {
        self.category
    }

    pub fn stream_same_count(&self) -> bool {
        self.stream_same_count
    }

    pub fn input_index(&self, port: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p == port)
    }

    pub fn output_index(&self, port: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p == port)
    }

    /// The port feeding the loop body (loops only).
    pub fn body_output(&self) -> Option<&str> {
        match self.category {
            FlowunitCategory::Loop => self.outputs.first().map(|s| s.as_str()),
            _ => None,
        }
    }

    /// The port receiving both the external stream and the back-edge
    /// (loops only).
    pub fn loop_input(&self) -> Option<&str> {
        match self.category {
            FlowunitCategory::Loop => self.inputs.first().map(|s| s.as_str()),
            _ => None,
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Process-wide descriptor registry. Populated at init, frozen afterwards;
/// `clear` exists for teardown between runs.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    by_name: HashMap<String, Arc<FlowunitDesc>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Duplicate names and duplicate port names
    /// within a set are rejected.
    pub fn register(&mut self, desc: FlowunitDesc) -> Result<(), GraphError> {
        for (label, ports) in [("input", &desc.inputs), ("output", &desc.outputs)] {
            for (i, port) in ports.iter().enumerate() {
                if ports[..i].contains(port) {
                    return Err(GraphError::BadGraphSyntax(format!(
                        "flowunit '{}' declares duplicate {} port '{}'",
                        desc.name, label, port
                    )));
                }
            }
        }
        if self.by_name.contains_key(&desc.name) {
            return Err(GraphError::BadGraphSyntax(format!(
                "flowunit '{}' registered twice",
                desc.name
            )));
        }
        self.by_name.insert(desc.name.clone(), Arc::new(desc));
        Ok(())
    }

    /// Look up a descriptor for the named flowunit, on behalf of `node`.
    pub fn get(&self, flowunit: &str, node: &str) -> Result<Arc<FlowunitDesc>, GraphError> {
        self.by_name
            .get(flowunit)
            .cloned()
            .ok_or_else(|| GraphError::UnknownFlowunit {
                node: node.to_string(),
                flowunit: flowunit.to_string(),
            })
    }

    pub fn contains(&self, flowunit: &str) -> bool {
        self.by_name.contains_key(flowunit)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FlowunitDesc>> {
        self.by_name.values()
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::ErrorKind;

    #[test]
    fn register_and_lookup() {
        let mut registry = DescriptorRegistry::new();
        registry
            .register(FlowunitDesc::new(
                "resize",
                &["In_1"],
                &["Out_1"],
                FlowunitCategory::Normal,
            ))
            .unwrap();

        let desc = registry.get("resize", "r0").unwrap();
        assert_eq!(desc.inputs(), ["In_1"]);
        assert_eq!(desc.output_index("Out_1"), Some(0));
        assert!(!desc.category().is_opener());
        assert!(!desc.stream_same_count());
    }

    #[test]
    fn stream_count_policy_is_carried() {
        let desc = FlowunitDesc::new("window", &["In_1"], &["Out_1"], FlowunitCategory::Stream)
            .with_stream_same_count(true);
        assert!(desc.stream_same_count());
    }

    #[test]
    fn missing_flowunit_is_reported() {
        let registry = DescriptorRegistry::new();
        let err = registry.get("decode", "d0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownFlowunit);
    }

    #[test]
    fn duplicate_ports_rejected() {
        let mut registry = DescriptorRegistry::new();
        let err = registry
            .register(FlowunitDesc::new(
                "bad",
                &["In_1", "In_1"],
                &[],
                FlowunitCategory::Normal,
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadGraphSyntax);
    }

    #[test]
    fn loop_body_ports() {
        let desc = FlowunitDesc::new(
            "iterate",
            &["In_1"],
            &["Out_1", "Out_2"],
            FlowunitCategory::Loop,
        );
        assert_eq!(desc.body_output(), Some("Out_1"));
        assert_eq!(desc.loop_input(), Some("In_1"));
        assert!(desc.category().is_opener());
    }
}
