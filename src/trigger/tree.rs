//! Arena of trigger conditions.
use super::TriggerCondition;
use crate::error::{AppResult, AutomationError};
use crate::instrument::ChannelId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Index of a node in a [`TriggerTree`].
pub type NodeId = usize;

/// A validated, acyclic arena of conditions with a designated root.
///
/// Every node has at most one parent and the root has none, so each condition is
/// owned by exactly one place in the tree. Deserialization runs the same validation
/// as [`TriggerTree::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTree")]
pub struct TriggerTree {
    nodes: Vec<TriggerCondition>,
    root: NodeId,
}

#[derive(Deserialize)]
struct RawTree {
    nodes: Vec<TriggerCondition>,
    root: NodeId,
}

impl TryFrom<RawTree> for TriggerTree {
    type Error = AutomationError;

    fn try_from(raw: RawTree) -> Result<Self, Self::Error> {
        TriggerTree::new(raw.nodes, raw.root)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Unvisited,
    InProgress,
    Done,
}

impl TriggerTree {
    /// Validate and build a tree.
    ///
    /// # Errors
    ///
    /// - [`AutomationError::CyclicCondition`] if any node is reachable from itself
    /// - [`AutomationError::Configuration`] for out-of-range indices, empty operand
    ///   lists, shared nodes, inverted pulse bounds or unsupported protocols
    pub fn new(nodes: Vec<TriggerCondition>, root: NodeId) -> AppResult<Self> {
        if root >= nodes.len() {
            return Err(AutomationError::Configuration(format!(
                "Trigger root {} is out of range ({} nodes)",
                root,
                nodes.len()
            )));
        }
        for (id, node) in nodes.iter().enumerate() {
            validate_node(id, node, nodes.len())?;
        }
        detect_cycles(&nodes)?;

        let mut parents = vec![0usize; nodes.len()];
        for node in &nodes {
            for child in node.children() {
                parents[*child] += 1;
            }
        }
        if parents[root] > 0 {
            return Err(AutomationError::Configuration(format!(
                "Trigger root {} is referenced as an operand",
                root
            )));
        }
        if let Some(shared) = parents.iter().position(|count| *count > 1) {
            return Err(AutomationError::Configuration(format!(
                "Trigger node {} is shared by multiple parents",
                shared
            )));
        }

        Ok(Self { nodes, root })
    }

    /// A tree consisting of a single leaf condition.
    pub fn single(condition: TriggerCondition) -> AppResult<Self> {
        Self::new(vec![condition], 0)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&TriggerCondition> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> &[TriggerCondition] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Channels read by nodes reachable from the root.
    pub fn channels(&self) -> BTreeSet<ChannelId> {
        let mut channels = BTreeSet::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            channels.extend(node.channels());
            stack.extend_from_slice(node.children());
        }
        channels
    }
}

fn validate_node(id: NodeId, node: &TriggerCondition, len: usize) -> AppResult<()> {
    if let Some(bad) = node.children().iter().find(|child| **child >= len) {
        return Err(AutomationError::Configuration(format!(
            "Trigger node {} references missing node {}",
            id, bad
        )));
    }
    match node {
        TriggerCondition::Logic { operands, .. } if operands.is_empty() => Err(
            AutomationError::Configuration(format!("Logic node {} has no operands", id)),
        ),
        TriggerCondition::Sequence { steps, .. } if steps.is_empty() => Err(
            AutomationError::Configuration(format!("Sequence node {} has no steps", id)),
        ),
        TriggerCondition::PulseWidth { min, max, .. } if min > max => {
            Err(AutomationError::Configuration(format!(
                "Pulse width node {} has min {:?} greater than max {:?}",
                id, min, max
            )))
        }
        TriggerCondition::Protocol { rule } => rule.validate(),
        _ => Ok(()),
    }
}

/// Depth-first traversal with a visited set; an edge back to an in-progress node is a cycle.
fn detect_cycles(nodes: &[TriggerCondition]) -> AppResult<()> {
    let mut state = vec![Visit::Unvisited; nodes.len()];
    for start in 0..nodes.len() {
        if state[start] != Visit::Unvisited {
            continue;
        }
        // (node, next child index)
        let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];
        state[start] = Visit::InProgress;
        while let Some((id, next)) = stack.last().copied() {
            let children = nodes[id].children();
            if next < children.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let child = children[next];
                match state[child] {
                    Visit::InProgress => return Err(AutomationError::CyclicCondition(child)),
                    Visit::Unvisited => {
                        state[child] = Visit::InProgress;
                        stack.push((child, 0));
                    }
                    Visit::Done => {}
                }
            } else {
                state[id] = Visit::Done;
                stack.pop();
            }
        }
    }
    Ok(())
}

/// Incremental builder for trigger arenas.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    nodes: Vec<TriggerCondition>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node and returns its id.
    pub fn add(&mut self, condition: TriggerCondition) -> NodeId {
        self.nodes.push(condition);
        self.nodes.len() - 1
    }

    /// Validates the arena with `root` as entry point.
    pub fn build(self, root: NodeId) -> AppResult<TriggerTree> {
        TriggerTree::new(self.nodes, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{Comparator, LogicOperator, ProtocolRule, Slope};
    use std::time::Duration;

    fn level(channel: u8) -> TriggerCondition {
        TriggerCondition::Level {
            channel: ChannelId(channel),
            threshold: 0.5,
            comparator: Comparator::Greater,
        }
    }

    fn logic(operands: Vec<NodeId>) -> TriggerCondition {
        TriggerCondition::Logic {
            operator: LogicOperator::Or,
            operands,
        }
    }

    #[test]
    fn test_self_reference_is_cyclic() {
        let err = TriggerTree::new(vec![logic(vec![0])], 0).unwrap_err();
        assert!(matches!(err, AutomationError::CyclicCondition(0)));
    }

    #[test]
    fn test_indirect_cycle_is_detected() {
        // 0 -> 1 -> 2 -> 1
        let nodes = vec![logic(vec![1]), logic(vec![2]), logic(vec![1, 3]), level(1)];
        let err = TriggerTree::new(nodes, 0).unwrap_err();
        assert!(matches!(err, AutomationError::CyclicCondition(1)));
    }

    #[test]
    fn test_unreachable_cycle_is_detected() {
        let nodes = vec![level(1), logic(vec![2]), logic(vec![1])];
        assert!(matches!(
            TriggerTree::new(nodes, 0),
            Err(AutomationError::CyclicCondition(_))
        ));
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(
            TriggerTree::new(vec![logic(vec![4])], 0),
            Err(AutomationError::Configuration(_))
        ));
        assert!(matches!(
            TriggerTree::new(vec![logic(vec![])], 0),
            Err(AutomationError::Configuration(_))
        ));
        assert!(matches!(
            TriggerTree::new(vec![level(1)], 3),
            Err(AutomationError::Configuration(_))
        ));
        // node 2 shared by two parents
        let shared = vec![logic(vec![1, 2]), logic(vec![2]), level(1)];
        assert!(matches!(
            TriggerTree::new(shared, 0),
            Err(AutomationError::Configuration(_))
        ));
        let inverted = TriggerCondition::PulseWidth {
            channel: ChannelId(1),
            min: Duration::from_millis(2),
            max: Duration::from_millis(1),
            level: 0.0,
            polarity: Default::default(),
        };
        assert!(TriggerTree::single(inverted).is_err());
    }

    #[test]
    fn test_unsupported_protocol_is_configuration_error() {
        let can = TriggerCondition::Protocol {
            rule: ProtocolRule::Can {
                channel: ChannelId(1),
                identifier: 0x123,
            },
        };
        assert!(matches!(
            TriggerTree::single(can),
            Err(AutomationError::Configuration(_))
        ));
    }

    #[test]
    fn test_channels_of_reachable_nodes() {
        let mut builder = TreeBuilder::new();
        let a = builder.add(level(1));
        let b = builder.add(TriggerCondition::Edge {
            channel: ChannelId(3),
            slope: Slope::Rising,
            level: 0.0,
        });
        let root = builder.add(logic(vec![a, b]));
        builder.add(level(4)); // unreachable
        let tree = builder.build(root).unwrap();
        let channels: Vec<_> = tree.channels().into_iter().collect();
        assert_eq!(channels, vec![ChannelId(1), ChannelId(3)]);
    }

    #[test]
    fn test_deserialization_validates() {
        let json = r#"{"nodes":[{"type":"logic","operator":"and","operands":[0]}],"root":0}"#;
        let err = serde_json::from_str::<TriggerTree>(json).unwrap_err();
        assert!(err.to_string().contains("Cyclic"));
    }
}
