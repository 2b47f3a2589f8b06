//! Experiment tree: an ordered, repeatable composition of elements and
//! nested experiments.

use crate::elements::Element;
use serde::{Deserialize, Serialize};

/// Largest repeat count a node can carry.
pub const MAX_REPEAT: u16 = u16::MAX;

/// Name reported when none was set.
pub const DEFAULT_NAME: &str = "Custom Experiment";

/// Description reported when none was set.
pub const DEFAULT_DESCRIPTION: &str = "Not Defined";

/// Category reported when none was set.
pub const DEFAULT_CATEGORY: &str = "Custom";

/// Normalize a requested repeat count.
///
/// Returns `None` for counts below 1; counts above [`MAX_REPEAT`] clamp.
pub fn effective_repeat(requested: u32) -> Option<u16> {
    if requested < 1 {
        return None;
    }
    Some(u16::try_from(requested).unwrap_or(MAX_REPEAT))
}

/// Content of one tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeContent {
    /// A single element
    Element(Element),
    /// A nested experiment, expanded in place
    Experiment(Experiment),
}

/// One entry of an experiment's node sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// What this node executes
    pub content: NodeContent,
    /// How many consecutive times its whole expansion runs
    pub repeat: u16,
}

/// A program for one channel.
///
/// The tree owns every node by value and sub-experiments are cloned on
/// append, so a tree can never contain itself and later changes to appended
/// values do not reach it.
///
/// # Example
///
/// ```
/// use echem_daq::elements::{Element, OpenCircuit};
/// use echem_daq::experiment::Experiment;
///
/// let ocp = Element::from(OpenCircuit::new(10.0, 1.0));
/// let mut inner = Experiment::new();
/// inner.append_element(&ocp, 1);
///
/// let mut exp = Experiment::new();
/// assert!(exp.append_sub_experiment(&inner, 3));
/// assert!(!exp.append_element(&ocp, 0));
/// assert_eq!(exp.len(), 1);
/// assert_eq!(exp.leaf_count(), 3);
/// assert_eq!(exp.name(), "Custom Experiment");
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Experiment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    category: Option<Vec<String>>,
    #[serde(default)]
    nodes: Vec<Node>,
}

impl Experiment {
    /// Create an empty experiment with default metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty experiment with a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Append a copy of `element`, to run `repeat` times.
    ///
    /// Returns `false` and leaves the tree unchanged when `repeat` is 0.
    /// Counts above [`MAX_REPEAT`] are clamped.
    pub fn append_element(&mut self, element: &Element, repeat: u32) -> bool {
        self.push(NodeContent::Element(element.clone()), repeat)
    }

    /// Append a deep copy of `sub`, to run `repeat` times.
    ///
    /// Same contract as [`append_element`](Self::append_element).
    pub fn append_sub_experiment(&mut self, sub: &Experiment, repeat: u32) -> bool {
        self.push(NodeContent::Experiment(sub.clone()), repeat)
    }

    fn push(&mut self, content: NodeContent, repeat: u32) -> bool {
        match effective_repeat(repeat) {
            Some(repeat) => {
                self.nodes.push(Node { content, repeat });
                true
            }
            None => false,
        }
    }

    /// Experiment name, or [`DEFAULT_NAME`].
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    /// Set the experiment name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Description, or [`DEFAULT_DESCRIPTION`].
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(DEFAULT_DESCRIPTION)
    }

    /// Set the description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// Category tags, or `[DEFAULT_CATEGORY]`.
    pub fn category(&self) -> Vec<String> {
        match &self.category {
            Some(category) => category.clone(),
            None => vec![DEFAULT_CATEGORY.to_string()],
        }
    }

    /// Set the category tags.
    pub fn set_category<I, S>(&mut self, category: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.category = Some(category.into_iter().map(Into::into).collect());
    }

    /// Top-level nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of top-level nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no node has been appended.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of element executions after expanding every repeat.
    ///
    /// Saturates at `u64::MAX` for absurdly deep repeat products.
    pub fn leaf_count(&self) -> u64 {
        self.nodes.iter().fold(0u64, |total, node| {
            let once = match &node.content {
                NodeContent::Element(_) => 1,
                NodeContent::Experiment(sub) => sub.leaf_count(),
            };
            total.saturating_add(once.saturating_mul(u64::from(node.repeat)))
        })
    }
}
