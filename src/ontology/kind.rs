//! Kind-inheritance tree.
//!
//! Every kind has exactly one parent except the root [`ROOT_KIND`], which owns
//! the universal `_deleted: bool` property. A kind's effective property set is
//! its own declarations plus those of all its ancestors.

use crate::models::{DELETED_KEY, PropertyType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Name of the root kind.
pub const ROOT_KIND: &str = "Kind";

/// Declared type and optional measurement unit of one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySpec {
    /// Value type.
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    /// Measurement unit, such as `cm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl PropertySpec {
    /// Creates a spec without unit.
    #[must_use]
    pub const fn new(property_type: PropertyType) -> Self {
        Self {
            property_type,
            unit: None,
        }
    }

    /// Sets the measurement unit.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// Property name to spec.
pub type PropertySpecs = BTreeMap<String, PropertySpec>;

/// One node of the kind tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindNode {
    /// Parent kind, `None` only for the root.
    pub parent: Option<String>,
    /// Properties declared on this kind itself.
    #[serde(default)]
    pub properties: PropertySpecs,
}

/// Result of inserting a kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    /// The kind was added. Lists parents that had to be created first.
    Created {
        /// Parents auto-created under the root, outermost first.
        auto_created: Vec<String>,
        /// Declarations dropped because an ancestor already declares the key.
        shadowed: Vec<String>,
    },
    /// The kind already existed; nothing changed.
    Duplicate,
}

/// The kind-inheritance tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindTree {
    kinds: BTreeMap<String, KindNode>,
}

impl Default for KindTree {
    fn default() -> Self {
        Self::new()
    }
}

impl KindTree {
    /// Creates a tree holding only the root kind.
    #[must_use]
    pub fn new() -> Self {
        let mut root = PropertySpecs::new();
        root.insert(DELETED_KEY.to_string(), PropertySpec::new(PropertyType::Bool));
        let mut kinds = BTreeMap::new();
        kinds.insert(
            ROOT_KIND.to_string(),
            KindNode {
                parent: None,
                properties: root,
            },
        );
        Self { kinds }
    }

    /// Returns `true` if the kind exists.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Returns a node.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&KindNode> {
        self.kinds.get(kind)
    }

    /// Number of kinds including the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Always `false`: the root cannot be removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Inserts a kind under `parent`.
    ///
    /// A missing parent is created under the root first. Declared properties
    /// whose key an ancestor already declares are dropped: the ancestor's
    /// declaration wins.
    pub fn insert(&mut self, kind: &str, parent: &str, declared: PropertySpecs) -> Insertion {
        if self.contains(kind) {
            return Insertion::Duplicate;
        }
        let mut auto_created = Vec::new();
        if !self.contains(parent) {
            self.kinds.insert(
                parent.to_string(),
                KindNode {
                    parent: Some(ROOT_KIND.to_string()),
                    properties: PropertySpecs::new(),
                },
            );
            auto_created.push(parent.to_string());
        }

        let inherited = self.effective_properties(parent).unwrap_or_default();
        let mut own = PropertySpecs::new();
        let mut shadowed = Vec::new();
        for (name, spec) in declared {
            if inherited.contains_key(&name) {
                shadowed.push(name);
            } else {
                own.insert(name, spec);
            }
        }

        self.kinds.insert(
            kind.to_string(),
            KindNode {
                parent: Some(parent.to_string()),
                properties: own,
            },
        );
        Insertion::Created {
            auto_created,
            shadowed,
        }
    }

    /// Adds or replaces properties declared on an existing kind.
    ///
    /// Returns `false` if the kind does not exist.
    pub fn extend_properties(&mut self, kind: &str, properties: PropertySpecs) -> bool {
        self.kinds.get_mut(kind).is_some_and(|node| {
            node.properties.extend(properties);
            true
        })
    }

    /// Removes one property declared on the kind itself.
    ///
    /// Returns `None` if the kind does not exist.
    pub fn remove_property(&mut self, kind: &str, name: &str) -> Option<bool> {
        self.kinds
            .get_mut(kind)
            .map(|node| node.properties.remove(name).is_some())
    }

    /// Returns the chain from `kind` up to the root, `kind` first.
    #[must_use]
    pub fn ancestors(&self, kind: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cursor = Some(kind.to_string());
        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                break;
            }
            cursor = self.kinds.get(&current).and_then(|n| n.parent.clone());
            if self.kinds.contains_key(&current) {
                chain.push(current);
            }
        }
        chain
    }

    /// Returns own and inherited properties, or `None` for an unknown kind.
    ///
    /// Declarations nearer to `kind` override those further up, which only
    /// matters for keys added to a child after its creation.
    #[must_use]
    pub fn effective_properties(&self, kind: &str) -> Option<PropertySpecs> {
        if !self.contains(kind) {
            return None;
        }
        let mut merged = PropertySpecs::new();
        for ancestor in self.ancestors(kind).iter().rev() {
            if let Some(node) = self.kinds.get(ancestor) {
                merged.extend(node.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Some(merged)
    }

    /// Returns direct children of a kind.
    #[must_use]
    pub fn children(&self, kind: &str) -> Vec<String> {
        self.kinds
            .iter()
            .filter(|(_, node)| node.parent.as_deref() == Some(kind))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Returns every kind below `kind`, breadth first.
    #[must_use]
    pub fn descendants(&self, kind: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut frontier = vec![kind.to_string()];
        while let Some(current) = frontier.pop() {
            for child in self.children(&current) {
                if !found.contains(&child) {
                    frontier.push(child.clone());
                    found.push(child);
                }
            }
        }
        found
    }

    /// Removes a kind and its whole subtree.
    ///
    /// Returns the removed kinds, or `None` if the kind is unknown or the root.
    pub fn remove(&mut self, kind: &str) -> Option<Vec<String>> {
        if kind == ROOT_KIND || !self.contains(kind) {
            return None;
        }
        let mut removed = vec![kind.to_string()];
        removed.extend(self.descendants(kind));
        for name in &removed {
            self.kinds.remove(name);
        }
        Some(removed)
    }

    /// Renders the tree as indented text.
    #[must_use]
    pub fn render(&self, with_properties: bool) -> String {
        let mut out = String::new();
        self.render_node(ROOT_KIND, "", true, true, with_properties, &mut out);
        out
    }

    fn render_node(
        &self,
        kind: &str,
        prefix: &str,
        is_root: bool,
        is_last: bool,
        with_properties: bool,
        out: &mut String,
    ) {
        let branch = match (is_root, is_last) {
            (true, _) => "",
            (false, true) => "└── ",
            (false, false) => "├── ",
        };
        let _ = write!(out, "{prefix}{branch}{kind}");
        if with_properties
            && let Some(node) = self.kinds.get(kind)
            && !node.properties.is_empty()
        {
            let props = node
                .properties
                .iter()
                .map(|(name, spec)| match &spec.unit {
                    Some(unit) => format!("{name}: {} ({unit})", spec.property_type),
                    None => format!("{name}: {}", spec.property_type),
                })
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(out, " {{{props}}}");
        }
        out.push('\n');

        let child_prefix = match (is_root, is_last) {
            (true, _) => String::new(),
            (false, true) => format!("{prefix}    "),
            (false, false) => format!("{prefix}│   "),
        };
        let children = self.children(kind);
        let count = children.len();
        for (i, child) in children.iter().enumerate() {
            self.render_node(child, &child_prefix, false, i + 1 == count, with_properties, out);
        }
    }
}
