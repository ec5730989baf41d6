//! Concept reference graph.
//!
//! Two views of the graph live here:
//!
//! - [`ReferenceIndex`]: live edges between concept ids, used to refuse a new
//!   reference that would close a cycle. Cycle detection is a precondition of
//!   edge insertion; traversal code assumes the graph is acyclic.
//! - [`ConceptArena`]: nodes keyed by (concept id, revision id) holding the
//!   components each concept revision had at its own moment. Code collection
//!   evaluates this arena, following pinned revisions only.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Code, ComponentSnapshot, ConceptVersionKey, EntityId, LogicalType};

// =============================================================================
// CYCLE DETECTION
// =============================================================================

/// Reverse adjacency of live concept references: child id → parent ids.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    parents_of: HashMap<EntityId, BTreeSet<EntityId>>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(parent, child)` pairs: `parent` has a component
    /// referencing `child`.
    pub fn from_edges(edges: impl IntoIterator<Item = (EntityId, EntityId)>) -> Self {
        let mut index = Self::new();
        for (parent, child) in edges {
            index.add_edge(parent, child);
        }
        index
    }

    pub fn add_edge(&mut self, parent: EntityId, child: EntityId) {
        self.parents_of.entry(child).or_default().insert(parent);
    }

    /// Every concept that directly or transitively includes `concept`.
    pub fn ancestors_of(&self, concept: EntityId) -> BTreeSet<EntityId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([concept]);
        while let Some(current) = queue.pop_front() {
            if let Some(parents) = self.parents_of.get(&current) {
                for &parent in parents {
                    if seen.insert(parent) {
                        queue.push_back(parent);
                    }
                }
            }
        }
        seen
    }

    /// Whether adding `parent -> proposed_child` would close a cycle.
    ///
    /// Walks the chain of concepts that ultimately include `parent`; the
    /// edge is refused when `proposed_child` is `parent` itself or is found
    /// on that chain, at any depth.
    pub fn detect_cycle(&self, parent: EntityId, proposed_child: EntityId) -> bool {
        parent == proposed_child || self.ancestors_of(parent).contains(&proposed_child)
    }
}

// =============================================================================
// CODE SETS
// =============================================================================

/// Codes keyed by code value, ordered by code.
///
/// A code seen twice keeps the lexicographically greatest description, so
/// the result does not depend on traversal order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSet {
    codes: BTreeMap<String, String>,
}

impl CodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: Code) {
        match self.codes.get_mut(&code.code) {
            Some(existing) if *existing >= code.description => {}
            Some(existing) => *existing = code.description,
            None => {
                self.codes.insert(code.code, code.description);
            }
        }
    }

    pub fn merge(&mut self, other: CodeSet) {
        for (code, description) in other.codes {
            self.insert(Code { code, description });
        }
    }

    pub fn remove_all<'a>(&mut self, codes: impl IntoIterator<Item = &'a String>) {
        for code in codes {
            self.codes.remove(code);
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn code_values(&self) -> impl Iterator<Item = &String> {
        self.codes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = Code> + '_ {
        self.codes.iter().map(|(code, description)| Code::new(code, description))
    }

    pub fn into_codes(self) -> Vec<Code> {
        self.codes
            .into_iter()
            .map(|(code, description)| Code { code, description })
            .collect()
    }
}

impl FromIterator<Code> for CodeSet {
    fn from_iter<I: IntoIterator<Item = Code>>(iter: I) -> Self {
        let mut set = CodeSet::new();
        for code in iter {
            set.insert(code);
        }
        set
    }
}

// =============================================================================
// POINT-IN-TIME ARENA
// =============================================================================

/// Where a component's codes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComponentSource {
    /// Leaf component: its code lists, flattened, as of the concept revision.
    Codes(Vec<Code>),
    /// Reference to a pinned concept revision.
    Reference(ConceptVersionKey),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedComponent {
    pub logical_type: LogicalType,
    pub source: ComponentSource,
}

/// One concept revision with its components as of that revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub key: ConceptVersionKey,
    pub components: Vec<ResolvedComponent>,
}

impl ConceptNode {
    /// Node for `key` from its as-of components.
    pub fn from_components(key: ConceptVersionKey, components: &[ComponentSnapshot]) -> Self {
        let components = components
            .iter()
            .map(|c| ResolvedComponent {
                logical_type: c.logical_type,
                source: match c.concept_ref {
                    Some(target) => ComponentSource::Reference(target),
                    None => ComponentSource::Codes(
                        c.code_lists.iter().flat_map(|l| l.codes.iter().cloned()).collect(),
                    ),
                },
            })
            .collect();
        Self { key, components }
    }

    /// Referenced revisions, in component order.
    pub fn references(&self) -> impl Iterator<Item = ConceptVersionKey> + '_ {
        self.components.iter().filter_map(|c| match c.source {
            ComponentSource::Reference(key) => Some(key),
            ComponentSource::Codes(_) => None,
        })
    }
}

/// Arena of concept revisions reachable from a root.
#[derive(Debug, Clone, Default)]
pub struct ConceptArena {
    nodes: HashMap<ConceptVersionKey, ConceptNode>,
}

impl ConceptArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: ConceptNode) {
        self.nodes.insert(node.key, node);
    }

    pub fn contains(&self, key: &ConceptVersionKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn get(&self, key: &ConceptVersionKey) -> Option<&ConceptNode> {
        self.nodes.get(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Codes implied by `root`.
    ///
    /// At every concept level the includes are unioned first and the
    /// excludes of that same level are subtracted from the union. A
    /// referenced revision contributes its own already-evaluated result.
    /// `max_depth` bounds nesting; exceeding it, or meeting a node already
    /// on the current path, is reported as an internal error.
    pub fn collect_codes(&self, root: ConceptVersionKey, max_depth: usize) -> Result<CodeSet> {
        let mut memo = HashMap::new();
        let mut path = Vec::new();
        self.evaluate(root, &mut path, &mut memo, max_depth)
    }

    fn evaluate(
        &self,
        key: ConceptVersionKey,
        path: &mut Vec<ConceptVersionKey>,
        memo: &mut HashMap<ConceptVersionKey, CodeSet>,
        max_depth: usize,
    ) -> Result<CodeSet> {
        if let Some(done) = memo.get(&key) {
            return Ok(done.clone());
        }
        if path.contains(&key) {
            return Err(Error::Internal(format!(
                "Concept reference cycle through {}",
                key
            )));
        }
        if path.len() >= max_depth {
            return Err(Error::Internal(format!(
                "Concept references nested deeper than {} at {}",
                max_depth, key
            )));
        }
        let node = self
            .nodes
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("Concept revision {}", key)))?;

        path.push(key);
        let mut included = CodeSet::new();
        let mut excluded = CodeSet::new();
        for component in &node.components {
            let codes = match &component.source {
                ComponentSource::Codes(codes) => codes.iter().cloned().collect(),
                ComponentSource::Reference(child) => self.evaluate(*child, path, memo, max_depth)?,
            };
            match component.logical_type {
                LogicalType::Include => included.merge(codes),
                LogicalType::Exclude => excluded.merge(codes),
            }
        }
        path.pop();

        included.remove_all(excluded.code_values());
        memo.insert(key, included.clone());
        Ok(included)
    }
}
