//! Export row assembly.
//!
//! Rows are emitted concept by concept in the order the definition lists
//! them. Within one concept, codes are already coalesced by [`CodeSet`] and
//! come out sorted by code. The same code under two different concepts
//! yields two rows; consumers key rows by (code, concept id).

use serde::{Deserialize, Serialize};

use crate::graph::CodeSet;
use crate::models::{ConceptVersionKey, EntityId, RevisionId};

/// Where a concept sits in the exported definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub concept: ConceptVersionKey,
    pub concept_name: String,
    pub coding_system: Option<String>,
    /// Phenotype the concept was reached through (phenotype working sets).
    #[serde(default)]
    pub phenotype: Option<PhenotypeLineage>,
    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhenotypeLineage {
    pub phenotype_id: EntityId,
    pub phenotype_revision_id: RevisionId,
    pub phenotype_name: Option<String>,
}

/// One concept's contribution to an export.
#[derive(Debug, Clone, PartialEq)]
pub struct ConceptCodes {
    pub lineage: Lineage,
    pub codes: CodeSet,
}

/// One row of the canonical export rowset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRow {
    pub code: String,
    pub description: String,
    pub coding_system: Option<String>,
    pub concept_id: EntityId,
    pub concept_revision_id: RevisionId,
    pub concept_name: String,
    pub phenotype_id: Option<EntityId>,
    pub phenotype_revision_id: Option<RevisionId>,
    pub phenotype_name: Option<String>,
    pub attributes: Vec<String>,
}

impl ExportRow {
    fn from_lineage(lineage: &Lineage, code: String, description: String) -> Self {
        let phenotype = lineage.phenotype.as_ref();
        Self {
            code,
            description,
            coding_system: lineage.coding_system.clone(),
            concept_id: lineage.concept.concept_id,
            concept_revision_id: lineage.concept.revision_id,
            concept_name: lineage.concept_name.clone(),
            phenotype_id: phenotype.map(|p| p.phenotype_id),
            phenotype_revision_id: phenotype.map(|p| p.phenotype_revision_id),
            phenotype_name: phenotype.and_then(|p| p.phenotype_name.clone()),
            attributes: lineage.attributes.clone(),
        }
    }

    /// Row standing in for a concept that yields no codes.
    pub fn placeholder(lineage: &Lineage) -> Self {
        Self::from_lineage(lineage, String::new(), String::new())
    }

    pub fn is_placeholder(&self) -> bool {
        self.code.is_empty()
    }
}

/// Flatten per-concept code sets into export rows.
///
/// Every concept is represented at least once: an empty code set produces
/// a single placeholder row carrying the lineage columns.
pub fn assemble_rows(concepts: impl IntoIterator<Item = ConceptCodes>) -> Vec<ExportRow> {
    let mut rows = Vec::new();
    for entry in concepts {
        if entry.codes.is_empty() {
            rows.push(ExportRow::placeholder(&entry.lineage));
            continue;
        }
        for code in entry.codes.iter() {
            rows.push(ExportRow::from_lineage(&entry.lineage, code.code, code.description));
        }
    }
    rows
}
