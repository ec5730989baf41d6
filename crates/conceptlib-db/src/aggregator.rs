//! Export rowset assembly over stored revisions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use tracing::info;

use conceptlib_core::{
    assemble_rows, CodeAggregator, CodeSet, ConceptCodes, ConceptVersionKey, CoreConfig, EntityBody, EntityRef,
    EntityType, Error, ExportRow, Lineage, PhenotypeLineage, Result, RevisionId,
};

use crate::graph;
use crate::revisions;

/// Name and coding system of one concept revision.
async fn concept_header(conn: &mut PgConnection, key: ConceptVersionKey) -> Result<(String, Option<String>)> {
    let revision = revisions::fetch_revision(conn, EntityRef::concept(key.concept_id), key.revision_id).await?;
    let coding_system = match revision.fields.body {
        EntityBody::Concept {
            coding_system_id: Some(id),
        } => {
            let row: Option<(String,)> = sqlx::query_as("SELECT name FROM coding_system WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(Error::Database)?;
            row.map(|(name,)| name)
        }
        _ => None,
    };
    Ok((revision.fields.name, coding_system))
}

/// Collects codes per concept revision, reusing results within one export.
struct Collector<'a> {
    conn: &'a mut PgConnection,
    max_depth: usize,
    memo: HashMap<ConceptVersionKey, CodeSet>,
}

impl<'a> Collector<'a> {
    fn new(conn: &'a mut PgConnection, max_depth: usize) -> Self {
        Self {
            conn,
            max_depth,
            memo: HashMap::new(),
        }
    }

    async fn entry(
        &mut self,
        key: ConceptVersionKey,
        phenotype: Option<PhenotypeLineage>,
        attributes: Vec<String>,
    ) -> Result<ConceptCodes> {
        let (concept_name, coding_system) = concept_header(&mut *self.conn, key).await?;
        let codes = match self.memo.get(&key) {
            Some(codes) => codes.clone(),
            None => {
                let codes = graph::collect_codes_on(&mut *self.conn, key, self.max_depth).await?;
                self.memo.insert(key, codes.clone());
                codes
            }
        };
        Ok(ConceptCodes {
            lineage: Lineage {
                concept: key,
                concept_name,
                coding_system,
                phenotype,
                attributes,
            },
            codes,
        })
    }
}

/// PostgreSQL implementation of CodeAggregator.
#[derive(Clone)]
pub struct PgCodeAggregator {
    pool: PgPool,
    config: Arc<CoreConfig>,
}

impl PgCodeAggregator {
    pub fn new(pool: PgPool, config: Arc<CoreConfig>) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl CodeAggregator for PgCodeAggregator {
    async fn aggregate(&self, entity: EntityRef, revision_id: RevisionId) -> Result<Vec<ExportRow>> {
        if entity.entity_type == EntityType::DataSource {
            return Err(Error::InvalidInput("Data sources have no codes to export".to_string()));
        }
        let start = Instant::now();
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        let revision = revisions::fetch_revision(&mut conn, entity, revision_id).await?;

        let mut phenotype_names: HashMap<(i64, i64), Option<String>> = HashMap::new();
        let mut entries = Vec::new();
        {
            let mut collector = Collector::new(&mut conn, self.config.max_graph_depth);
            match &revision.fields.body {
                EntityBody::Concept { .. } => {
                    let key = ConceptVersionKey::new(entity.id, revision_id);
                    entries.push(collector.entry(key, None, Vec::new()).await?);
                }
                EntityBody::Phenotype { concepts, .. } | EntityBody::WorkingSet { concepts } => {
                    for reference in concepts {
                        entries.push(
                            collector
                                .entry(reference.key(), None, reference.attributes.clone())
                                .await?,
                        );
                    }
                }
                EntityBody::PhenotypeWorkingset {
                    phenotypes_concepts,
                } => {
                    for reference in phenotypes_concepts {
                        let pin = (reference.phenotype_id, reference.phenotype_version_id);
                        if !phenotype_names.contains_key(&pin) {
                            let name = match revisions::fetch_revision(
                                &mut *collector.conn,
                                EntityRef::phenotype(pin.0),
                                pin.1,
                            )
                            .await
                            {
                                Ok(phenotype) => Some(phenotype.fields.name),
                                Err(e) if e.is_not_found() => None,
                                Err(e) => return Err(e),
                            };
                            phenotype_names.insert(pin, name);
                        }
                        let lineage = PhenotypeLineage {
                            phenotype_id: pin.0,
                            phenotype_revision_id: pin.1,
                            phenotype_name: phenotype_names.get(&pin).cloned().flatten(),
                        };
                        entries.push(
                            collector
                                .entry(reference.key(), Some(lineage), reference.attributes.clone())
                                .await?,
                        );
                    }
                }
                EntityBody::DataSource { .. } => {}
            }
        }

        let rows = assemble_rows(entries);
        info!(
            subsystem = "db",
            component = "aggregator",
            op = "aggregate",
            entity_type = entity.entity_type.as_str(),
            entity_id = entity.id,
            revision_id,
            result_count = rows.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Export rows assembled"
        );
        Ok(rows)
    }
}
