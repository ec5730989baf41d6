//! Fork, revert and export over stored revisions.

use chrono::Utc;
use conceptlib_db::test_fixtures::{ctx, include_codes, TestDatabase};
use conceptlib_db::{
    AccessLevel, CodeAggregator, ConceptGraphRepository, ConceptReference, ConceptVersionKey, EntityBody,
    EntityFields, EntityRef, EntityRepository, EntityType, Error, ForkRevertOperator, LogicalType, NewComponent,
    PublicationRepository, RevisionStore, SaveOptions, SnapshotReconstructor, TagType,
};

fn reference(target: ConceptVersionKey) -> NewComponent {
    NewComponent::concept_reference("Reference", LogicalType::Include, target)
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_fork_copies_children_and_keeps_pins() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("fork_owner").await;
    let forker = test_db.create_superuser("fork_user").await;
    let child = test_db.create_concept(&owner, "Fork child").await;
    let source = test_db.create_concept(&owner, "Fork source").await;
    let graph = &test_db.db.graph;

    let mut fields = source.fields.clone();
    fields.author = "Registry team".to_string();
    fields.description = Some("Adults with a recorded diagnosis".to_string());
    fields.metadata = serde_json::json!({ "origin": "registry" });
    fields.world_access = AccessLevel::View;
    test_db
        .db
        .entities
        .save(&ctx(&owner), source.entity, fields, SaveOptions::new())
        .await
        .expect("describe source");

    let pinned = graph
        .add_component(&ctx(&owner), child.entity.id, include_codes("Child", &[("K1", "Kappa")]), None)
        .await
        .expect("child codes");
    graph
        .add_component(&ctx(&owner), source.entity.id, include_codes("Own", &[("S1", "Sigma")]), None)
        .await
        .expect("source codes");
    let source_rev = graph
        .add_component(
            &ctx(&owner),
            source.entity.id,
            reference(ConceptVersionKey::new(child.entity.id, pinned)),
            None,
        )
        .await
        .expect("source reference");

    let forked = test_db
        .db
        .fork
        .fork(&ctx(&forker), source.entity, source_rev)
        .await
        .expect("fork");
    assert_ne!(forked, source.entity);
    assert_eq!(forked.entity_type, EntityType::Concept);

    let live = test_db.db.entities.fetch(forked).await.expect("fetch fork");
    let copied = test_db
        .db
        .revisions
        .get_revision(source.entity, source_rev)
        .await
        .expect("source revision")
        .fields;
    assert_eq!(live.fields.owner_id, forker.id);
    assert_eq!(live.fields.created_by, Some(forker.id));
    assert_eq!(live.fields.name, copied.name);
    assert_eq!(live.fields.author, "Registry team");
    assert_eq!(live.fields.author, copied.author);
    assert_eq!(live.fields.description, copied.description);
    assert_eq!(live.fields.metadata, copied.metadata);
    assert_eq!(live.fields.group_id, copied.group_id);
    assert_eq!(live.fields.owner_access, copied.owner_access);
    assert_eq!(live.fields.group_access, copied.group_access);
    assert_eq!(live.fields.world_access, AccessLevel::View);
    assert_eq!(live.fields.tags, copied.tags);
    assert_eq!(live.fields.collections, copied.collections);
    assert_eq!(live.fields.body, copied.body);
    assert!(!live.fields.is_deleted);

    let revisions = test_db.db.revisions.list_revisions(forked).await.expect("revisions");
    assert_eq!(revisions.len(), 1);
    let reason = revisions[0].meta.change_reason.clone().unwrap_or_default();
    assert_eq!(reason, format!("Forked from {}/{}", source.entity_code, source_rev));

    let snapshot = test_db
        .db
        .snapshots
        .reconstruct(forked, revisions[0].meta.revision_id)
        .await
        .expect("snapshot");
    assert_eq!(snapshot.children.components.len(), 2);
    assert!(snapshot
        .children
        .components
        .iter()
        .any(|c| c.concept_ref == Some(ConceptVersionKey::new(child.entity.id, pinned))));

    let original = graph.collect_codes_as_of(source.entity.id, source_rev).await.expect("collect");
    let copy = graph
        .collect_codes_as_of(forked.id, revisions[0].meta.revision_id)
        .await
        .expect("collect");
    assert_eq!(original, copy);
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_revert_restores_earlier_fields_and_components() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("revert_owner").await;
    let concept = test_db.create_concept(&owner, "Revert me").await;
    let graph = &test_db.db.graph;

    let target = graph
        .add_component(&ctx(&owner), concept.entity.id, include_codes("Keep", &[("R1", "Rho")]), None)
        .await
        .expect("first codes");
    graph
        .add_component(&ctx(&owner), concept.entity.id, include_codes("Later", &[("R2", "Rho two")]), None)
        .await
        .expect("second codes");

    let reverted = test_db
        .db
        .fork
        .revert(&ctx(&owner), concept.entity, target, None)
        .await
        .expect("revert");

    let revision = test_db
        .db
        .revisions
        .get_revision(concept.entity, reverted)
        .await
        .expect("revision");
    assert_eq!(
        revision.meta.change_reason.as_deref(),
        Some(format!("Reverted from revision {}", target).as_str())
    );

    let codes = graph.collect_codes_as_of(concept.entity.id, reverted).await.expect("collect");
    assert!(codes.contains("R1"));
    assert!(!codes.contains("R2"));
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_revert_that_would_close_a_cycle_changes_nothing() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("rollback_owner").await;
    let a = test_db.create_concept(&owner, "Rollback A").await;
    let b = test_db.create_concept(&owner, "Rollback B").await;
    let graph = &test_db.db.graph;

    let b_rev = test_db.db.revisions.latest_revision_id(b.entity).await.expect("latest");
    let with_reference = graph
        .add_component(&ctx(&owner), a.entity.id, reference(ConceptVersionKey::new(b.entity.id, b_rev)), None)
        .await
        .expect("A references B");
    let snapshot = test_db
        .db
        .snapshots
        .reconstruct(a.entity, with_reference)
        .await
        .expect("snapshot");
    let component_id = snapshot.children.components[0].component_id;
    let without_reference = graph
        .remove_component(&ctx(&owner), a.entity.id, component_id, None)
        .await
        .expect("A drops B");

    graph
        .add_component(
            &ctx(&owner),
            b.entity.id,
            reference(ConceptVersionKey::new(a.entity.id, without_reference)),
            None,
        )
        .await
        .expect("B references A");

    let result = test_db.db.fork.revert(&ctx(&owner), a.entity, with_reference, None).await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let latest = test_db.db.revisions.latest_revision_id(a.entity).await.expect("latest");
    assert_eq!(latest, without_reference);
    let current = test_db
        .db
        .snapshots
        .reconstruct(a.entity, latest)
        .await
        .expect("snapshot");
    assert!(current.children.components.is_empty());
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_revert_of_deleted_entity_is_denied() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("deleted_revert_owner").await;
    let concept = test_db.create_concept(&owner, "Deleted").await;
    let first = test_db.db.revisions.latest_revision_id(concept.entity).await.expect("latest");

    test_db
        .db
        .entities
        .soft_delete(&ctx(&owner), concept.entity, None)
        .await
        .expect("delete");
    let deleted_rev = test_db.db.revisions.latest_revision_id(concept.entity).await.expect("latest");

    let result = test_db.db.fork.revert(&ctx(&owner), concept.entity, first, None).await;
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
    let latest = test_db.db.revisions.latest_revision_id(concept.entity).await.expect("latest");
    assert_eq!(latest, deleted_rev);
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_revert_leaves_publications_alone() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("pub_revert_owner").await;
    let concept = test_db.create_concept(&owner, "Published then edited").await;
    let graph = &test_db.db.graph;

    let published = graph
        .add_component(&ctx(&owner), concept.entity.id, include_codes("Base", &[("U1", "Upsilon")]), None)
        .await
        .expect("codes");
    test_db
        .db
        .publications
        .request_publication(&ctx(&owner), concept.entity, published)
        .await
        .expect("publish");
    graph
        .add_component(&ctx(&owner), concept.entity.id, include_codes("Extra", &[("U2", "Upsilon two")]), None)
        .await
        .expect("more codes");

    let before = test_db
        .db
        .publications
        .list_publications(concept.entity)
        .await
        .expect("publications");
    let reverted = test_db
        .db
        .fork
        .revert(&ctx(&owner), concept.entity, published, None)
        .await
        .expect("revert");
    let after = test_db
        .db
        .publications
        .list_publications(concept.entity)
        .await
        .expect("publications");

    assert_eq!(before, after);
    assert_eq!(after.len(), 1);
    assert!(!test_db
        .db
        .publications
        .is_published(concept.entity, reverted)
        .await
        .expect("is published"));
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_revert_restores_tag_map() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("tag_revert_owner").await;
    let kept = test_db.create_tag("Cardiology", TagType::Tag).await;
    let replaced = test_db.create_tag("Oncology", TagType::Tag).await;
    let phenotype = test_db.create_phenotype(&owner, "Tagged phenotype", &[]).await;
    let entities = &test_db.db.entities;

    let tagged = entities
        .set_tag_map(&ctx(&owner), phenotype.entity, &[kept], None)
        .await
        .expect("first tag map");
    entities
        .set_tag_map(&ctx(&owner), phenotype.entity, &[replaced], None)
        .await
        .expect("second tag map");

    let reverted = test_db
        .db
        .fork
        .revert(&ctx(&owner), phenotype.entity, tagged, None)
        .await
        .expect("revert");
    let snapshot = test_db
        .db
        .snapshots
        .reconstruct(phenotype.entity, reverted)
        .await
        .expect("snapshot");
    assert_eq!(snapshot.children.tag_ids, vec![kept]);
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_revert_with_stale_expectation_is_refused() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("stale_revert_owner").await;
    let concept = test_db.create_concept(&owner, "Busy concept").await;
    let first = test_db.db.revisions.latest_revision_id(concept.entity).await.expect("latest");
    let graph = &test_db.db.graph;

    let seen = graph
        .add_component(&ctx(&owner), concept.entity.id, include_codes("One", &[("S1", "Sigma")]), None)
        .await
        .expect("codes");
    let newer = graph
        .add_component(&ctx(&owner), concept.entity.id, include_codes("Two", &[("S2", "Sigma two")]), None)
        .await
        .expect("more codes");

    let result = test_db.db.fork.revert(&ctx(&owner), concept.entity, first, Some(seen)).await;
    match result {
        Err(Error::StaleEdit { expected, actual }) => {
            assert_eq!(expected, seen);
            assert_eq!(actual, newer);
        }
        other => panic!("expected a stale edit, got {other:?}"),
    }

    test_db
        .db
        .fork
        .revert(&ctx(&owner), concept.entity, first, Some(newer))
        .await
        .expect("revert with current expectation");
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_export_keeps_placeholder_rows_for_empty_concepts() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("export_owner").await;
    let empty = test_db.create_concept(&owner, "Empty").await;
    let full = test_db.create_concept(&owner, "Full").await;

    let empty_rev = test_db.db.revisions.latest_revision_id(empty.entity).await.expect("latest");
    let full_rev = test_db
        .db
        .graph
        .add_component(
            &ctx(&owner),
            full.entity.id,
            include_codes("Codes", &[("E1", "Eta"), ("E2", "Eta two")]),
            None,
        )
        .await
        .expect("codes");

    let body = EntityBody::WorkingSet {
        concepts: vec![
            ConceptReference {
                concept_id: empty.entity.id,
                concept_version_id: empty_rev,
                attributes: vec!["primary".to_string()],
            },
            ConceptReference {
                concept_id: full.entity.id,
                concept_version_id: full_rev,
                attributes: Vec::new(),
            },
        ],
    };
    let working_set = test_db
        .create_entity(&owner, EntityFields::new(body, "Export set", owner.id, Utc::now()))
        .await;
    let revision_id = test_db
        .db
        .revisions
        .latest_revision_id(working_set.entity)
        .await
        .expect("latest");

    let rows = test_db
        .db
        .export_for(&ctx(&owner), working_set.entity, revision_id)
        .await
        .expect("export");
    assert_eq!(rows.len(), 3);
    assert!(rows[0].is_placeholder());
    assert_eq!(rows[0].concept_id, empty.entity.id);
    assert_eq!(rows[0].attributes, vec!["primary".to_string()]);
    assert!(rows[1..].iter().all(|r| r.concept_id == full.entity.id && !r.is_placeholder()));

    let data_source = test_db
        .create_entity(
            &owner,
            EntityFields::new(EntityBody::empty(EntityType::DataSource), "Registry", owner.id, Utc::now()),
        )
        .await;
    let result = test_db
        .db
        .aggregator
        .aggregate(EntityRef::new(EntityType::DataSource, data_source.entity.id), 1)
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}
