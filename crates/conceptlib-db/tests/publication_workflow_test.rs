//! Publication workflow against a migrated database.
//!
//! Covers:
//! - Concepts publish immediately and memoize their code count
//! - Empty definitions cannot be published
//! - Moderated approval, bulk approval of older requests, rejection
//! - Anonymous visibility follows publication

use conceptlib_db::test_fixtures::{ctx, include_codes, TestDatabase};
use conceptlib_db::{
    AccessContext, ApprovalStatus, ConceptGraphRepository, ConceptVersionKey, EntityRepository, Error,
    PermissionResolver, PublicationRepository, RevisionStore, SaveOptions,
};

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_concept_publishes_without_moderation() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("pub_owner").await;
    let concept = test_db.create_concept(&owner, "Published concept").await;
    let revision_id = test_db
        .db
        .graph
        .add_component(
            &ctx(&owner),
            concept.entity.id,
            include_codes("Codes", &[("P1", "One"), ("P2", "Two")]),
            None,
        )
        .await
        .expect("codes");

    let record = test_db
        .db
        .publications
        .request_publication(&ctx(&owner), concept.entity, revision_id)
        .await
        .expect("publish");
    assert_eq!(record.status, ApprovalStatus::Approved);
    assert_eq!(record.code_count, Some(2));
    assert!(test_db
        .db
        .publications
        .is_published(concept.entity, revision_id)
        .await
        .expect("is published"));

    let count = test_db
        .db
        .publications
        .published_code_count(concept.entity.id, revision_id)
        .await
        .expect("code count");
    assert_eq!(count, 2);

    let again = test_db
        .db
        .publications
        .request_publication(&ctx(&owner), concept.entity, revision_id)
        .await;
    assert!(matches!(again, Err(Error::Validation(_))));
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_empty_definitions_cannot_be_published() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("empty_owner").await;

    let concept = test_db.create_concept(&owner, "Empty concept").await;
    let concept_rev = test_db.db.revisions.latest_revision_id(concept.entity).await.expect("latest");
    let result = test_db
        .db
        .publications
        .request_publication(&ctx(&owner), concept.entity, concept_rev)
        .await;
    match result {
        Err(Error::Validation(errors)) => assert!(errors.get("codes").is_some()),
        other => panic!("expected a validation error, got {other:?}"),
    }

    let phenotype = test_db.create_phenotype(&owner, "Empty phenotype", &[]).await;
    let phenotype_rev = test_db.db.revisions.latest_revision_id(phenotype.entity).await.expect("latest");
    let result = test_db
        .db
        .publications
        .request_publication(&ctx(&owner), phenotype.entity, phenotype_rev)
        .await;
    match result {
        Err(Error::Validation(errors)) => assert!(errors.get("concepts").is_some()),
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_approval_also_approves_older_requests() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("bulk_owner").await;
    let moderator = test_db.create_moderator("bulk_moderator").await;
    let concept = test_db.create_concept(&owner, "Referenced").await;
    let concept_rev = test_db.db.revisions.latest_revision_id(concept.entity).await.expect("latest");
    let key = ConceptVersionKey::new(concept.entity.id, concept_rev);

    let phenotype = test_db.create_phenotype(&owner, "Bulk phenotype", &[key]).await;
    let first = test_db.db.revisions.latest_revision_id(phenotype.entity).await.expect("latest");
    let pending = test_db
        .db
        .publications
        .request_publication(&ctx(&owner), phenotype.entity, first)
        .await
        .expect("first request");
    assert_eq!(pending.status, ApprovalStatus::Pending);

    let anonymous = AccessContext::anonymous();
    assert!(!test_db
        .db
        .permissions
        .can_view(&anonymous, phenotype.entity, Some(first))
        .await
        .expect("can view"));

    let mut fields = phenotype.fields.clone();
    fields.description = Some("Second draft".to_string());
    let second = test_db
        .db
        .entities
        .save(&ctx(&owner), phenotype.entity, fields, SaveOptions::new())
        .await
        .expect("save")
        .expect("history recorded");
    test_db
        .db
        .publications
        .request_publication(&ctx(&owner), phenotype.entity, second)
        .await
        .expect("second request");

    let owner_approval = test_db
        .db
        .publications
        .approve(&ctx(&owner), phenotype.entity, second, None)
        .await;
    assert!(matches!(owner_approval, Err(Error::PermissionDenied(_))));

    let approved = test_db
        .db
        .publications
        .approve(&ctx(&moderator), phenotype.entity, second, Some("Looks good"))
        .await
        .expect("approve");
    assert_eq!(approved.len(), 2);
    assert!(approved.iter().all(|r| r.status == ApprovalStatus::Approved));
    assert!(approved.iter().all(|r| r.moderator_id == Some(moderator.id)));

    assert!(test_db
        .db
        .permissions
        .can_view(&anonymous, phenotype.entity, Some(first))
        .await
        .expect("can view"));

    let pending = test_db
        .db
        .publications
        .pending_reviews(&ctx(&moderator), None)
        .await
        .expect("pending");
    assert!(pending.iter().all(|r| r.entity != phenotype.entity));
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_rejected_request_can_be_resubmitted() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("reject_owner").await;
    let moderator = test_db.create_moderator("reject_moderator").await;
    let concept = test_db.create_concept(&owner, "Referenced").await;
    let concept_rev = test_db.db.revisions.latest_revision_id(concept.entity).await.expect("latest");

    let phenotype = test_db
        .create_phenotype(&owner, "Rejected phenotype", &[ConceptVersionKey::new(concept.entity.id, concept_rev)])
        .await;
    let revision_id = test_db.db.revisions.latest_revision_id(phenotype.entity).await.expect("latest");
    test_db
        .db
        .publications
        .request_publication(&ctx(&owner), phenotype.entity, revision_id)
        .await
        .expect("request");

    let rejected = test_db
        .db
        .publications
        .reject(&ctx(&moderator), phenotype.entity, revision_id, Some("Missing description"))
        .await
        .expect("reject");
    assert_eq!(rejected.status, ApprovalStatus::Rejected);
    assert_eq!(rejected.message.as_deref(), Some("Missing description"));
    assert!(!test_db
        .db
        .publications
        .is_published(phenotype.entity, revision_id)
        .await
        .expect("is published"));

    let resubmitted = test_db
        .db
        .publications
        .request_publication(&ctx(&owner), phenotype.entity, revision_id)
        .await
        .expect("resubmit");
    assert_eq!(resubmitted.status, ApprovalStatus::Pending);
    assert_eq!(resubmitted.id, rejected.id);
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_review_queue_is_moderator_only() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("queue_owner").await;
    let moderator = test_db.create_moderator("queue_moderator").await;

    let denied = test_db.db.publications.pending_reviews(&ctx(&owner), None).await;
    assert!(matches!(denied, Err(Error::PermissionDenied(_))));
    let anonymous = test_db
        .db
        .publications
        .pending_reviews(&AccessContext::anonymous(), None)
        .await;
    assert!(matches!(anonymous, Err(Error::PermissionDenied(_))));

    test_db
        .db
        .publications
        .pending_reviews(&ctx(&moderator), None)
        .await
        .expect("moderator queue");
}
