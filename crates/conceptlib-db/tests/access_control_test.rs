//! Permission resolution against a migrated database: group grants, brand
//! scoping and filtered listings.

use chrono::Utc;
use conceptlib_db::test_fixtures::{ctx, TestDatabase};
use conceptlib_db::{
    AccessContext, AccessLevel, EntityBody, EntityFields, EntityFilter, EntityRepository, EntityType, Error, PermissionResolver,
    TagType,
};

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_group_view_does_not_grant_edit() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("group_owner").await;
    let member = test_db.create_user("group_member").await;
    let outsider = test_db.create_user("group_outsider").await;
    let group_id = test_db.create_group("readers", &[&member]).await;

    let mut fields = EntityFields::new(EntityBody::empty(EntityType::Phenotype), "Shared", owner.id, Utc::now());
    fields.group_id = Some(group_id);
    fields.group_access = AccessLevel::View;
    let phenotype = test_db.create_entity(&owner, fields).await;
    let permissions = &test_db.db.permissions;

    assert!(permissions
        .can_view(&ctx(&member), phenotype.entity, None)
        .await
        .expect("can view"));
    assert!(!permissions
        .can_edit(&ctx(&member), phenotype.entity)
        .await
        .expect("can edit"));
    assert!(!permissions
        .can_view(&ctx(&outsider), phenotype.entity, None)
        .await
        .expect("can view"));

    let denied = permissions.ensure_edit(&ctx(&member), phenotype.entity).await;
    assert!(matches!(denied, Err(Error::PermissionDenied(_))));
    assert!(permissions
        .can_edit(&ctx(&owner), phenotype.entity)
        .await
        .expect("can edit"));
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_brand_scope_hides_entities_outside_collections() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("brand_owner").await;
    let collection = test_db.create_tag("Brand collection", TagType::Collection).await;
    let brand = test_db.create_brand("brand", &[collection]).await;

    let mut inside = EntityFields::new(EntityBody::empty(EntityType::Phenotype), "Inside", owner.id, Utc::now());
    inside.tags = vec![collection];
    let inside = test_db.create_entity(&owner, inside).await;
    let outside = test_db.create_phenotype(&owner, "Outside", &[]).await;

    let branded = ctx(&owner).with_brand(brand.clone());
    let permissions = &test_db.db.permissions;
    assert!(permissions
        .can_view(&branded, inside.entity, None)
        .await
        .expect("can view"));
    assert!(!permissions
        .can_view(&branded, outside.entity, None)
        .await
        .expect("can view"));
    assert!(permissions
        .can_view(&ctx(&owner), outside.entity, None)
        .await
        .expect("can view"));

    let unknown_brand = ctx(&owner).with_brand("no-such-brand");
    assert!(permissions
        .can_view(&unknown_brand, outside.entity, None)
        .await
        .expect("can view"));
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_deleted_entity_is_not_editable() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("deleted_owner").await;
    let concept = test_db.create_concept(&owner, "Retired").await;

    test_db
        .db
        .entities
        .soft_delete(&ctx(&owner), concept.entity, Some("Retired"))
        .await
        .expect("delete");
    let live = test_db.db.entities.fetch(concept.entity).await.expect("fetch");
    assert!(live.fields.is_deleted);
    assert_eq!(live.fields.deleted_by, Some(owner.id));

    test_db
        .db
        .entities
        .restore(&ctx(&owner), concept.entity, None)
        .await
        .expect("restore");
    let live = test_db.db.entities.fetch(concept.entity).await.expect("fetch");
    assert!(!live.fields.is_deleted);
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_listing_with_unknown_tags_matches_nothing() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("listing_owner").await;
    let tag = test_db.create_tag("Respiratory", TagType::Tag).await;

    let mut tagged = EntityFields::new(EntityBody::empty(EntityType::Phenotype), "Tagged", owner.id, Utc::now());
    tagged.tags = vec![tag];
    let tagged = test_db.create_entity(&owner, tagged).await;
    test_db.create_phenotype(&owner, "Untagged", &[]).await;

    let by_owner = EntityFilter::new()
        .of_type(EntityType::Phenotype)
        .owned_by(owner.id);
    let all = test_db.db.entities.list(&ctx(&owner), &by_owner, 50, 0).await.expect("list");
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].fields.name, "Untagged");

    let with_tag = by_owner.clone().with_any_tags([tag]);
    let found = test_db.db.entities.list(&ctx(&owner), &with_tag, 50, 0).await.expect("list");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity, tagged.entity);

    let unknown = by_owner.with_any_tags([i64::MAX]);
    let none = test_db.db.entities.list(&ctx(&owner), &unknown, 50, 0).await.expect("list");
    assert!(none.is_empty());
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_listing_only_returns_viewable_entities() {
    let test_db = TestDatabase::new().await;
    let owner = test_db.create_user("visible_owner").await;
    let stranger = test_db.create_user("visible_stranger").await;
    let collection = test_db.create_tag("Listing collection", TagType::Collection).await;
    let brand = test_db.create_brand("listing", &[collection]).await;

    let private = test_db.create_phenotype(&owner, "Private", &[]).await;
    let mut public = EntityFields::new(EntityBody::empty(EntityType::Phenotype), "World readable", owner.id, Utc::now());
    public.world_access = AccessLevel::View;
    public.tags = vec![collection];
    let public = test_db.create_entity(&owner, public).await;

    let by_owner = EntityFilter::new()
        .of_type(EntityType::Phenotype)
        .owned_by(owner.id);
    let entities = &test_db.db.entities;

    let own = entities.list(&ctx(&owner), &by_owner, 50, 0).await.expect("list");
    assert_eq!(own.len(), 2);

    let seen = entities.list(&ctx(&stranger), &by_owner, 50, 0).await.expect("list");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].entity, public.entity);
    assert!(seen.iter().all(|e| e.entity != private.entity));

    let anonymous = entities
        .list(&AccessContext::anonymous(), &by_owner, 50, 0)
        .await
        .expect("list");
    assert!(anonymous.is_empty());

    let branded = entities
        .list(&ctx(&owner).with_brand(brand), &by_owner, 50, 0)
        .await
        .expect("list");
    assert_eq!(branded.len(), 1);
    assert_eq!(branded[0].entity, public.entity);

    let second_page = entities.list(&ctx(&owner), &by_owner, 1, 1).await.expect("list");
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].entity, own[1].entity);
}
