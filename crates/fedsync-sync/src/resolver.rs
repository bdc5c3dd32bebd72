//! Natural-key resolution: maps an incoming record onto at most one local entity.

use fedsync_core::{EntityKeys, LocalEntity, SourceFields, SyncType};
use fedsync_storage::{EntityTx, StoreError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Existing(LocalEntity),
    New,
    /// The record carries no usable natural key.
    Unkeyed,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{count} local {sync_type} entities share natural key {key}")]
    Integrity {
        sync_type: SyncType,
        key: String,
        count: usize,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Looks the record up inside `tx`, so the answer holds for the rest of the
/// transaction. Matching is exact; keys are never normalized beyond trimming.
pub async fn resolve(
    tx: &mut dyn EntityTx,
    fields: &SourceFields,
) -> Result<Resolution, ResolveError> {
    let sync_type = fields.sync_type();
    let keys = fields.keys();
    match sync_type {
        SyncType::Opportunities | SyncType::Awards => {
            let Some(primary) = keys.primary.as_deref() else {
                return Ok(Resolution::Unkeyed);
            };
            let found = tx.find_by_primary_key(sync_type, primary).await?;
            single(sync_type, primary, found)
        }
        SyncType::Organizations => resolve_organization(tx, &keys).await,
    }
}

// UEI first. CAGE is the fallback, restricted to candidates whose UEI does not
// contradict the incoming one.
async fn resolve_organization(
    tx: &mut dyn EntityTx,
    keys: &EntityKeys,
) -> Result<Resolution, ResolveError> {
    let sync_type = SyncType::Organizations;
    if keys.is_empty() {
        return Ok(Resolution::Unkeyed);
    }
    if let Some(uei) = keys.primary.as_deref() {
        let found = tx.find_by_primary_key(sync_type, uei).await?;
        if !found.is_empty() {
            return single(sync_type, uei, found);
        }
    }
    let Some(cage) = keys.secondary.as_deref() else {
        return Ok(Resolution::New);
    };
    let found: Vec<LocalEntity> = tx
        .find_by_secondary_key(sync_type, cage)
        .await?
        .into_iter()
        .filter(|candidate| match (&keys.primary, &candidate.keys.primary) {
            (Some(incoming), Some(existing)) => incoming == existing,
            _ => true,
        })
        .collect();
    single(sync_type, cage, found)
}

fn single(
    sync_type: SyncType,
    key: &str,
    mut found: Vec<LocalEntity>,
) -> Result<Resolution, ResolveError> {
    match found.len() {
        0 => Ok(Resolution::New),
        1 => Ok(found.pop().map_or(Resolution::New, Resolution::Existing)),
        count => Err(ResolveError::Integrity {
            sync_type,
            key: key.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fedsync_core::{OpportunityFields, OrganizationFields};
    use fedsync_storage::{EntityStore, MemoryStore};

    fn org(name: &str, uei: Option<&str>, cage: Option<&str>) -> SourceFields {
        SourceFields::Organization(OrganizationFields {
            name: name.to_string(),
            uei: uei.map(ToString::to_string),
            cage_code: cage.map(ToString::to_string),
            ..Default::default()
        })
    }

    fn opportunity(notice_id: Option<&str>) -> SourceFields {
        SourceFields::Opportunity(OpportunityFields {
            notice_id: notice_id.map(ToString::to_string),
            title: "Janitorial services".into(),
            notice_type: "Solicitation".into(),
            ..Default::default()
        })
    }

    async fn seed(store: &MemoryStore, fields: SourceFields) -> LocalEntity {
        let entity = LocalEntity::from_source(fields, Utc::now());
        let mut tx = store.begin().await.unwrap();
        tx.insert(&entity).await.unwrap();
        tx.commit().await.unwrap();
        entity
    }

    async fn resolve_in(store: &MemoryStore, fields: &SourceFields) -> Result<Resolution, ResolveError> {
        let mut tx = store.begin().await.unwrap();
        resolve(tx.as_mut(), fields).await
    }

    #[tokio::test]
    async fn notice_ids_match_exactly() {
        let store = MemoryStore::new();
        let existing = seed(&store, opportunity(Some("ABC-1"))).await;

        match resolve_in(&store, &opportunity(Some("ABC-1"))).await.unwrap() {
            Resolution::Existing(found) => assert_eq!(found.id, existing.id),
            other => panic!("expected a match, got {other:?}"),
        }
        assert_eq!(
            resolve_in(&store, &opportunity(Some("abc-1"))).await.unwrap(),
            Resolution::New
        );
        assert_eq!(
            resolve_in(&store, &opportunity(None)).await.unwrap(),
            Resolution::Unkeyed
        );
    }

    #[tokio::test]
    async fn organizations_fall_back_to_cage() {
        let store = MemoryStore::new();
        let by_cage = seed(&store, org("Acme", None, Some("1ABC2"))).await;
        seed(&store, org("Other", Some("OTHERUEI0001"), Some("9XYZ9"))).await;

        match resolve_in(&store, &org("Acme", Some("ACMEUEI00001"), Some("1ABC2")))
            .await
            .unwrap()
        {
            Resolution::Existing(found) => assert_eq!(found.id, by_cage.id),
            other => panic!("expected CAGE match, got {other:?}"),
        }

        // Same CAGE, different UEI: a distinct organization.
        assert_eq!(
            resolve_in(&store, &org("Clone", Some("CLONEUEI0001"), Some("9XYZ9")))
                .await
                .unwrap(),
            Resolution::New
        );
        assert_eq!(
            resolve_in(&store, &org("Nobody", None, None)).await.unwrap(),
            Resolution::Unkeyed
        );
    }

    #[tokio::test]
    async fn duplicate_keys_are_an_integrity_violation() {
        let store = MemoryStore::new();
        for _ in 0..2 {
            store
                .insert_unchecked(LocalEntity::from_source(opportunity(Some("DUP-1")), Utc::now()))
                .await;
        }
        let err = resolve_in(&store, &opportunity(Some("DUP-1"))).await.unwrap_err();
        assert!(matches!(err, ResolveError::Integrity { count: 2, .. }));
    }
}
