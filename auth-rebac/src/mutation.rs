use crate::{
    cache::CheckCache,
    error::{RebacError, Result},
    models::*,
    schema::Schema,
    store::TupleStore,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Validated writes against the tuple store.
///
/// Only stored relations defined by the schema may be written, with subject
/// types the schema allows. An object has at most one `parent`, and `parent`
/// tuples may never close a cycle. Removing the last direct owner of a
/// document or folder is rejected atomically by the store. Every successful
/// mutation clears the check cache.
pub struct TupleWriter {
    store: Arc<dyn TupleStore>,
    schema: Arc<Schema>,
    cache: Option<Arc<CheckCache>>,
}

impl TupleWriter {
    pub fn new(store: Arc<dyn TupleStore>, schema: Arc<Schema>, cache: Option<Arc<CheckCache>>) -> Self {
        Self { store, schema, cache }
    }

    /// Write one tuple. Writing an existing tuple is a no-op.
    pub async fn grant(&self, tuple: Tuple) -> Result<()> {
        self.validate(&tuple)?;
        if tuple.relation == RelationName::Parent {
            self.ensure_single_parent(&[&tuple], &[]).await?;
            self.ensure_acyclic(&[&tuple], &[]).await?;
        }

        info!("Writing tuple: {}", tuple);
        self.store.write(vec![tuple]).await?;
        self.invalidate();
        Ok(())
    }

    /// Delete one tuple. Deleting a missing tuple is a no-op.
    pub async fn revoke(&self, tuple: Tuple) -> Result<()> {
        self.validate_relation(&tuple)?;

        if !self.store.exists(&tuple).await? {
            debug!("Tuple already absent: {}", tuple);
            return Ok(());
        }

        info!("Deleting tuple: {}", tuple);
        let change_set = with_owner_guards(ChangeSet::new().delete(tuple), None);
        self.store.apply(change_set).await?;
        self.invalidate();
        Ok(())
    }

    /// Apply a batch atomically after validating every write
    pub async fn apply(&self, change_set: ChangeSet) -> Result<()> {
        for tuple in &change_set.writes {
            self.validate(tuple)?;
        }
        for tuple in &change_set.deletes {
            self.validate_relation(tuple)?;
        }

        let parent_writes: Vec<&Tuple> = change_set
            .writes
            .iter()
            .filter(|t| t.relation == RelationName::Parent)
            .collect();
        if !parent_writes.is_empty() {
            self.ensure_single_parent(&parent_writes, &change_set.deletes).await?;
            self.ensure_acyclic(&parent_writes, &change_set.deletes).await?;
        }

        info!(
            "Applying batch: {} writes, {} deletes",
            change_set.writes.len(),
            change_set.deletes.len()
        );
        self.store.apply(with_owner_guards(change_set, None)).await?;
        self.invalidate();
        Ok(())
    }

    /// Delete every tuple naming `object`, as object or as subject (plain or
    /// userset), in one batch. Returns the deleted tuples.
    ///
    /// The object's own owners go with it, but ownership it holds elsewhere
    /// is guarded: deleting the last owner of another document or folder
    /// fails with `Conflict` and nothing is deleted.
    pub async fn cascade_delete_object(&self, object: &EntityRef) -> Result<Vec<Tuple>> {
        let as_object = self.store.read(&TupleFilter::new().object(object.clone())).await?;
        let as_subject = self
            .store
            .read(&TupleFilter::new().subject_entity(object.clone()))
            .await?;

        let doomed: Vec<Tuple> = as_object
            .into_iter()
            .chain(as_subject)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if doomed.is_empty() {
            debug!("No tuples reference {}", object);
            return Ok(doomed);
        }

        info!("Cascade delete of {}: {} tuples", object, doomed.len());
        let change_set = ChangeSet {
            deletes: doomed.clone(),
            ..ChangeSet::default()
        };
        self.store
            .apply(with_owner_guards(change_set, Some(object)))
            .await?;
        self.invalidate();
        Ok(doomed)
    }

    /// Reject tuples the schema does not allow to be stored
    pub fn validate(&self, tuple: &Tuple) -> Result<()> {
        self.validate_relation(tuple)?;

        for entity in [&tuple.subject.entity, &tuple.object] {
            if entity.id.contains(USERSET_SEPARATOR) {
                return Err(RebacError::InvalidEntity(format!(
                    "Id of '{}' may not contain '{}'",
                    entity, USERSET_SEPARATOR
                )));
            }
        }

        if !self
            .schema
            .allows_subject(tuple.object.entity_type, tuple.relation, &tuple.subject)
        {
            return Err(RebacError::InvalidTuple(format!(
                "'{}' may not hold '{}' on '{}'",
                tuple.subject, tuple.relation, tuple.object.entity_type
            )));
        }

        Ok(())
    }

    fn validate_relation(&self, tuple: &Tuple) -> Result<()> {
        let entity_type = tuple.object.entity_type;
        if tuple.relation.is_permission() {
            return Err(RebacError::InvalidRelation(format!(
                "'{}' is a computed permission and cannot be written",
                tuple.relation
            )));
        }
        if !self.schema.is_directly_writable(entity_type, tuple.relation) {
            return Err(RebacError::InvalidRelation(format!(
                "'{}' is not a stored relation of '{}'",
                tuple.relation, entity_type
            )));
        }
        Ok(())
    }

    /// Reject a second parent: every child gets at most one `parent` write per
    /// batch, and any parent it already has must be deleted by the same batch
    async fn ensure_single_parent(&self, writes: &[&Tuple], deletes: &[Tuple]) -> Result<()> {
        let mut claimed: HashMap<&EntityRef, &Tuple> = HashMap::new();
        for write in writes.iter().copied() {
            if let Some(other) = claimed.insert(&write.object, write) {
                if other != write {
                    return Err(RebacError::Conflict(format!(
                        "{} cannot be placed under both {} and {}",
                        write.object, other.subject, write.subject
                    )));
                }
            }
        }

        for (child, write) in claimed {
            let stored = self
                .store
                .read(
                    &TupleFilter::new()
                        .relation(RelationName::Parent)
                        .object(child.clone()),
                )
                .await?;

            if let Some(existing) = stored.iter().find(|t| *t != write && !deletes.contains(*t)) {
                return Err(RebacError::Conflict(format!(
                    "{} is already inside {}; move it instead of adding a second parent",
                    child, existing.subject
                )));
            }
        }

        Ok(())
    }

    /// Walk up from each new parent; reaching the child means the write
    /// would make an object its own ancestor
    async fn ensure_acyclic(&self, writes: &[&Tuple], deletes: &[Tuple]) -> Result<()> {
        let removed: HashSet<(EntityRef, EntityRef)> = deletes
            .iter()
            .filter(|t| t.relation == RelationName::Parent)
            .map(|t| (t.subject.entity.clone(), t.object.clone()))
            .collect();

        for write in writes {
            let child = &write.object;
            let mut visited = HashSet::new();
            let mut frontier = vec![write.subject.entity.clone()];

            while let Some(ancestor) = frontier.pop() {
                if ancestor == *child {
                    return Err(RebacError::ParentCycle(format!(
                        "{} cannot be placed under {}: it would become its own ancestor",
                        child, write.subject.entity
                    )));
                }
                if !visited.insert(ancestor.clone()) {
                    continue;
                }

                let stored = self
                    .store
                    .read(
                        &TupleFilter::new()
                            .relation(RelationName::Parent)
                            .object(ancestor.clone()),
                    )
                    .await?;
                let pending = writes.iter().copied().filter(|t| t.object == ancestor);

                for tuple in stored.iter().chain(pending) {
                    let edge = (tuple.subject.entity.clone(), tuple.object.clone());
                    if !removed.contains(&edge) {
                        frontier.push(tuple.subject.entity.clone());
                    }
                }
            }
        }

        Ok(())
    }

    fn invalidate(&self) {
        if let Some(ref cache) = self.cache {
            cache.clear();
        }
    }
}

/// Deleting a direct owner of a document or folder requires another direct
/// owner to remain once the batch is applied. `exempt` is an object being
/// deleted outright.
fn with_owner_guards(mut change_set: ChangeSet, exempt: Option<&EntityRef>) -> ChangeSet {
    let orphaned: BTreeSet<EntityRef> = change_set
        .deletes
        .iter()
        .filter(|t| t.relation == RelationName::Owner)
        .filter(|t| matches!(t.object.entity_type, EntityType::Doc | EntityType::Folder))
        .filter(|t| Some(&t.object) != exempt)
        .map(|t| t.object.clone())
        .collect();

    for object in orphaned {
        let reason = format!("{} must keep at least one owner", object);
        change_set = change_set.require_any(
            TupleFilter::new().relation(RelationName::Owner).object(object),
            reason,
        );
    }
    change_set
}
