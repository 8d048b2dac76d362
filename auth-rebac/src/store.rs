//! Tuple storage
//!
//! The [`TupleStore`] trait is the only way the evaluator and the mutation
//! API touch relationship data. Two backends ship with the crate:
//!
//! - [`InMemoryTupleStore`]: indexed, lock-protected, used by tests and
//!   single-process deployments
//! - [`postgres::PostgresTupleStore`]: durable storage scoped to one
//!   organization

pub mod postgres;

use crate::{
    error::{RebacError, Result},
    models::*,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub use postgres::PostgresTupleStore;

/// Storage interface for relationship tuples
#[async_trait]
pub trait TupleStore: Send + Sync {
    /// Write tuples, all or nothing. Existing tuples are left untouched.
    async fn write(&self, tuples: Vec<Tuple>) -> Result<()> {
        self.apply(ChangeSet {
            writes: tuples,
            ..ChangeSet::default()
        })
        .await
    }

    /// Delete tuples. Missing tuples are ignored.
    async fn delete(&self, tuples: Vec<Tuple>) -> Result<()> {
        self.apply(ChangeSet {
            deletes: tuples,
            ..ChangeSet::default()
        })
        .await
    }

    /// Apply writes and deletes atomically, rejecting the whole batch with
    /// `Conflict` if a guard does not hold afterwards
    async fn apply(&self, change_set: ChangeSet) -> Result<()>;

    /// Read tuples matching the filter
    async fn read(&self, filter: &TupleFilter) -> Result<Vec<Tuple>>;

    /// Check if a specific tuple exists
    async fn exists(&self, tuple: &Tuple) -> Result<bool>;
}

/// A batch may not both write and delete the same tuple
pub(crate) fn ensure_consistent(change_set: &ChangeSet) -> Result<()> {
    let deletes: HashSet<&Tuple> = change_set.deletes.iter().collect();
    if let Some(tuple) = change_set.writes.iter().find(|t| deletes.contains(t)) {
        return Err(RebacError::Conflict(format!(
            "Tuple is both written and deleted in one batch: {}",
            tuple
        )));
    }
    Ok(())
}

#[derive(Default)]
struct TupleIndex {
    tuples: BTreeSet<Tuple>,
    by_object: HashMap<EntityRef, BTreeSet<Tuple>>,
    by_subject: HashMap<EntityRef, BTreeSet<Tuple>>,
}

impl TupleIndex {
    fn insert(&mut self, tuple: Tuple) -> bool {
        if !self.tuples.insert(tuple.clone()) {
            return false;
        }
        self.by_object
            .entry(tuple.object.clone())
            .or_default()
            .insert(tuple.clone());
        self.by_subject
            .entry(tuple.subject.entity.clone())
            .or_default()
            .insert(tuple);
        true
    }

    fn remove(&mut self, tuple: &Tuple) -> bool {
        if !self.tuples.remove(tuple) {
            return false;
        }
        if let Some(set) = self.by_object.get_mut(&tuple.object) {
            set.remove(tuple);
            if set.is_empty() {
                self.by_object.remove(&tuple.object);
            }
        }
        if let Some(set) = self.by_subject.get_mut(&tuple.subject.entity) {
            set.remove(tuple);
            if set.is_empty() {
                self.by_subject.remove(&tuple.subject.entity);
            }
        }
        true
    }

    fn select(&self, filter: &TupleFilter) -> Vec<Tuple> {
        let subject_entity = filter
            .subject
            .as_ref()
            .map(|s| &s.entity)
            .or(filter.subject_entity.as_ref());

        let candidates: Box<dyn Iterator<Item = &Tuple> + '_> = if let Some(ref object) = filter.object {
            match self.by_object.get(object) {
                Some(set) => Box::new(set.iter()),
                None => return Vec::new(),
            }
        } else if let Some(entity) = subject_entity {
            match self.by_subject.get(entity) {
                Some(set) => Box::new(set.iter()),
                None => return Vec::new(),
            }
        } else {
            Box::new(self.tuples.iter())
        };

        candidates.filter(|t| filter.matches(t)).cloned().collect()
    }

    fn any(&self, filter: &TupleFilter) -> bool {
        !self.select(filter).is_empty()
    }
}

/// In-memory tuple store. One instance holds one organization's tuples.
///
/// A single lock guards the index, so every batch is linearizable and
/// visible to the next read as soon as `apply` returns.
#[derive(Clone, Default)]
pub struct InMemoryTupleStore {
    index: Arc<RwLock<TupleIndex>>,
}

impl InMemoryTupleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with tuples, e.g. loaded from a wire-format file
    pub fn with_tuples(tuples: impl IntoIterator<Item = Tuple>) -> Self {
        let store = Self::new();
        {
            let mut index = store.index.write();
            for tuple in tuples {
                index.insert(tuple);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.index.read().tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TupleStore for InMemoryTupleStore {
    async fn apply(&self, change_set: ChangeSet) -> Result<()> {
        ensure_consistent(&change_set)?;

        let mut index = self.index.write();
        let mut inserted = Vec::new();
        let mut removed = Vec::new();

        for tuple in &change_set.deletes {
            if index.remove(tuple) {
                removed.push(tuple.clone());
            }
        }
        for tuple in &change_set.writes {
            if index.insert(tuple.clone()) {
                inserted.push(tuple.clone());
            }
        }

        for guard in &change_set.guards {
            let Guard::RequireAny { filter, reason } = guard;
            if !index.any(filter) {
                for tuple in &inserted {
                    index.remove(tuple);
                }
                for tuple in removed {
                    index.insert(tuple);
                }
                return Err(RebacError::Conflict(reason.clone()));
            }
        }

        debug!(
            "Applied batch: {} inserted, {} removed",
            inserted.len(),
            removed.len()
        );
        Ok(())
    }

    async fn read(&self, filter: &TupleFilter) -> Result<Vec<Tuple>> {
        Ok(self.index.read().select(filter))
    }

    async fn exists(&self, tuple: &Tuple) -> Result<bool> {
        Ok(self.index.read().tuples.contains(tuple))
    }
}
