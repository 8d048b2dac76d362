use crate::{
    config::EvaluationLimits,
    error::{RebacError, Result},
    models::*,
    schema::{Rewrite, Schema},
    store::TupleStore,
};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Permission checker resolving `Check(subject, relation, object)` by
/// walking the schema's rewrite rules against the tuple store:
/// - Direct tuples
/// - Computed relations on the same object
/// - Hops to related objects (`parent`)
/// - Userset subjects (`group:eng#member`)
///
/// Union terms and fan-out targets run concurrently and the first `true`
/// wins. One call shares a depth cap and a dispatch budget across all of
/// its branches; hitting either makes that branch false.
pub struct PermissionChecker {
    store: Arc<dyn TupleStore>,
    schema: Arc<Schema>,
    limits: EvaluationLimits,
}

struct Budget {
    limits: EvaluationLimits,
    dispatches: AtomicU32,
    truncated: AtomicBool,
}

/// Position of one branch in the traversal
#[derive(Clone)]
struct Traversal {
    depth: u32,
    path: Vec<(RelationName, EntityRef)>,
    budget: Arc<Budget>,
}

impl Traversal {
    fn root(limits: EvaluationLimits) -> Self {
        Self {
            depth: 0,
            path: Vec::new(),
            budget: Arc::new(Budget {
                limits,
                dispatches: AtomicU32::new(0),
                truncated: AtomicBool::new(false),
            }),
        }
    }

    /// One computed, hop or userset step further down
    fn descend(&self) -> Result<Traversal> {
        let depth = self.depth + 1;
        let dispatched = self.budget.dispatches.fetch_add(1, Ordering::Relaxed) + 1;

        if depth > self.budget.limits.max_depth || dispatched > self.budget.limits.max_dispatches {
            self.budget.truncated.store(true, Ordering::Relaxed);
            return Err(RebacError::MaxRecursionDepthExceeded);
        }

        Ok(Traversal {
            depth,
            path: self.path.clone(),
            budget: self.budget.clone(),
        })
    }

    fn visits(&self, relation: RelationName, object: &EntityRef) -> bool {
        self.path.iter().any(|(r, o)| *r == relation && o == object)
    }

    fn enter(mut self, relation: RelationName, object: &EntityRef) -> Self {
        self.path.push((relation, object.clone()));
        self
    }

    fn truncated(&self) -> bool {
        self.budget.truncated.load(Ordering::Relaxed)
    }
}

impl PermissionChecker {
    pub fn new(store: Arc<dyn TupleStore>, schema: Arc<Schema>, limits: EvaluationLimits) -> Self {
        Self { store, schema, limits }
    }

    /// Check if subject has the specified relation to object.
    ///
    /// Returns `Err` only when the store is unavailable. Cycles, the depth
    /// cap and malformed data all resolve to `Ok(false)`.
    pub async fn check(&self, subject: &SubjectRef, relation: RelationName, object: &EntityRef) -> Result<bool> {
        let traversal = Traversal::root(self.limits);
        let result = self
            .check_relation(subject, relation, object.clone(), traversal.clone())
            .await;

        match result {
            Ok(true) => Ok(true),
            Ok(false) | Err(RebacError::MaxRecursionDepthExceeded) => {
                if traversal.truncated() {
                    warn!(
                        "Check {} {} {} hit the evaluation limit (max_depth={}, max_dispatches={}); denying",
                        subject, relation, object, self.limits.max_depth, self.limits.max_dispatches
                    );
                }
                Ok(false)
            }
            Err(e) if e.is_unavailable() => Err(e),
            Err(e) => {
                warn!("Check {} {} {} failed: {}; denying", subject, relation, object, e);
                Ok(false)
            }
        }
    }

    fn check_relation<'a>(
        &'a self,
        subject: &'a SubjectRef,
        relation: RelationName,
        object: EntityRef,
        traversal: Traversal,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            if traversal.visits(relation, &object) {
                debug!("Cycle at {}#{}, pruning branch", object, relation);
                return Ok(false);
            }

            let Some(definition) = self.schema.relation(object.entity_type, relation) else {
                warn!("Relation '{}' is not defined on type '{}'", relation, object.entity_type);
                return Ok(false);
            };

            debug!("Checking: {} {} {} (depth {})", subject, relation, object, traversal.depth);

            let traversal = traversal.enter(relation, &object);
            self.evaluate(subject, &definition.rewrite, relation, &object, &traversal)
                .await
        }
        .boxed()
    }

    fn evaluate<'a>(
        &'a self,
        subject: &'a SubjectRef,
        rewrite: &'a Rewrite,
        relation: RelationName,
        object: &'a EntityRef,
        traversal: &'a Traversal,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            match rewrite {
                Rewrite::This => self.check_direct(subject, relation, object, traversal).await,
                Rewrite::Computed { relation: computed } => {
                    let next = traversal.descend()?;
                    self.check_relation(subject, *computed, object.clone(), next).await
                }
                Rewrite::TupleToUserset { tupleset, computed } => {
                    self.check_hop(subject, *tupleset, *computed, object, traversal)
                        .await
                }
                Rewrite::Union { children } => {
                    let branches = children
                        .iter()
                        .map(|child| self.evaluate(subject, child, relation, object, traversal))
                        .collect();
                    any_of(branches).await
                }
            }
        }
        .boxed()
    }

    /// Direct tuples on the object, plus userset subjects expanded by a
    /// nested check
    async fn check_direct(
        &self,
        subject: &SubjectRef,
        relation: RelationName,
        object: &EntityRef,
        traversal: &Traversal,
    ) -> Result<bool> {
        let tuples = self
            .store
            .read(&TupleFilter::new().relation(relation).object(object.clone()))
            .await?;

        let mut usersets = Vec::new();
        for tuple in tuples {
            if !self.schema.allows_subject(object.entity_type, relation, &tuple.subject) {
                warn!("Ignoring tuple with a subject the schema does not allow: {}", tuple);
                continue;
            }
            if tuple.subject == *subject {
                debug!("Direct tuple found: {}", tuple);
                return Ok(true);
            }
            if let Some(userset_relation) = tuple.subject.relation {
                usersets.push((tuple.subject.entity, userset_relation));
            }
        }

        let branches = usersets
            .into_iter()
            .map(|(entity, userset_relation)| {
                async move {
                    let next = traversal.descend()?;
                    self.check_relation(subject, userset_relation, entity, next).await
                }
                .boxed()
            })
            .collect();
        any_of(branches).await
    }

    /// Evaluate `computed` on every object reachable through `tupleset`
    async fn check_hop(
        &self,
        subject: &SubjectRef,
        tupleset: RelationName,
        computed: RelationName,
        object: &EntityRef,
        traversal: &Traversal,
    ) -> Result<bool> {
        let tuples = self
            .store
            .read(&TupleFilter::new().relation(tupleset).object(object.clone()))
            .await?;

        let branches = tuples
            .into_iter()
            .filter(|tuple| {
                let allowed = self.schema.allows_subject(object.entity_type, tupleset, &tuple.subject);
                if !allowed {
                    warn!("Ignoring hop tuple with a subject the schema does not allow: {}", tuple);
                }
                allowed
            })
            .map(|tuple| {
                async move {
                    let next = traversal.descend()?;
                    debug!("Hop {} -> {} via {}", object, tuple.subject.entity, tupleset);
                    self.check_relation(subject, computed, tuple.subject.entity, next).await
                }
                .boxed()
            })
            .collect();
        any_of(branches).await
    }
}

/// OR over concurrently evaluated branches, short-circuiting on the first
/// `true`. A branch stopped by the evaluation limits counts as `false`;
/// any other error is returned if no branch succeeds.
async fn any_of(mut branches: FuturesUnordered<BoxFuture<'_, Result<bool>>>) -> Result<bool> {
    let mut failure = None;

    while let Some(result) = branches.next().await {
        match result {
            Ok(true) => return Ok(true),
            Ok(false) | Err(RebacError::MaxRecursionDepthExceeded) => {}
            Err(e) => failure = Some(e),
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(false),
    }
}
