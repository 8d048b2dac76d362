use crate::{
    config::EvaluationLimits,
    error::Result,
    models::*,
    schema::{RelationNode, ReverseEdge, Schema},
    store::TupleStore,
};
use ahash::AHashSet;
use futures::future::try_join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// A derived fact: `object` satisfies `node`, first reached at `depth`
#[derive(Debug, Clone)]
struct Fact {
    node: RelationNode,
    object: EntityRef,
    depth: u32,
}

/// Answers `ListObjects(subject, relation, object_type)` by walking the
/// relation graph backwards from the subject instead of checking every
/// object.
///
/// One read collects every tuple naming the subject. From there facts
/// propagate breadth-first along the schema's reverse edges: userset grants
/// (`group:eng#member`), computed relations on the same object, and hops
/// walking down `parent` edges. Only nodes the target depends on are
/// expanded. Each level is one edge deeper, so a fact is first seen at its
/// minimal derivation depth, and facts past `max_depth` are dropped the same
/// way `Check` would deny them.
pub struct ObjectLister {
    store: Arc<dyn TupleStore>,
    schema: Arc<Schema>,
    limits: EvaluationLimits,
}

impl ObjectLister {
    pub fn new(store: Arc<dyn TupleStore>, schema: Arc<Schema>, limits: EvaluationLimits) -> Self {
        Self { store, schema, limits }
    }

    /// List every object of `object_type` on which the subject has `relation`.
    /// The result is deduplicated and sorted.
    pub async fn list_objects(
        &self,
        subject: &SubjectRef,
        relation: RelationName,
        object_type: EntityType,
    ) -> Result<Vec<EntityRef>> {
        let target = (object_type, relation);
        let Some(relevant) = self.schema.dependencies(target) else {
            warn!("Relation '{}' is not defined on type '{}'", relation, object_type);
            return Ok(Vec::new());
        };

        let mut seen: AHashSet<(RelationNode, EntityRef)> = AHashSet::new();
        let mut results = BTreeSet::new();
        let mut frontier = Vec::new();

        for tuple in self.store.read(&TupleFilter::new().subject(subject.clone())).await? {
            let node = (tuple.object.entity_type, tuple.relation);
            if !relevant.contains(&node) {
                continue;
            }
            if !self.schema.is_directly_writable(node.0, node.1)
                || !self.schema.allows_subject(node.0, node.1, &tuple.subject)
            {
                warn!("Ignoring tuple the schema does not allow: {}", tuple);
                continue;
            }
            if seen.insert((node, tuple.object.clone())) {
                frontier.push(Fact {
                    node,
                    object: tuple.object,
                    depth: 0,
                });
            }
        }

        let mut truncated = false;
        while !frontier.is_empty() {
            debug!("ListObjects frontier: {} facts", frontier.len());

            for fact in &frontier {
                if fact.node == target {
                    results.insert(fact.object.clone());
                }
            }

            let mut expansions = Vec::new();
            for fact in &frontier {
                if fact.depth >= self.limits.max_depth {
                    if !self.schema.reverse_edges(fact.node).is_empty() {
                        truncated = true;
                    }
                    continue;
                }
                for edge in self.schema.reverse_edges(fact.node) {
                    expansions.push(self.expand(fact, *edge, relevant));
                }
            }

            let mut next = Vec::new();
            for fact in try_join_all(expansions).await?.into_iter().flatten() {
                if seen.insert((fact.node, fact.object.clone())) {
                    next.push(fact);
                }
            }
            frontier = next;
        }

        if truncated {
            warn!(
                "ListObjects {} {} {} stopped at max_depth={}; deeper objects omitted",
                subject, relation, object_type, self.limits.max_depth
            );
        }

        Ok(results.into_iter().collect())
    }

    /// Facts one edge away from `fact`
    async fn expand(
        &self,
        fact: &Fact,
        edge: ReverseEdge,
        relevant: &HashSet<RelationNode>,
    ) -> Result<Vec<Fact>> {
        let depth = fact.depth + 1;

        let (node, filter) = match edge {
            ReverseEdge::Computed { relation } => {
                let node = (fact.node.0, relation);
                if !relevant.contains(&node) {
                    return Ok(Vec::new());
                }
                return Ok(vec![Fact {
                    node,
                    object: fact.object.clone(),
                    depth,
                }]);
            }
            ReverseEdge::Userset { object_type, relation } => (
                (object_type, relation),
                TupleFilter::new()
                    .subject(SubjectRef::userset(fact.object.clone(), fact.node.1))
                    .relation(relation)
                    .object_type(object_type),
            ),
            ReverseEdge::Hop {
                tupleset,
                object_type,
                relation,
            } => (
                (object_type, relation),
                TupleFilter::new()
                    .subject(SubjectRef::entity(fact.object.clone()))
                    .relation(tupleset)
                    .object_type(object_type),
            ),
        };

        if !relevant.contains(&node) {
            return Ok(Vec::new());
        }

        let tuples = self.store.read(&filter).await?;
        Ok(tuples
            .into_iter()
            .filter(|tuple| {
                let allowed = self
                    .schema
                    .allows_subject(tuple.object.entity_type, tuple.relation, &tuple.subject);
                if !allowed {
                    warn!("Ignoring tuple the schema does not allow: {}", tuple);
                }
                allowed
            })
            .map(|tuple| Fact {
                node,
                object: tuple.object,
                depth,
            })
            .collect())
    }
}
