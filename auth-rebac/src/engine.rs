use crate::{
    cache::CheckCache,
    check::PermissionChecker,
    config::{AuthzConfig, EvaluationLimits},
    error::Result,
    list::ObjectLister,
    models::*,
    mutation::TupleWriter,
    schema::Schema,
    store::{InMemoryTupleStore, PostgresTupleStore, TupleStore},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Core authorization engine
///
/// Owns nothing global: the store and schema are injected, and any number of
/// engines may run side by side (one per tenant, for instance). The engine is
/// `Send + Sync` and meant to be shared behind an `Arc`.
pub struct AuthorizationEngine {
    /// Storage for relationship tuples
    store: Arc<dyn TupleStore>,

    /// Validated permission schema
    schema: Arc<Schema>,

    /// Check evaluator
    checker: Arc<PermissionChecker>,

    /// Reverse-walk evaluator for ListObjects
    lister: Arc<ObjectLister>,

    /// Validated mutations
    writer: Arc<TupleWriter>,

    /// Short-lived cache of Check answers, `None` when disabled
    cache: Option<Arc<CheckCache>>,

    limits: EvaluationLimits,
}

impl AuthorizationEngine {
    /// Engine over `store` with the built-in schema and default limits
    pub fn new(store: Arc<dyn TupleStore>) -> Self {
        let defaults = AuthzConfig::default();
        Self::assemble(
            store,
            Arc::new(Schema::document_sharing()),
            defaults.limits,
            defaults.check_cache_ttl,
        )
    }

    /// Engine configured from `config`, loading the schema file if one is set
    pub fn from_config(store: Arc<dyn TupleStore>, config: &AuthzConfig) -> Result<Self> {
        config.validate()?;

        let schema = match config.schema_path {
            Some(ref path) => {
                info!("Loading schema from {}", path.display());
                Schema::load(path)?
            }
            None => Schema::document_sharing(),
        };

        Ok(Self::assemble(
            store,
            Arc::new(schema),
            config.limits,
            config.check_cache_ttl,
        ))
    }

    /// Build the store `config` selects (Postgres when `database_url` is set,
    /// in-memory otherwise) and an engine over it
    pub async fn connect(config: &AuthzConfig) -> Result<Self> {
        let store: Arc<dyn TupleStore> = match config.database_url {
            Some(ref url) => {
                let store = PostgresTupleStore::connect(url, config.organization_id, config.store_timeout).await?;
                store.migrate().await?;
                info!("Using Postgres tuple store for organization {}", config.organization_id);
                Arc::new(store)
            }
            None => {
                info!("Using in-memory tuple store");
                Arc::new(InMemoryTupleStore::new())
            }
        };

        Self::from_config(store, config)
    }

    /// Replace the schema
    pub fn with_schema(self, schema: Schema) -> Self {
        let ttl = self.cache_ttl();
        Self::assemble(self.store, Arc::new(schema), self.limits, ttl)
    }

    pub fn with_limits(self, limits: EvaluationLimits) -> Self {
        let ttl = self.cache_ttl();
        Self::assemble(self.store, self.schema, limits, ttl)
    }

    /// Set the check cache TTL; `Duration::ZERO` disables caching
    pub fn with_cache_ttl(self, ttl: Duration) -> Self {
        Self::assemble(self.store, self.schema, self.limits, ttl)
    }

    fn assemble(
        store: Arc<dyn TupleStore>,
        schema: Arc<Schema>,
        limits: EvaluationLimits,
        cache_ttl: Duration,
    ) -> Self {
        let cache = (!cache_ttl.is_zero()).then(|| Arc::new(CheckCache::new(cache_ttl)));

        Self {
            checker: Arc::new(PermissionChecker::new(store.clone(), schema.clone(), limits)),
            lister: Arc::new(ObjectLister::new(store.clone(), schema.clone(), limits)),
            writer: Arc::new(TupleWriter::new(store.clone(), schema.clone(), cache.clone())),
            store,
            schema,
            cache,
            limits,
        }
    }

    fn cache_ttl(&self) -> Duration {
        self.cache.as_ref().map(|c| c.ttl()).unwrap_or(Duration::ZERO)
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Check if a subject has a relation (or permission) on an object.
    ///
    /// `Err` means the store was unreachable; the caller must deny.
    pub async fn check(&self, subject: &SubjectRef, relation: RelationName, object: &EntityRef) -> Result<bool> {
        let generation = match self.cache {
            Some(ref cache) => {
                if let Some(allowed) = cache.get(subject, relation, object) {
                    return Ok(allowed);
                }
                cache.generation()
            }
            None => 0,
        };

        let allowed = self.checker.check(subject, relation, object).await?;
        debug!("Check {} {} {} = {}", subject, relation, object, allowed);

        if let Some(ref cache) = self.cache {
            cache.insert(subject, relation, object, allowed, generation);
        }

        Ok(allowed)
    }

    /// Every object of `object_type` on which `check` would return true
    pub async fn list_objects(
        &self,
        subject: &SubjectRef,
        relation: RelationName,
        object_type: EntityType,
    ) -> Result<Vec<EntityRef>> {
        self.lister.list_objects(subject, relation, object_type).await
    }

    // =============================================================================
    // Tuple Management
    // =============================================================================

    pub async fn grant(&self, tuple: Tuple) -> Result<()> {
        self.writer.grant(tuple).await
    }

    pub async fn revoke(&self, tuple: Tuple) -> Result<()> {
        self.writer.revoke(tuple).await
    }

    /// Validated atomic batch
    pub async fn apply(&self, change_set: ChangeSet) -> Result<()> {
        self.writer.apply(change_set).await
    }

    /// Remove every tuple referencing `object`; returns what was deleted
    pub async fn cascade_delete_object(&self, object: &EntityRef) -> Result<Vec<Tuple>> {
        self.writer.cascade_delete_object(object).await
    }

    /// Read tuples matching a filter
    pub async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<Tuple>> {
        self.store.read(filter).await
    }

    /// Validate a tuple against the schema without writing it
    pub fn validate_tuple(&self, tuple: &Tuple) -> Result<()> {
        self.writer.validate(tuple)
    }

    // =============================================================================
    // Accessors
    // =============================================================================

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    pub fn store(&self) -> Arc<dyn TupleStore> {
        self.store.clone()
    }

    pub fn limits(&self) -> EvaluationLimits {
        self.limits
    }
}
