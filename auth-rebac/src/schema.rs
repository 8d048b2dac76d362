use crate::{
    error::{RebacError, Result},
    models::*,
};
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A `(object type, relation)` node of the relation graph
pub type RelationNode = (EntityType, RelationName);

/// Rewrite expression defining how a relation is satisfied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rewrite {
    /// Tuples stored directly under this relation
    This,
    /// Another relation on the same object
    Computed { relation: RelationName },
    /// Follow every `(X, tupleset, object)` tuple and evaluate `computed` on `X`
    TupleToUserset {
        tupleset: RelationName,
        computed: RelationName,
    },
    Union { children: Vec<Rewrite> },
}

impl Rewrite {
    pub fn computed(relation: RelationName) -> Self {
        Rewrite::Computed { relation }
    }

    pub fn from_parent(computed: RelationName) -> Self {
        Rewrite::TupleToUserset {
            tupleset: RelationName::Parent,
            computed,
        }
    }

    pub fn union(children: Vec<Rewrite>) -> Self {
        Rewrite::Union { children }
    }

    pub fn has_direct_term(&self) -> bool {
        match self {
            Rewrite::This => true,
            Rewrite::Union { children } => children.iter().any(Rewrite::has_direct_term),
            _ => false,
        }
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Rewrite)) {
        f(self);
        if let Rewrite::Union { children } = self {
            for child in children {
                child.visit(f);
            }
        }
    }
}

/// Subject type allowed on a directly stored relation (`user`, `group#member`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectType {
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationName>,
}

impl SubjectType {
    pub fn entity(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            relation: None,
        }
    }

    pub fn userset(entity_type: EntityType, relation: RelationName) -> Self {
        Self {
            entity_type,
            relation: Some(relation),
        }
    }

    pub fn matches(&self, subject: &SubjectRef) -> bool {
        self.entity_type == subject.entity.entity_type && self.relation == subject.relation
    }
}

/// Definition of a relation within a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: RelationName,
    pub rewrite: Rewrite,
    #[serde(default)]
    pub allowed_subjects: Vec<SubjectType>,
    #[serde(default)]
    pub description: String,
}

/// Definition of an object type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub entity_type: EntityType,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
}

impl TypeDefinition {
    pub fn relation(&self, name: RelationName) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// Serialized form of a schema, as loaded from YAML or JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub types: Vec<TypeDefinition>,
}

/// How a fact `X ∈ node` propagates to dependent relations. Used by the
/// reverse walk in `ListObjects`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReverseEdge {
    /// `X#r` is an allowed subject of a direct relation: tuples
    /// `(X#r, relation, O)` put `O` into `(object_type, relation)`
    Userset {
        object_type: EntityType,
        relation: RelationName,
    },
    /// `relation` on the same object is computed from the source relation
    Computed { relation: RelationName },
    /// Tuples `(X, tupleset, O)` put `O` into `(object_type, relation)`
    Hop {
        tupleset: RelationName,
        object_type: EntityType,
        relation: RelationName,
    },
}

/// Validated, immutable permission schema
#[derive(Debug, Clone)]
pub struct Schema {
    definition: SchemaDefinition,
    types: HashMap<EntityType, TypeDefinition>,
    reverse: HashMap<RelationNode, Vec<ReverseEdge>>,
    dependencies: HashMap<RelationNode, HashSet<RelationNode>>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::document_sharing()
    }
}

impl Schema {
    /// Validate a definition and build the schema
    pub fn from_definition(definition: SchemaDefinition) -> Result<Self> {
        validate(&definition)?;
        Ok(Self::build(definition))
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        let definition: SchemaDefinition = serde_json::from_str(source)
            .map_err(|e| RebacError::SchemaLoad(format!("Invalid JSON schema: {}", e)))?;
        Self::from_definition(definition)
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let definition: SchemaDefinition = serde_yaml::from_str(source)
            .map_err(|e| RebacError::SchemaLoad(format!("Invalid YAML schema: {}", e)))?;
        Self::from_definition(definition)
    }

    /// Load a schema file; `.json` files are parsed as JSON, anything else as YAML
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            RebacError::SchemaLoad(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&source),
            _ => Self::from_yaml_str(&source),
        }
    }

    /// The document-sharing schema: groups with members, folders forming a
    /// hierarchy, documents inside folders.
    pub fn document_sharing() -> Self {
        Self::build(document_sharing_definition())
    }

    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    pub fn type_definition(&self, entity_type: EntityType) -> Option<&TypeDefinition> {
        self.types.get(&entity_type)
    }

    pub fn relation(&self, entity_type: EntityType, relation: RelationName) -> Option<&RelationDefinition> {
        self.types.get(&entity_type)?.relation(relation)
    }

    /// Whether tuples of this relation may be written for this type
    pub fn is_directly_writable(&self, entity_type: EntityType, relation: RelationName) -> bool {
        !relation.is_permission()
            && self
                .relation(entity_type, relation)
                .map(|r| r.rewrite.has_direct_term())
                .unwrap_or(false)
    }

    pub fn allows_subject(&self, entity_type: EntityType, relation: RelationName, subject: &SubjectRef) -> bool {
        self.relation(entity_type, relation)
            .map(|r| r.allowed_subjects.iter().any(|s| s.matches(subject)))
            .unwrap_or(false)
    }

    /// Edges along which a fact about `node` propagates
    pub fn reverse_edges(&self, node: RelationNode) -> &[ReverseEdge] {
        self.reverse.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every node whose facts can contribute to `target` (including itself)
    pub fn dependencies(&self, target: RelationNode) -> Option<&HashSet<RelationNode>> {
        self.dependencies.get(&target)
    }

    fn build(definition: SchemaDefinition) -> Self {
        let types: HashMap<EntityType, TypeDefinition> = definition
            .types
            .iter()
            .map(|t| (t.entity_type, t.clone()))
            .collect();

        let mut reverse: HashMap<RelationNode, Vec<ReverseEdge>> = HashMap::new();
        let mut graph: DiGraphMap<RelationNode, ()> = DiGraphMap::new();

        for type_def in types.values() {
            for relation_def in &type_def.relations {
                let target = (type_def.entity_type, relation_def.name);
                graph.add_node(target);

                for subject in &relation_def.allowed_subjects {
                    if let Some(userset_relation) = subject.relation {
                        let source = (subject.entity_type, userset_relation);
                        reverse.entry(source).or_default().push(ReverseEdge::Userset {
                            object_type: type_def.entity_type,
                            relation: relation_def.name,
                        });
                        graph.add_edge(target, source, ());
                    }
                }

                relation_def.rewrite.visit(&mut |rewrite| match rewrite {
                    Rewrite::Computed { relation } => {
                        let source = (type_def.entity_type, *relation);
                        reverse
                            .entry(source)
                            .or_default()
                            .push(ReverseEdge::Computed { relation: relation_def.name });
                        graph.add_edge(target, source, ());
                    }
                    Rewrite::TupleToUserset { tupleset, computed } => {
                        let hop_types = type_def
                            .relation(*tupleset)
                            .map(|r| r.allowed_subjects.clone())
                            .unwrap_or_default();
                        for hop in hop_types {
                            let source = (hop.entity_type, *computed);
                            reverse.entry(source).or_default().push(ReverseEdge::Hop {
                                tupleset: *tupleset,
                                object_type: type_def.entity_type,
                                relation: relation_def.name,
                            });
                            graph.add_edge(target, source, ());
                        }
                    }
                    Rewrite::This | Rewrite::Union { .. } => {}
                });
            }
        }

        let mut dependencies = HashMap::new();
        for node in graph.nodes() {
            let mut reachable = HashSet::new();
            let mut dfs = Dfs::new(&graph, node);
            while let Some(next) = dfs.next(&graph) {
                reachable.insert(next);
            }
            dependencies.insert(node, reachable);
        }

        Self {
            definition,
            types,
            reverse,
            dependencies,
        }
    }
}

fn validate(definition: &SchemaDefinition) -> Result<()> {
    let mut types: HashMap<EntityType, &TypeDefinition> = HashMap::new();
    for type_def in &definition.types {
        if types.insert(type_def.entity_type, type_def).is_some() {
            return Err(RebacError::SchemaLoad(format!(
                "Type '{}' is defined more than once",
                type_def.entity_type
            )));
        }
    }

    let mut computed_graph: DiGraphMap<RelationNode, ()> = DiGraphMap::new();

    for type_def in &definition.types {
        let mut seen = HashSet::new();
        for relation_def in &type_def.relations {
            let node = (type_def.entity_type, relation_def.name);
            if !seen.insert(relation_def.name) {
                return Err(RebacError::SchemaLoad(format!(
                    "Relation '{}' is defined more than once on '{}'",
                    relation_def.name, type_def.entity_type
                )));
            }
            computed_graph.add_node(node);

            let direct = relation_def.rewrite.has_direct_term();
            if relation_def.name.is_permission() && direct {
                return Err(RebacError::SchemaLoad(format!(
                    "Permission '{}' on '{}' cannot be stored directly",
                    relation_def.name, type_def.entity_type
                )));
            }
            if !relation_def.name.is_permission() && !direct {
                return Err(RebacError::SchemaLoad(format!(
                    "Relation '{}' on '{}' needs a direct term",
                    relation_def.name, type_def.entity_type
                )));
            }
            if direct && relation_def.allowed_subjects.is_empty() {
                return Err(RebacError::SchemaLoad(format!(
                    "Relation '{}' on '{}' allows no subject types",
                    relation_def.name, type_def.entity_type
                )));
            }

            for subject in &relation_def.allowed_subjects {
                let subject_type = types.get(&subject.entity_type).ok_or_else(|| {
                    RebacError::SchemaLoad(format!(
                        "Relation '{}' on '{}' references undefined type '{}'",
                        relation_def.name, type_def.entity_type, subject.entity_type
                    ))
                })?;
                if let Some(userset) = subject.relation {
                    if subject_type.relation(userset).is_none() {
                        return Err(RebacError::SchemaLoad(format!(
                            "Relation '{}' on '{}' references undefined userset '{}#{}'",
                            relation_def.name, type_def.entity_type, subject.entity_type, userset
                        )));
                    }
                }
            }

            let mut error = None;
            relation_def.rewrite.visit(&mut |rewrite| {
                if error.is_some() {
                    return;
                }
                match rewrite {
                    Rewrite::Computed { relation } => {
                        if type_def.relation(*relation).is_none() {
                            error = Some(format!(
                                "'{}#{}' computes from undefined relation '{}'",
                                type_def.entity_type, relation_def.name, relation
                            ));
                        } else {
                            computed_graph.add_edge(node, (type_def.entity_type, *relation), ());
                        }
                    }
                    Rewrite::TupleToUserset { tupleset, computed } => {
                        error = validate_hop(&types, type_def, relation_def.name, *tupleset, *computed).err();
                    }
                    Rewrite::This | Rewrite::Union { .. } => {}
                }
            });
            if let Some(message) = error {
                return Err(RebacError::SchemaLoad(message));
            }
        }
    }

    if is_cyclic_directed(&computed_graph) {
        return Err(RebacError::SchemaLoad(
            "Computed relations reference each other in a cycle".to_string(),
        ));
    }

    Ok(())
}

fn validate_hop(
    types: &HashMap<EntityType, &TypeDefinition>,
    type_def: &TypeDefinition,
    relation: RelationName,
    tupleset: RelationName,
    computed: RelationName,
) -> std::result::Result<(), String> {
    let tupleset_def = type_def.relation(tupleset).ok_or_else(|| {
        format!(
            "'{}#{}' hops through undefined relation '{}'",
            type_def.entity_type, relation, tupleset
        )
    })?;
    if !tupleset_def.rewrite.has_direct_term() {
        return Err(format!(
            "'{}#{}' hops through '{}', which is not stored directly",
            type_def.entity_type, relation, tupleset
        ));
    }
    for hop in &tupleset_def.allowed_subjects {
        if hop.relation.is_some() {
            return Err(format!(
                "'{}#{}' is a hop relation and cannot hold usersets",
                type_def.entity_type, tupleset
            ));
        }
        let target = types
            .get(&hop.entity_type)
            .and_then(|t| t.relation(computed));
        if target.is_none() {
            return Err(format!(
                "'{}#{}' hops to '{}', which has no relation '{}'",
                type_def.entity_type, relation, hop.entity_type, computed
            ));
        }
    }
    Ok(())
}

fn direct(name: RelationName, allowed_subjects: Vec<SubjectType>, description: &str) -> RelationDefinition {
    RelationDefinition {
        name,
        rewrite: Rewrite::This,
        allowed_subjects,
        description: description.to_string(),
    }
}

fn computed(name: RelationName, rewrite: Rewrite, description: &str) -> RelationDefinition {
    RelationDefinition {
        name,
        rewrite,
        allowed_subjects: Vec::new(),
        description: description.to_string(),
    }
}

/// Built-in rule set of the document-sharing application
pub fn document_sharing_definition() -> SchemaDefinition {
    let user = SubjectType::entity(EntityType::User);
    let folder = SubjectType::entity(EntityType::Folder);
    let group_members = SubjectType::userset(EntityType::Group, RelationName::Member);

    SchemaDefinition {
        types: vec![
            TypeDefinition {
                entity_type: EntityType::User,
                relations: Vec::new(),
            },
            TypeDefinition {
                entity_type: EntityType::Group,
                relations: vec![direct(
                    RelationName::Member,
                    vec![user, group_members],
                    "Member of the group",
                )],
            },
            TypeDefinition {
                entity_type: EntityType::Folder,
                relations: vec![
                    RelationDefinition {
                        name: RelationName::Owner,
                        rewrite: Rewrite::union(vec![
                            Rewrite::This,
                            Rewrite::from_parent(RelationName::Owner),
                        ]),
                        allowed_subjects: vec![user, group_members],
                        description: "Owns the folder or one of its ancestors".to_string(),
                    },
                    direct(RelationName::Parent, vec![folder], "Containing folder"),
                    RelationDefinition {
                        name: RelationName::Viewer,
                        rewrite: Rewrite::union(vec![
                            Rewrite::This,
                            Rewrite::computed(RelationName::Owner),
                            Rewrite::from_parent(RelationName::Viewer),
                        ]),
                        allowed_subjects: vec![user, group_members],
                        description: "Can view the folder and everything below it".to_string(),
                    },
                    computed(
                        RelationName::CanCreateFile,
                        Rewrite::computed(RelationName::Owner),
                        "Can create documents and folders inside the folder",
                    ),
                ],
            },
            TypeDefinition {
                entity_type: EntityType::Doc,
                relations: vec![
                    direct(RelationName::Owner, vec![user], "Owns the document"),
                    direct(
                        RelationName::Viewer,
                        vec![user, group_members],
                        "Document shared read-only",
                    ),
                    direct(RelationName::Parent, vec![folder], "Containing folder"),
                    computed(
                        RelationName::CanRead,
                        Rewrite::union(vec![
                            Rewrite::computed(RelationName::Owner),
                            Rewrite::computed(RelationName::Viewer),
                            Rewrite::from_parent(RelationName::Viewer),
                        ]),
                        "Read the document",
                    ),
                    computed(
                        RelationName::CanWrite,
                        Rewrite::union(vec![
                            Rewrite::computed(RelationName::Owner),
                            Rewrite::from_parent(RelationName::Owner),
                        ]),
                        "Edit the document",
                    ),
                    // Sharing rights do not cascade from folder ownership
                    computed(
                        RelationName::CanShare,
                        Rewrite::computed(RelationName::Owner),
                        "Share or unshare the document",
                    ),
                    computed(
                        RelationName::CanChangeOwner,
                        Rewrite::computed(RelationName::Owner),
                        "Transfer ownership or delete the document",
                    ),
                ],
            },
        ],
    }
}
