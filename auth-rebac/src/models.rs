use crate::error::RebacError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Object types known to the authorization graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    Group,
    Folder,
    Doc,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::User,
        EntityType::Group,
        EntityType::Folder,
        EntityType::Doc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Group => "group",
            EntityType::Folder => "folder",
            EntityType::Doc => "doc",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(EntityType::User),
            "group" => Ok(EntityType::Group),
            "folder" => Ok(EntityType::Folder),
            "doc" => Ok(EntityType::Doc),
            other => Err(RebacError::InvalidEntity(format!(
                "Unknown object type '{}'. Valid options: user, group, folder, doc",
                other
            ))),
        }
    }
}

/// Relation names. The `can_*` variants are permissions: they are computed
/// from the schema's rewrite rules and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationName {
    Owner,
    Viewer,
    Member,
    Parent,
    CanRead,
    CanWrite,
    CanShare,
    CanChangeOwner,
    CanCreateFile,
}

impl RelationName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationName::Owner => "owner",
            RelationName::Viewer => "viewer",
            RelationName::Member => "member",
            RelationName::Parent => "parent",
            RelationName::CanRead => "can_read",
            RelationName::CanWrite => "can_write",
            RelationName::CanShare => "can_share",
            RelationName::CanChangeOwner => "can_change_owner",
            RelationName::CanCreateFile => "can_create_file",
        }
    }

    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            RelationName::CanRead
                | RelationName::CanWrite
                | RelationName::CanShare
                | RelationName::CanChangeOwner
                | RelationName::CanCreateFile
        )
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationName {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(RelationName::Owner),
            "viewer" => Ok(RelationName::Viewer),
            "member" => Ok(RelationName::Member),
            "parent" => Ok(RelationName::Parent),
            "can_read" => Ok(RelationName::CanRead),
            "can_write" => Ok(RelationName::CanWrite),
            "can_share" => Ok(RelationName::CanShare),
            "can_change_owner" => Ok(RelationName::CanChangeOwner),
            "can_create_file" => Ok(RelationName::CanCreateFile),
            other => Err(RebacError::InvalidRelation(format!("Unknown relation '{}'", other))),
        }
    }
}

/// Separates a userset's entity from its relation (`group:eng#member`).
/// Entity ids may not contain it.
pub const USERSET_SEPARATOR: char = '#';

/// A typed object reference, written `type:id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new(EntityType::User, user_id)
    }

    pub fn group(group_id: &str) -> Self {
        Self::new(EntityType::Group, group_id)
    }

    pub fn folder(folder_id: &str) -> Self {
        Self::new(EntityType::Folder, folder_id)
    }

    pub fn doc(doc_id: &str) -> Self {
        Self::new(EntityType::Doc, doc_id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Ids are opaque and may contain ':' themselves (e.g. "user:auth0|abc")
        let (entity_type, id) = s
            .split_once(':')
            .ok_or_else(|| RebacError::InvalidEntity(format!("Expected '<type>:<id>', got '{}'", s)))?;
        if id.is_empty() {
            return Err(RebacError::InvalidEntity(format!("Empty id in '{}'", s)));
        }
        if id.contains(USERSET_SEPARATOR) {
            return Err(RebacError::InvalidEntity(format!(
                "Id in '{}' may not contain '{}'",
                s, USERSET_SEPARATOR
            )));
        }
        Ok(Self::new(entity_type.parse()?, id))
    }
}

impl TryFrom<String> for EntityRef {
    type Error = RebacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityRef> for String {
    fn from(value: EntityRef) -> Self {
        value.to_string()
    }
}

/// The subject side of a tuple: either a plain entity or a userset
/// (`group:eng#member`, "anyone who is a member of group eng").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectRef {
    pub entity: EntityRef,
    pub relation: Option<RelationName>,
}

impl SubjectRef {
    pub fn entity(entity: EntityRef) -> Self {
        Self {
            entity,
            relation: None,
        }
    }

    pub fn userset(entity: EntityRef, relation: RelationName) -> Self {
        Self {
            entity,
            relation: Some(relation),
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::entity(EntityRef::user(user_id))
    }

    pub fn folder(folder_id: &str) -> Self {
        Self::entity(EntityRef::folder(folder_id))
    }

    pub fn group_members(group_id: &str) -> Self {
        Self::userset(EntityRef::group(group_id), RelationName::Member)
    }

    pub fn is_userset(&self) -> bool {
        self.relation.is_some()
    }
}

impl From<EntityRef> for SubjectRef {
    fn from(entity: EntityRef) -> Self {
        Self::entity(entity)
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(relation) => write!(f, "{}#{}", self.entity, relation),
            None => write!(f, "{}", self.entity),
        }
    }
}

impl FromStr for SubjectRef {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(USERSET_SEPARATOR) {
            Some((entity, relation)) => Ok(Self::userset(entity.parse()?, relation.parse()?)),
            None => Ok(Self::entity(s.parse()?)),
        }
    }
}

impl TryFrom<String> for SubjectRef {
    type Error = RebacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubjectRef> for String {
    fn from(value: SubjectRef) -> Self {
        value.to_string()
    }
}

/// A relationship tuple: subject has relation to object.
///
/// Serializes to the wire format
/// `{"user": "group:eng#member", "relation": "viewer", "object": "folder:456"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tuple {
    #[serde(rename = "user")]
    pub subject: SubjectRef,
    pub relation: RelationName,
    pub object: EntityRef,
}

impl Tuple {
    pub fn new(subject: impl Into<SubjectRef>, relation: RelationName, object: EntityRef) -> Self {
        Self {
            subject: subject.into(),
            relation,
            object,
        }
    }

    /// Structural edge: `parent` is the container of `child`
    pub fn parent(parent: &EntityRef, child: &EntityRef) -> Self {
        Self::new(parent.clone(), RelationName::Parent, child.clone())
    }

    /// Whether the tuple mentions `entity` as object or as subject entity
    pub fn touches(&self, entity: &EntityRef) -> bool {
        &self.object == entity || &self.subject.entity == entity
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.relation, self.object)
    }
}

/// Partial tuple used for reads. `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleFilter {
    /// Exact subject, including the userset relation if any
    pub subject: Option<SubjectRef>,
    /// Subject entity, ignoring the userset relation
    pub subject_entity: Option<EntityRef>,
    pub relation: Option<RelationName>,
    pub object: Option<EntityRef>,
    pub object_type: Option<EntityType>,
}

impl TupleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: SubjectRef) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn subject_entity(mut self, entity: EntityRef) -> Self {
        self.subject_entity = Some(entity);
        self
    }

    pub fn relation(mut self, relation: RelationName) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn object(mut self, object: EntityRef) -> Self {
        self.object = Some(object);
        self
    }

    pub fn object_type(mut self, object_type: EntityType) -> Self {
        self.object_type = Some(object_type);
        self
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        if let Some(ref s) = self.subject {
            if tuple.subject != *s {
                return false;
            }
        }

        if let Some(ref e) = self.subject_entity {
            if tuple.subject.entity != *e {
                return false;
            }
        }

        if let Some(r) = self.relation {
            if tuple.relation != r {
                return false;
            }
        }

        if let Some(ref o) = self.object {
            if tuple.object != *o {
                return false;
            }
        }

        if let Some(t) = self.object_type {
            if tuple.object.entity_type != t {
                return false;
            }
        }

        true
    }
}

/// Postcondition attached to a [`ChangeSet`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guard {
    /// At least one tuple must match the filter once the batch is applied
    RequireAny { filter: TupleFilter, reason: String },
}

/// Atomic batch of writes and deletes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub writes: Vec<Tuple>,
    pub deletes: Vec<Tuple>,
    pub guards: Vec<Guard>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, tuple: Tuple) -> Self {
        self.writes.push(tuple);
        self
    }

    pub fn delete(mut self, tuple: Tuple) -> Self {
        self.deletes.push(tuple);
        self
    }

    pub fn require_any(mut self, filter: TupleFilter, reason: impl Into<String>) -> Self {
        self.guards.push(Guard::RequireAny {
            filter,
            reason: reason.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}
