//! Typed authorization API for the document-sharing application
//!
//! The application calls only this module. It translates domain ids into
//! entity references and delegates to the engine; it holds no state of its
//! own beyond the shared engine handle.

use crate::{
    engine::AuthorizationEngine,
    error::{RebacError, Result},
    models::*,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Level of access granted when sharing a document or folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Viewer,
    Owner,
}

impl Access {
    pub fn relation(&self) -> RelationName {
        match self {
            Access::Viewer => RelationName::Viewer,
            Access::Owner => RelationName::Owner,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relation().as_str())
    }
}

impl FromStr for Access {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "viewer" => Ok(Access::Viewer),
            "owner" => Ok(Access::Owner),
            other => Err(RebacError::InvalidRelation(format!(
                "Unknown access level '{}'. Valid options: viewer, owner",
                other
            ))),
        }
    }
}

#[derive(Clone)]
pub struct DocumentAuthorizer {
    engine: Arc<AuthorizationEngine>,
}

impl DocumentAuthorizer {
    pub fn new(engine: Arc<AuthorizationEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &AuthorizationEngine {
        &self.engine
    }

    // =============================================================================
    // Identifier Formatting
    // =============================================================================

    pub fn format_user_id(user_id: &str) -> EntityRef {
        EntityRef::user(user_id)
    }

    pub fn format_doc_id(doc_id: &str) -> EntityRef {
        EntityRef::doc(doc_id)
    }

    pub fn format_folder_id(folder_id: &str) -> EntityRef {
        EntityRef::folder(folder_id)
    }

    pub fn format_group_id(group_id: &str) -> EntityRef {
        EntityRef::group(group_id)
    }

    /// "Every member of the group", usable as a tuple subject
    pub fn format_group_member(group_id: &str) -> SubjectRef {
        SubjectRef::group_members(group_id)
    }

    fn user(user_id: &str) -> SubjectRef {
        SubjectRef::entity(Self::format_user_id(user_id))
    }

    // =============================================================================
    // Permission Checks
    // =============================================================================

    pub async fn can_read(&self, user_id: &str, doc_id: &str) -> Result<bool> {
        self.check_doc(user_id, RelationName::CanRead, doc_id).await
    }

    pub async fn can_write(&self, user_id: &str, doc_id: &str) -> Result<bool> {
        self.check_doc(user_id, RelationName::CanWrite, doc_id).await
    }

    pub async fn can_share(&self, user_id: &str, doc_id: &str) -> Result<bool> {
        self.check_doc(user_id, RelationName::CanShare, doc_id).await
    }

    pub async fn can_change_owner(&self, user_id: &str, doc_id: &str) -> Result<bool> {
        self.check_doc(user_id, RelationName::CanChangeOwner, doc_id).await
    }

    /// Whether the user may create documents or sub-folders in the folder
    pub async fn can_create_file(&self, user_id: &str, folder_id: &str) -> Result<bool> {
        self.check_folder(user_id, RelationName::CanCreateFile, folder_id).await
    }

    pub async fn can_view_folder(&self, user_id: &str, folder_id: &str) -> Result<bool> {
        self.check_folder(user_id, RelationName::Viewer, folder_id).await
    }

    /// Direct or inherited ownership of the folder
    pub async fn is_folder_owner(&self, user_id: &str, folder_id: &str) -> Result<bool> {
        self.check_folder(user_id, RelationName::Owner, folder_id).await
    }

    async fn check_doc(&self, user_id: &str, relation: RelationName, doc_id: &str) -> Result<bool> {
        self.engine
            .check(&Self::user(user_id), relation, &Self::format_doc_id(doc_id))
            .await
    }

    async fn check_folder(&self, user_id: &str, relation: RelationName, folder_id: &str) -> Result<bool> {
        self.engine
            .check(&Self::user(user_id), relation, &Self::format_folder_id(folder_id))
            .await
    }

    // =============================================================================
    // Listing
    // =============================================================================

    /// Ids of every document the user can read
    pub async fn documents_readable_by(&self, user_id: &str) -> Result<Vec<String>> {
        self.list_ids(user_id, RelationName::CanRead, EntityType::Doc).await
    }

    /// Ids of every folder the user can view
    pub async fn folders_viewable_by(&self, user_id: &str) -> Result<Vec<String>> {
        self.list_ids(user_id, RelationName::Viewer, EntityType::Folder).await
    }

    async fn list_ids(&self, user_id: &str, relation: RelationName, object_type: EntityType) -> Result<Vec<String>> {
        let objects = self
            .engine
            .list_objects(&Self::user(user_id), relation, object_type)
            .await?;
        Ok(objects.into_iter().map(|o| o.id).collect())
    }

    // =============================================================================
    // Groups
    // =============================================================================

    pub async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> Result<()> {
        self.engine
            .grant(Tuple::new(
                Self::user(user_id),
                RelationName::Member,
                Self::format_group_id(group_id),
            ))
            .await
    }

    pub async fn remove_user_from_group(&self, user_id: &str, group_id: &str) -> Result<()> {
        self.engine
            .revoke(Tuple::new(
                Self::user(user_id),
                RelationName::Member,
                Self::format_group_id(group_id),
            ))
            .await
    }

    /// Give every member of the group `access` on the folder
    pub async fn assign_group_to_folder(&self, group_id: &str, folder_id: &str, access: Access) -> Result<()> {
        info!("Assigning group {} to folder {} as {}", group_id, folder_id, access);
        self.engine
            .grant(Tuple::new(
                Self::format_group_member(group_id),
                access.relation(),
                Self::format_folder_id(folder_id),
            ))
            .await
    }

    pub async fn remove_group_from_folder(&self, group_id: &str, folder_id: &str, access: Access) -> Result<()> {
        self.engine
            .revoke(Tuple::new(
                Self::format_group_member(group_id),
                access.relation(),
                Self::format_folder_id(folder_id),
            ))
            .await
    }

    /// Ids of the users listed directly as members. Nested groups are not
    /// expanded.
    pub async fn get_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let tuples = self
            .engine
            .read_tuples(
                &TupleFilter::new()
                    .relation(RelationName::Member)
                    .object(Self::format_group_id(group_id)),
            )
            .await?;

        Ok(tuples
            .into_iter()
            .filter(|t| !t.subject.is_userset() && t.subject.entity.entity_type == EntityType::User)
            .map(|t| t.subject.entity.id)
            .collect())
    }

    // =============================================================================
    // Document and Folder Lifecycle
    // =============================================================================

    /// Record a new document: its owner and, if any, its folder, in one batch.
    /// Callers check `can_create_file` on the folder first.
    pub async fn create_document(&self, owner_id: &str, doc_id: &str, parent_folder_id: Option<&str>) -> Result<()> {
        self.create_object(owner_id, Self::format_doc_id(doc_id), parent_folder_id)
            .await
    }

    pub async fn create_folder(&self, owner_id: &str, folder_id: &str, parent_folder_id: Option<&str>) -> Result<()> {
        self.create_object(owner_id, Self::format_folder_id(folder_id), parent_folder_id)
            .await
    }

    async fn create_object(&self, owner_id: &str, object: EntityRef, parent_folder_id: Option<&str>) -> Result<()> {
        let mut change_set = ChangeSet::new().write(Tuple::new(
            Self::user(owner_id),
            RelationName::Owner,
            object.clone(),
        ));
        if let Some(parent) = parent_folder_id {
            change_set = change_set.write(Tuple::parent(&Self::format_folder_id(parent), &object));
        }

        info!("Creating {} owned by {}", object, owner_id);
        self.engine.apply(change_set).await
    }

    /// Re-parent a document; `None` moves it to the top level. Access
    /// inherited from the old folder disappears in the same batch.
    pub async fn move_document(&self, doc_id: &str, new_parent_folder_id: Option<&str>) -> Result<()> {
        self.reparent(Self::format_doc_id(doc_id), new_parent_folder_id).await
    }

    pub async fn move_folder(&self, folder_id: &str, new_parent_folder_id: Option<&str>) -> Result<()> {
        self.reparent(Self::format_folder_id(folder_id), new_parent_folder_id)
            .await
    }

    async fn reparent(&self, object: EntityRef, new_parent_folder_id: Option<&str>) -> Result<()> {
        let current = self
            .engine
            .read_tuples(
                &TupleFilter::new()
                    .relation(RelationName::Parent)
                    .object(object.clone()),
            )
            .await?;

        let new_parent = new_parent_folder_id.map(|id| Tuple::parent(&Self::format_folder_id(id), &object));

        let mut change_set = ChangeSet::new();
        for tuple in current {
            if Some(&tuple) != new_parent.as_ref() {
                change_set = change_set.delete(tuple);
            }
        }
        if let Some(tuple) = new_parent {
            change_set = change_set.write(tuple);
        }

        info!("Moving {} to {:?}", object, new_parent_folder_id);
        self.engine.apply(change_set).await
    }

    pub async fn share_document(&self, doc_id: &str, user_id: &str, access: Access) -> Result<()> {
        self.engine
            .grant(Tuple::new(
                Self::user(user_id),
                access.relation(),
                Self::format_doc_id(doc_id),
            ))
            .await
    }

    /// Fails with `Conflict` when it would remove the last owner
    pub async fn unshare_document(&self, doc_id: &str, user_id: &str, access: Access) -> Result<()> {
        self.engine
            .revoke(Tuple::new(
                Self::user(user_id),
                access.relation(),
                Self::format_doc_id(doc_id),
            ))
            .await
    }

    pub async fn share_folder(&self, folder_id: &str, user_id: &str, access: Access) -> Result<()> {
        self.engine
            .grant(Tuple::new(
                Self::user(user_id),
                access.relation(),
                Self::format_folder_id(folder_id),
            ))
            .await
    }

    pub async fn unshare_folder(&self, folder_id: &str, user_id: &str, access: Access) -> Result<()> {
        self.engine
            .revoke(Tuple::new(
                Self::user(user_id),
                access.relation(),
                Self::format_folder_id(folder_id),
            ))
            .await
    }

    /// Swap the owner in one batch, so the document is never ownerless
    pub async fn transfer_document_ownership(&self, doc_id: &str, from_user_id: &str, to_user_id: &str) -> Result<()> {
        if from_user_id == to_user_id {
            return Ok(());
        }

        let doc = Self::format_doc_id(doc_id);
        let current = Tuple::new(Self::user(from_user_id), RelationName::Owner, doc.clone());
        if !self.engine.store().exists(&current).await? {
            return Err(RebacError::Conflict(format!(
                "{} is not a direct owner of {}",
                from_user_id, doc
            )));
        }

        info!("Transferring ownership of {} from {} to {}", doc, from_user_id, to_user_id);
        self.engine
            .apply(
                ChangeSet::new()
                    .delete(current)
                    .write(Tuple::new(Self::user(to_user_id), RelationName::Owner, doc)),
            )
            .await
    }

    /// Remove every tuple referencing the document. Returns the deleted tuples.
    pub async fn delete_document(&self, doc_id: &str) -> Result<Vec<Tuple>> {
        self.engine
            .cascade_delete_object(&Self::format_doc_id(doc_id))
            .await
    }

    /// Remove every tuple referencing the folder, including the `parent`
    /// links of its children, which become top-level objects.
    pub async fn delete_folder(&self, folder_id: &str) -> Result<Vec<Tuple>> {
        self.engine
            .cascade_delete_object(&Self::format_folder_id(folder_id))
            .await
    }

    /// Remove the group's members and every grant held by the group. Fails
    /// with `Conflict` if the group is the last owner of a folder; hand the
    /// folder to someone else first.
    pub async fn delete_group(&self, group_id: &str) -> Result<Vec<Tuple>> {
        self.engine
            .cascade_delete_object(&Self::format_group_id(group_id))
            .await
    }

    /// Tuples stored on an object, for inspection
    pub async fn object_tuples(&self, object: &EntityRef) -> Result<Vec<Tuple>> {
        self.engine
            .read_tuples(&TupleFilter::new().object(object.clone()))
            .await
    }
}
