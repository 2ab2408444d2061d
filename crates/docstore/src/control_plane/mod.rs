//! Control-plane directory of identity providers and roles.
//!
//! Entries live in their own collection, one partition per entry kind, keyed
//! by name. An entry carrying an ETag is written with a conditional replace;
//! one without is created or overwritten.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{ClientError, CollectionLink, Document, DocumentClient, DocumentQuery};
use crate::error::{ControlPlaneError, StorageError, StorageResult};
use crate::layout::{DocumentKind, IDENTITY_PROVIDER_PARTITION, ROLE_PARTITION};

/// A trusted token issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityProvider {
    pub name: String,
    pub authority: String,
    pub audience: Vec<String>,
    /// ETag of the stored entry; set on read, checked on write.
    #[serde(skip)]
    pub etag: Option<String>,
}

impl IdentityProvider {
    pub fn new(
        name: impl Into<String>,
        authority: impl Into<String>,
        audience: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            authority: authority.into(),
            audience,
            etag: None,
        }
    }

    fn validate(&self) -> StorageResult<()> {
        validate_name(&self.name)?;
        if self.authority.trim().is_empty() {
            return Err(invalid("identity provider authority must not be empty"));
        }
        if self.audience.is_empty() || self.audience.iter().any(|a| a.trim().is_empty()) {
            return Err(invalid("identity provider audience must list at least one value"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceAction {
    Read,
    Write,
    HardDelete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePermission {
    pub actions: Vec<ResourceAction>,
}

/// A named set of permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    pub resource_permissions: Vec<ResourcePermission>,
    #[serde(skip)]
    pub etag: Option<String>,
}

impl Role {
    pub fn new(name: impl Into<String>, resource_permissions: Vec<ResourcePermission>) -> Self {
        Self {
            name: name.into(),
            resource_permissions,
            etag: None,
        }
    }

    /// Returns `true` if any permission grants `action`.
    pub fn allows(&self, action: ResourceAction) -> bool {
        self.resource_permissions
            .iter()
            .any(|p| p.actions.contains(&action))
    }

    fn validate(&self) -> StorageResult<()> {
        validate_name(&self.name)?;
        if self.resource_permissions.iter().any(|p| p.actions.is_empty()) {
            return Err(invalid("role permissions must grant at least one action"));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> StorageResult<()> {
    if name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.contains(['/', '\\', '?', '#']) {
        return Err(invalid(&format!("name '{name}' contains a reserved character")));
    }
    Ok(())
}

fn invalid(message: &str) -> StorageError {
    ControlPlaneError::Invalid {
        message: message.to_string(),
    }
    .into()
}

/// Directory of identity providers and roles.
#[async_trait]
pub trait RbacService: Send + Sync {
    async fn get_identity_provider(&self, name: &str) -> StorageResult<IdentityProvider>;

    async fn upsert_identity_provider(
        &self,
        provider: IdentityProvider,
    ) -> StorageResult<IdentityProvider>;

    async fn get_role(&self, name: &str) -> StorageResult<Role>;

    async fn upsert_role(&self, role: Role) -> StorageResult<Role>;

    async fn get_all_roles(&self) -> StorageResult<Vec<Role>>;

    async fn delete_role(&self, name: &str) -> StorageResult<()>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryDocument<T> {
    id: String,
    partition_key: String,
    kind: DocumentKind,
    #[serde(default)]
    write_id: String,
    #[serde(flatten)]
    entry: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteStamp {
    #[serde(default)]
    write_id: String,
}

/// [`RbacService`] over the control-plane collection.
pub struct DocumentRbacService {
    client: Arc<dyn DocumentClient>,
    collection: CollectionLink,
}

impl DocumentRbacService {
    pub fn new(client: Arc<dyn DocumentClient>, collection: CollectionLink) -> Self {
        Self { client, collection }
    }

    async fn read_entry<T: DeserializeOwned>(
        &self,
        partition: &str,
        name: &str,
    ) -> StorageResult<Option<(T, String)>> {
        match self
            .client
            .read_document(&self.collection, partition, name)
            .await?
        {
            Some(stored) => {
                let document: EntryDocument<T> = stored.deserialize()?;
                Ok(Some((document.entry, stored.etag)))
            }
            None => Ok(None),
        }
    }

    /// Writes an entry; returns the new ETag, or `None` if a conditional
    /// replace found nothing to replace.
    async fn write_entry<T: Serialize>(
        &self,
        partition: &str,
        kind: DocumentKind,
        name: &str,
        entry: &T,
        etag: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let write_id = Uuid::new_v4().to_string();
        let document = Document::from_serializable(
            name,
            partition,
            &EntryDocument {
                id: name.to_string(),
                partition_key: partition.to_string(),
                kind,
                write_id: write_id.clone(),
                entry,
            },
        )?;

        let written = match etag {
            Some(etag) => {
                self.client
                    .replace_document(&self.collection, document, Some(etag))
                    .await
            }
            None => self.client.upsert_document(&self.collection, document, None).await,
        };

        match written {
            Ok(stored) => Ok(Some(stored.etag)),
            Err(ClientError::PreconditionFailed) => {
                // A retried replace conflicts with its own applied first attempt.
                let current = self
                    .client
                    .read_document(&self.collection, partition, name)
                    .await?;
                if let Some(current) = current {
                    if current.deserialize::<WriteStamp>()?.write_id == write_id {
                        debug!(entry = name, "Replayed control-plane write was already applied");
                        return Ok(Some(current.etag));
                    }
                }
                Err(ControlPlaneError::Conflict {
                    name: name.to_string(),
                }
                .into())
            }
            Err(ClientError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RbacService for DocumentRbacService {
    async fn get_identity_provider(&self, name: &str) -> StorageResult<IdentityProvider> {
        let (mut provider, etag): (IdentityProvider, String) = self
            .read_entry(IDENTITY_PROVIDER_PARTITION, name)
            .await?
            .ok_or_else(|| ControlPlaneError::IdentityProviderNotFound {
                name: name.to_string(),
            })?;
        provider.etag = Some(etag);
        Ok(provider)
    }

    async fn upsert_identity_provider(
        &self,
        mut provider: IdentityProvider,
    ) -> StorageResult<IdentityProvider> {
        provider.validate()?;
        let etag = self
            .write_entry(
                IDENTITY_PROVIDER_PARTITION,
                DocumentKind::IdentityProvider,
                &provider.name,
                &provider,
                provider.etag.as_deref(),
            )
            .await?
            .ok_or_else(|| ControlPlaneError::IdentityProviderNotFound {
                name: provider.name.clone(),
            })?;
        info!(identity_provider = %provider.name, "Identity provider saved");
        provider.etag = Some(etag);
        Ok(provider)
    }

    async fn get_role(&self, name: &str) -> StorageResult<Role> {
        let (mut role, etag): (Role, String) = self
            .read_entry(ROLE_PARTITION, name)
            .await?
            .ok_or_else(|| ControlPlaneError::RoleNotFound {
                name: name.to_string(),
            })?;
        role.etag = Some(etag);
        Ok(role)
    }

    async fn upsert_role(&self, mut role: Role) -> StorageResult<Role> {
        role.validate()?;
        let etag = self
            .write_entry(
                ROLE_PARTITION,
                DocumentKind::Role,
                &role.name,
                &role,
                role.etag.as_deref(),
            )
            .await?
            .ok_or_else(|| ControlPlaneError::RoleNotFound {
                name: role.name.clone(),
            })?;
        info!(role = %role.name, "Role saved");
        role.etag = Some(etag);
        Ok(role)
    }

    async fn get_all_roles(&self) -> StorageResult<Vec<Role>> {
        let query = DocumentQuery::new()
            .partition(ROLE_PARTITION)
            .where_eq("kind", DocumentKind::Role.as_str());

        let mut roles = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .query_documents(&self.collection, &query, continuation.as_deref(), 100)
                .await?;
            for stored in page.documents {
                let document: EntryDocument<Role> = stored.deserialize()?;
                let mut role = document.entry;
                role.etag = Some(stored.etag);
                roles.push(role);
            }
            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }
        Ok(roles)
    }

    async fn delete_role(&self, name: &str) -> StorageResult<()> {
        match self
            .client
            .delete_document(&self.collection, ROLE_PARTITION, name, None)
            .await
        {
            Ok(()) => {
                info!(role = name, "Role deleted");
                Ok(())
            }
            Err(ClientError::NotFound) => Err(ControlPlaneError::RoleNotFound {
                name: name.to_string(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }
}
