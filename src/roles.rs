//! Node role bookkeeping
//!
//! The single-active-server rule is only checked when a server starts. Two
//! servers starting at the same moment can both pass the check; deployments
//! must not rely on it as a lock.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::model::{NodeRole, Role};
use crate::storage::{StorageError, Store};

#[derive(Debug)]
pub enum RoleError {
    Storage(StorageError),

    /// More than one machine claims to be the active server
    MultipleActiveServers { count: usize },
}

impl fmt::Display for RoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleError::Storage(e) => write!(f, "role storage failure: {}", e),
            RoleError::MultipleActiveServers { count } => {
                write!(f, "{} active servers registered, at most one is allowed", count)
            }
        }
    }
}

impl std::error::Error for RoleError {}

impl From<StorageError> for RoleError {
    fn from(err: StorageError) -> Self {
        RoleError::Storage(err)
    }
}

pub struct NodeRoleRegistry {
    store: Arc<dyn Store>,
    node_id: String,
}

impl NodeRoleRegistry {
    pub fn new(store: Arc<dyn Store>, node_id: impl Into<String>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn assume(&self, role: Role, group_id: Option<i64>) -> Result<NodeRole, RoleError> {
        let node_role = NodeRole {
            node_id: self.node_id.clone(),
            role,
            active: true,
            group_id,
        };
        self.store.upsert_node_role(&node_role).await?;
        info!(node = %self.node_id, "assumed role {role}");
        Ok(node_role)
    }

    pub async fn current(&self) -> Result<Option<NodeRole>, RoleError> {
        Ok(self.store.node_role(&self.node_id).await?)
    }

    /// Mark this node inactive, keeping its role and group
    pub async fn release(&self) -> Result<(), RoleError> {
        if let Some(mut role) = self.current().await? {
            role.active = false;
            self.store.upsert_node_role(&role).await?;
            info!(node = %self.node_id, "released role {}", role.role);
        }
        Ok(())
    }

    pub async fn ensure_single_active_server(&self) -> Result<(), RoleError> {
        match self.store.count_active_servers().await? {
            count if count > 1 => Err(RoleError::MultipleActiveServers { count }),
            _ => Ok(()),
        }
    }

    /// Register as the active server, backing out if another one is active
    pub async fn claim_server(&self) -> Result<NodeRole, RoleError> {
        let role = self.assume(Role::Server, None).await?;

        if let Err(e) = self.ensure_single_active_server().await {
            warn!(node = %self.node_id, "refusing server role: {e}");
            self.release().await?;
            return Err(e);
        }
        Ok(role)
    }
}
