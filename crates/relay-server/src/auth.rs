//! Handshake authentication and topic entitlement.
//!
//! Both concerns belong to collaborators outside the relay; this module only
//! defines the seams ([`Authenticator`], [`EntitlementChecker`]) and ships the
//! implementations the daemon and the tests use.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use relay_core::{ExecutionId, PrincipalId, TopicId, TopicKind, WorkspaceId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::AuthError;

/// Identity claims returned by an [`Authenticator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated principal.
    pub principal_id: PrincipalId,
    /// Whether the principal may observe every topic.
    pub is_admin: bool,
}

impl Identity {
    /// A regular user.
    pub const fn user(principal_id: PrincipalId) -> Self {
        Self {
            principal_id,
            is_admin: false,
        }
    }

    /// An administrator.
    pub const fn admin(principal_id: PrincipalId) -> Self {
        Self {
            principal_id,
            is_admin: true,
        }
    }
}

/// Validates a bearer credential presented at connect time.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a credential into identity claims.
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Decides whether a principal may join a topic.
#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    /// `true` if `identity` may observe `topic`.
    async fn is_entitled(&self, identity: &Identity, topic: &TopicId) -> bool;
}

// ── JWT ─────────────────────────────────────────────────────────────────────

/// Claims carried by relay bearer tokens.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
    #[serde(default)]
    is_admin: bool,
}

/// HS256 bearer-token authenticator.
///
/// `sub` must hold the integer principal id; `exp` is always required.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Create an authenticator for a shared secret.
    pub fn new(secret: &[u8], leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            encoding_key: EncodingKey::from_secret(secret),
            validation,
        }
    }

    /// Sign a token for `identity` that expires `ttl_secs` from now.
    pub fn issue(&self, identity: Identity, ttl_secs: i64) -> Result<String, AuthError> {
        let exp = unix_now().saturating_add_signed(ttl_secs);
        let claims = Claims {
            sub: identity.principal_id.to_string(),
            exp,
            is_admin: identity.is_admin,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        let data = jsonwebtoken::decode::<Claims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidCredential(e.to_string()),
            })?;
        let principal_id: PrincipalId = data
            .claims
            .sub
            .parse()
            .map_err(|_| AuthError::InvalidCredential("subject is not a principal id".into()))?;
        Ok(Identity {
            principal_id,
            is_admin: data.claims.is_admin,
        })
    }
}

fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

// ── Static table ────────────────────────────────────────────────────────────

/// Fixed token → identity table.
#[derive(Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, Identity>,
}

impl StaticAuthenticator {
    /// Empty table; every credential is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        let _ = self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.tokens
            .get(credential)
            .copied()
            .ok_or_else(|| AuthError::InvalidCredential("unknown token".into()))
    }
}

// ── Ownership entitlements ──────────────────────────────────────────────────

/// Entitlements derived from execution ownership and workspace membership.
///
/// Admins may join anything. The global topic is admin-only, a user topic is
/// open only to that user, and execution and workspace topics require a
/// registration made by the surrounding application.
#[derive(Default)]
pub struct OwnershipEntitlements {
    execution_owners: DashMap<ExecutionId, PrincipalId>,
    workspace_members: DashMap<WorkspaceId, HashSet<PrincipalId>>,
}

impl OwnershipEntitlements {
    /// Empty registration tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the owner of an execution.
    pub fn register_execution(&self, execution: ExecutionId, owner: PrincipalId) {
        let _ = self.execution_owners.insert(execution, owner);
    }

    /// Forget an execution.
    pub fn forget_execution(&self, execution: &ExecutionId) {
        let _ = self.execution_owners.remove(execution);
    }

    /// Add a member to a workspace.
    pub fn add_workspace_member(&self, workspace: WorkspaceId, member: PrincipalId) {
        let _ = self.workspace_members.entry(workspace).or_default().insert(member);
    }

    /// Remove a member from a workspace.
    pub fn remove_workspace_member(&self, workspace: &WorkspaceId, member: PrincipalId) {
        if let Some(mut members) = self.workspace_members.get_mut(workspace) {
            let _ = members.remove(&member);
        }
    }
}

#[async_trait]
impl EntitlementChecker for OwnershipEntitlements {
    async fn is_entitled(&self, identity: &Identity, topic: &TopicId) -> bool {
        if identity.is_admin {
            return true;
        }
        let allowed = match topic.kind() {
            TopicKind::Global => false,
            TopicKind::User => topic.principal() == Some(identity.principal_id),
            TopicKind::Execution => topic.execution_id().is_some_and(|id| {
                self.execution_owners
                    .get(&id)
                    .is_some_and(|owner| *owner == identity.principal_id)
            }),
            TopicKind::Workspace => topic.scope().is_some_and(|scope| {
                self.workspace_members
                    .get(&WorkspaceId::from(scope))
                    .is_some_and(|members| members.contains(&identity.principal_id))
            }),
        };
        if !allowed {
            debug!(principal = %identity.principal_id, %topic, "entitlement denied");
        }
        allowed
    }
}

/// Grants every principal every topic.
pub struct AllowAll;

#[async_trait]
impl EntitlementChecker for AllowAll {
    async fn is_entitled(&self, _identity: &Identity, _topic: &TopicId) -> bool {
        true
    }
}
