//! Topic keys.
//!
//! A topic is a named channel of events scoped to one execution, one user,
//! one workspace, or the single global administrative feed. The canonical
//! string form is `kind:scope` (`execution:0190...`, `user:42`,
//! `workspace:acme`) or just `global`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ParseTopicError;
use crate::ids::{ExecutionId, PrincipalId, WorkspaceId};

/// What a topic is scoped to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    /// A single workflow execution.
    Execution,
    /// A single user.
    User,
    /// A workspace.
    Workspace,
    /// The administrative feed that observes every execution.
    Global,
}

impl TopicKind {
    /// The prefix used in the canonical string form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::User => "user",
            Self::Workspace => "workspace",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicKind {
    type Err = ParseTopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execution" => Ok(Self::Execution),
            "user" => Ok(Self::User),
            "workspace" => Ok(Self::Workspace),
            "global" => Ok(Self::Global),
            other => Err(ParseTopicError::UnknownKind(other.to_owned())),
        }
    }
}

/// Composite topic key: kind plus scope identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicId {
    kind: TopicKind,
    scope: Option<String>,
}

impl TopicId {
    /// Build a topic from a kind and an optional scope, validating the pair.
    pub fn new(kind: TopicKind, scope: Option<&str>) -> Result<Self, ParseTopicError> {
        let scope = scope.map(str::trim).filter(|s| !s.is_empty());
        match (kind, scope) {
            (TopicKind::Global, None) => Ok(Self::global()),
            (TopicKind::Global, Some(_)) => Err(ParseTopicError::UnexpectedScope),
            (_, None) => Err(ParseTopicError::MissingScope(kind)),
            (TopicKind::User, Some(s)) => {
                let principal: PrincipalId = s
                    .parse()
                    .map_err(|_| ParseTopicError::InvalidUserScope(s.to_owned()))?;
                Ok(Self::user(principal))
            }
            (kind, Some(s)) => Ok(Self {
                kind,
                scope: Some(s.to_owned()),
            }),
        }
    }

    /// Topic for a single execution.
    pub fn execution(id: &ExecutionId) -> Self {
        Self {
            kind: TopicKind::Execution,
            scope: Some(id.as_str().to_owned()),
        }
    }

    /// Topic for a single user.
    pub fn user(principal: PrincipalId) -> Self {
        Self {
            kind: TopicKind::User,
            scope: Some(principal.to_string()),
        }
    }

    /// Topic for a workspace.
    pub fn workspace(id: &WorkspaceId) -> Self {
        Self {
            kind: TopicKind::Workspace,
            scope: Some(id.as_str().to_owned()),
        }
    }

    /// The global administrative topic.
    pub const fn global() -> Self {
        Self {
            kind: TopicKind::Global,
            scope: None,
        }
    }

    /// Topic kind.
    pub const fn kind(&self) -> TopicKind {
        self.kind
    }

    /// Scope identifier (`None` only for the global topic).
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Whether events on this topic are mirrored to the global feed.
    pub const fn is_execution_scoped(&self) -> bool {
        matches!(self.kind, TopicKind::Execution)
    }

    /// Whether this is the global topic.
    pub const fn is_global(&self) -> bool {
        matches!(self.kind, TopicKind::Global)
    }

    /// Execution ID when this topic is execution-scoped.
    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self.kind {
            TopicKind::Execution => self.scope.as_deref().map(ExecutionId::from),
            _ => None,
        }
    }

    /// Principal when this topic is user-scoped.
    pub fn principal(&self) -> Option<PrincipalId> {
        match self.kind {
            TopicKind::User => self.scope.as_deref().and_then(|s| s.parse().ok()),
            _ => None,
        }
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{scope}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for TopicId {
    type Err = ParseTopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseTopicError::Empty);
        }
        match s.split_once(':') {
            Some((kind, scope)) => Self::new(kind.parse()?, Some(scope)),
            None => Self::new(s.parse()?, None),
        }
    }
}

impl TryFrom<String> for TopicId {
    type Error = ParseTopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TopicId> for String {
    fn from(topic: TopicId) -> Self {
        topic.to_string()
    }
}
