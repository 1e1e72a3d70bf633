//! Promotions, their identity, and their lifecycle phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Identified;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Identity of a promotion: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PromotionKey {
    pub namespace: String,
    pub name: String,
}

impl PromotionKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PromotionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for PromotionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::InvalidArgument(format!(
                "expected <namespace>/<name>, got '{s}'"
            ))),
        }
    }
}

/// Scheduling key: `(namespace, stage)`. At most one promotion per key runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageKey {
    pub namespace: String,
    pub stage: String,
}

impl StageKey {
    pub fn new(namespace: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            stage: stage.into(),
        }
    }
}

impl std::fmt::Display for StageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.stage)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for admission.
    Pending,
    /// Admitted; the executor is working on it.
    Running,
    /// Done successfully. Terminal.
    Succeeded,
    /// Executor failed or the promotion was aborted. Terminal.
    Failed,
}

impl Phase {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Failed)     // aborted before admission
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }

    /// Is this a terminal phase?
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "pending",
            Phase::Running => "running",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Phase::Pending),
            "running" => Ok(Phase::Running),
            "succeeded" => Ok(Phase::Succeeded),
            "failed" => Ok(Phase::Failed),
            other => Err(Error::InvalidArgument(format!("unknown phase: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Promotion
// ---------------------------------------------------------------------------

/// A request to move a stage to a new piece of freight.
///
/// Owned by the store. The scheduler only ever holds clones of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub uid: Uuid,
    pub namespace: String,
    pub name: String,
    /// Stage this promotion targets. Together with the namespace, the
    /// scheduling key.
    pub stage: String,
    /// Freight reference being promoted. Opaque to the scheduler.
    pub freight: String,
    pub phase: Phase,
    /// Outcome message, set when the promotion fails. Absent from change
    /// notifications.
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Promotion {
    /// A fresh `Pending` promotion created at `created_at`, with no freight.
    pub fn pending(
        namespace: impl Into<String>,
        stage: impl Into<String>,
        name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uid: Uuid::new_v4(),
            namespace: namespace.into(),
            name: name.into(),
            stage: stage.into(),
            freight: String::new(),
            phase: Phase::Pending,
            message: None,
            created_at,
            updated_at: created_at,
            finished_at: None,
        }
    }

    pub fn key(&self) -> PromotionKey {
        PromotionKey::new(&self.namespace, &self.name)
    }

    /// The scheduling key, or `None` if it cannot be derived.
    pub fn stage_key(&self) -> Option<StageKey> {
        if self.namespace.is_empty() || self.stage.is_empty() {
            return None;
        }
        Some(StageKey::new(&self.namespace, &self.stage))
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

impl Identified for Promotion {
    type Id = PromotionKey;

    fn identity(&self) -> PromotionKey {
        self.key()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new promotions. Stores turn it into a `Pending` [`Promotion`].
#[derive(Debug, Clone)]
pub struct NewPromotion {
    pub(crate) namespace: String,
    pub(crate) stage: String,
    pub(crate) freight: String,
    pub(crate) name: Option<String>,
}

impl NewPromotion {
    pub fn new(
        namespace: impl Into<String>,
        stage: impl Into<String>,
        freight: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            stage: stage.into(),
            freight: freight.into(),
            name: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Build the stored form. Unnamed promotions are called
    /// `<stage>.<first 8 chars of uid>`.
    pub fn into_promotion(self, now: DateTime<Utc>) -> Result<Promotion> {
        if self.namespace.is_empty() || self.stage.is_empty() {
            return Err(Error::InvalidArgument(
                "promotion needs a namespace and a stage".to_string(),
            ));
        }
        let uid = Uuid::new_v4();
        let name = self
            .name
            .unwrap_or_else(|| format!("{}.{}", self.stage, &uid.simple().to_string()[..8]));
        Ok(Promotion {
            uid,
            freight: self.freight,
            ..Promotion::pending(self.namespace, self.stage, name, now)
        })
    }
}
