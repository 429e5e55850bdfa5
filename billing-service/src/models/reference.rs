//! Tagged references to other billing entities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of entity kinds that can be the target of a polymorphic
/// reference (coupon billables, transaction purchasables, invoice itemables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Plan,
    Subscription,
    Transaction,
    Invoice,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Plan => "plan",
            EntityKind::Subscription => "subscription",
            EntityKind::Transaction => "transaction",
            EntityKind::Invoice => "invoice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(EntityKind::Plan),
            "subscription" => Some(EntityKind::Subscription),
            "transaction" => Some(EntityKind::Transaction),
            "invoice" => Some(EntityKind::Invoice),
            _ => None,
        }
    }
}

/// `{kind, id}` pair persisted as two columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    pub fn plan(id: Uuid) -> Self {
        Self::new(EntityKind::Plan, id)
    }

    pub fn subscription(id: Uuid) -> Self {
        Self::new(EntityKind::Subscription, id)
    }

    pub fn transaction(id: Uuid) -> Self {
        Self::new(EntityKind::Transaction, id)
    }

    /// Rebuild from the stored column pair. Unknown kinds yield `None`.
    pub fn from_columns(kind: Option<&str>, id: Option<Uuid>) -> Option<Self> {
        match (kind.and_then(EntityKind::parse), id) {
            (Some(kind), Some(id)) => Some(Self { kind, id }),
            _ => None,
        }
    }

    /// Split into the stored column pair.
    pub fn to_columns(reference: Option<&EntityRef>) -> (Option<&'static str>, Option<Uuid>) {
        match reference {
            Some(r) => (Some(r.kind.as_str()), Some(r.id)),
            None => (None, None),
        }
    }
}
