use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Closed enum over the domain entities a step can point at. Lookup from a
/// `Relatable` to the underlying row is a dispatch table owned by the
/// external domain crate, not a reflective map: this crate only carries the
/// tagged pointer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RelatableKind {
    Position,
    Account,
    ExchangeSymbol,
    Order,
    ApiSystem,
    Symbol,
}

/// A polymorphic pointer to a domain entity, used only for logging and to
/// give the exception handler context to attach to. The engine never
/// dereferences this; it is opaque outside of the `(kind, id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relatable {
    pub kind: RelatableKind,
    pub id: i64,
}

impl Relatable {
    pub fn new(kind: RelatableKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl std::fmt::Display for Relatable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}
