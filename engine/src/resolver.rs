//! Per-exchange job class resolution.
//!
//! A Lifecycle emits steps against a default class name, e.g.
//! `Jobs.Lifecycles.Position.DispatchPositionJob`. The resolver substitutes
//! an exchange-specific override if one is registered for the account's
//! canonical, inserting `Capitalised(x)` immediately before the final path
//! segment: `Jobs.Lifecycles.Position.Bybit.DispatchPositionJob`. Resolution
//! happens once, at emission time; the resolved name is what gets written
//! into `step.class`, so nothing downstream needs to reason about exchanges
//! again (this is the only place exchange-branching is permitted).

use engine_common::ApiCanonical;
use std::collections::HashSet;

/// The set of registered overrides. Populated once at startup from
/// whatever job classes exist; resolution itself is a pure string
/// operation over that set.
#[derive(Debug, Default, Clone)]
pub struct Resolver {
    overrides: HashSet<String>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers that an exchange-specific class exists for `default_class`
    /// under `canonical`. Call once per concrete override at startup.
    pub fn register_override(&mut self, default_class: &str, canonical: ApiCanonical) {
        self.overrides
            .insert(Self::overridden_name(default_class, canonical));
    }

    /// Resolves `default_class` for an account on `canonical`, returning the
    /// override if registered, else the default unchanged. Deterministic for
    /// a given (default_class, canonical) pair.
    pub fn resolve(&self, default_class: &str, canonical: ApiCanonical) -> String {
        let candidate = Self::overridden_name(default_class, canonical);
        if self.overrides.contains(&candidate) {
            candidate
        } else {
            default_class.to_string()
        }
    }

    /// Builds `Jobs.<Category>.<...>.<Capitalised(x)>.<Name>` from
    /// `Jobs.<Category>.<...>.<Name>` by inserting the canonical's
    /// capitalised form immediately before the final segment.
    fn overridden_name(default_class: &str, canonical: ApiCanonical) -> String {
        match default_class.rsplit_once('.') {
            Some((prefix, name)) => format!("{}.{}.{}", prefix, canonical.capitalised(), name),
            None => format!("{}.{}", canonical.capitalised(), default_class),
        }
    }
}
