//! WebSocket subscription group assignment (spec.md §5 "Resource pools").
//!
//! Exchanges impose a per-connection subscription cap (KuCoin ≤100 symbols,
//! Bitget ≤45; see `engine_common::config::websocket_group_capacity`).
//! Assigning a symbol to a connection is a first-non-full-group placement,
//! scoped per `(account_id, canonical)` the same way `SnapshotStore` scopes
//! its keys.

use dashmap::DashMap;
use engine_common::ApiCanonical;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WsGroupOwner {
    pub account_id: i64,
    pub canonical: ApiCanonical,
}

impl WsGroupOwner {
    pub fn new(account_id: i64, canonical: ApiCanonical) -> Self {
        Self {
            account_id,
            canonical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsGroupAssignment {
    pub group_index: usize,
}

#[derive(Debug, Default)]
struct Groups {
    /// Index `i` holds the symbols assigned to that connection's group.
    members: Vec<Vec<String>>,
}

/// Assigns symbols to WebSocket connection groups, one owner (account +
/// exchange) at a time, placing each new symbol into the first group with
/// spare capacity and opening a new group only once every existing one is
/// full.
#[derive(Default)]
pub struct WsGroupAssigner {
    owners: DashMap<WsGroupOwner, Groups>,
}

impl WsGroupAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `symbol` to a group for `owner`, returning the group index.
    /// Idempotent: re-assigning a symbol already present returns its
    /// existing group unchanged.
    pub fn assign(&self, owner: WsGroupOwner, symbol: &str) -> WsGroupAssignment {
        let capacity = engine_common::config::websocket_group_capacity(owner.canonical);
        let mut groups = self.owners.entry(owner).or_default();

        for (index, members) in groups.members.iter().enumerate() {
            if members.iter().any(|s| s == symbol) {
                return WsGroupAssignment { group_index: index };
            }
        }

        for (index, members) in groups.members.iter_mut().enumerate() {
            if members.len() < capacity {
                members.push(symbol.to_string());
                return WsGroupAssignment { group_index: index };
            }
        }

        groups.members.push(vec![symbol.to_string()]);
        WsGroupAssignment {
            group_index: groups.members.len() - 1,
        }
    }

    pub fn group_count(&self, owner: WsGroupOwner) -> usize {
        self.owners
            .get(&owner)
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    pub fn symbols_in_group(&self, owner: WsGroupOwner, group_index: usize) -> Vec<String> {
        self.owners
            .get(&owner)
            .and_then(|g| g.members.get(group_index).cloned())
            .unwrap_or_default()
    }
}
