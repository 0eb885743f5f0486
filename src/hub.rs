// =============================================================================
// Subscription hub: (symbol, period) -> connected subscribers
// =============================================================================
//
// Connections register an outbound channel sender; broadcast happens by
// pushing serialized frames into those channels, so the hub never touches a
// socket. `iter_*` hands out cloned snapshots, which keeps a broadcast safe
// against subscribers disconnecting mid-iteration.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::types::Period;

pub type ConnId = Uuid;

/// Outbound half of a connection: serialized JSON frames, drained by the
/// connection's socket task.
pub type OutboundSender = UnboundedSender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    /// Accepting the subscription would push the distinct-symbol count past
    /// the configured cap.
    SymbolLimit(usize),
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeError::SymbolLimit(limit) => {
                write!(f, "active symbol limit reached ({limit})")
            }
        }
    }
}

impl std::error::Error for SubscribeError {}

pub struct SubscriptionHub {
    max_active_symbols: usize,
    subs: RwLock<HashMap<(String, Period), HashMap<ConnId, OutboundSender>>>,
}

impl SubscriptionHub {
    pub fn new(max_active_symbols: usize) -> Self {
        Self {
            max_active_symbols,
            subs: RwLock::new(HashMap::new()),
        }
    }

    /// Register `conn` for (symbol, period). Subscribing twice is a no-op
    /// beyond refreshing the stored sender.
    pub fn subscribe(
        &self,
        conn: ConnId,
        sender: &OutboundSender,
        symbol: &str,
        period: Period,
    ) -> Result<(), SubscribeError> {
        let mut subs = self.subs.write();
        let is_new_symbol = !subs.keys().any(|(s, _)| s.as_str() == symbol);
        if is_new_symbol {
            let active = subs
                .keys()
                .map(|(s, _)| s.as_str())
                .collect::<BTreeSet<_>>()
                .len();
            if active >= self.max_active_symbols {
                return Err(SubscribeError::SymbolLimit(self.max_active_symbols));
            }
        }
        subs.entry((symbol.to_string(), period))
            .or_default()
            .insert(conn, sender.clone());
        Ok(())
    }

    /// Drop one subscription. The key disappears with its last subscriber.
    pub fn unsubscribe(&self, conn: ConnId, symbol: &str, period: Period) {
        let mut subs = self.subs.write();
        let key = (symbol.to_string(), period);
        if let Some(group) = subs.get_mut(&key) {
            group.remove(&conn);
            if group.is_empty() {
                subs.remove(&key);
            }
        }
    }

    /// Drop every subscription held by `conn` (disconnect path).
    pub fn remove(&self, conn: ConnId) {
        let mut subs = self.subs.write();
        subs.retain(|_, group| {
            group.remove(&conn);
            !group.is_empty()
        });
    }

    /// Sorted snapshot of all symbols with at least one subscriber. The
    /// stable order keeps downstream provider batch calls deterministic.
    pub fn get_active_symbols(&self) -> Vec<String> {
        self.subs
            .read()
            .keys()
            .map(|(symbol, _)| symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Cloned subscriber list for one (symbol, period).
    pub fn iter_subscribers(&self, symbol: &str, period: Period) -> Vec<(ConnId, OutboundSender)> {
        self.subs
            .read()
            .get(&(symbol.to_string(), period))
            .map(|group| group.iter().map(|(id, tx)| (*id, tx.clone())).collect())
            .unwrap_or_default()
    }

    /// Cloned list of every distinct connection across all subscriptions.
    pub fn iter_all(&self) -> Vec<(ConnId, OutboundSender)> {
        let subs = self.subs.read();
        let mut seen: HashMap<ConnId, OutboundSender> = HashMap::new();
        for group in subs.values() {
            for (id, tx) in group {
                seen.entry(*id).or_insert_with(|| tx.clone());
            }
        }
        seen.into_iter().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
