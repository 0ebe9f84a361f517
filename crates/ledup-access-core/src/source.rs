use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::event::{Address, EventKind, RawLog};
use crate::AccessError;

/// Logs buffered per subscription before the oldest are dropped.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 1024;

/// Inclusive block window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct BlockRange {
    pub from_block: u64,
    pub to_block: u64,
}

impl BlockRange {
    /// # Errors
    /// Returns [`AccessError::InvalidBlockRange`] when `from_block > to_block`.
    pub fn new(from_block: u64, to_block: u64) -> Result<Self, AccessError> {
        if from_block > to_block {
            return Err(AccessError::InvalidBlockRange { from_block, to_block });
        }
        Ok(Self { from_block, to_block })
    }

    #[must_use]
    pub fn everything() -> Self {
        Self { from_block: 0, to_block: u64::MAX }
    }

    #[must_use]
    pub fn contains(&self, block_number: u64) -> bool {
        (self.from_block..=self.to_block).contains(&block_number)
    }
}

/// Anything that can hand back contract logs for a block window.
pub trait EventSource {
    type Error;

    /// Fetch logs of one kind emitted by `contract` within `range`.
    ///
    /// # Errors
    /// Returns the source's error when logs cannot be fetched.
    fn fetch_events(
        &self,
        contract: &Address,
        kind: EventKind,
        range: BlockRange,
    ) -> Result<Vec<RawLog>, Self::Error>;
}

#[derive(Debug)]
struct LedgerInner {
    logs: BTreeMap<Address, Vec<RawLog>>,
    capacity: usize,
    next_subscription: u64,
    subscriptions: BTreeMap<u64, SubscriptionSlot>,
}

#[derive(Debug)]
struct SubscriptionSlot {
    contract: Address,
    kinds: Vec<EventKind>,
    pending: VecDeque<RawLog>,
    lagged: u64,
}

/// Process-local ledger used for tests, replays, and offline fixtures.
///
/// Each subscription buffers at most `capacity` undrained logs. On overflow
/// the oldest log is dropped and counted as lag; a lagged consumer should
/// refetch the affected range through [`EventSource::fetch_events`].
#[derive(Debug, Clone)]
pub struct InMemoryLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerInner {
                logs: BTreeMap::new(),
                capacity: capacity.max(1),
                next_subscription: 0,
                subscriptions: BTreeMap::new(),
            })),
        }
    }

    /// # Errors
    /// Returns [`AccessError::Source`] if the ledger lock is poisoned.
    pub fn capacity(&self) -> Result<usize, AccessError> {
        Ok(self.lock()?.capacity)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerInner>, AccessError> {
        self.inner
            .lock()
            .map_err(|_| AccessError::Source("in-memory ledger lock poisoned".to_string()))
    }

    /// Record a log for `contract` and deliver it to matching subscriptions.
    ///
    /// # Errors
    /// Returns [`AccessError::Source`] if the ledger lock is poisoned.
    pub fn append(&self, contract: Address, log: RawLog) -> Result<(), AccessError> {
        let mut inner = self.lock()?;
        let kind = log.kind();
        let capacity = inner.capacity;
        for (id, slot) in &mut inner.subscriptions {
            if slot.contract == contract && kind.is_some_and(|kind| slot.kinds.contains(&kind)) {
                if slot.pending.len() >= capacity {
                    slot.pending.pop_front();
                    slot.lagged += 1;
                    tracing::debug!(subscription = *id, lagged = slot.lagged, "subscriber lagged");
                }
                slot.pending.push_back(log.clone());
            }
        }
        inner.logs.entry(contract).or_default().push(log);
        Ok(())
    }

    /// Open a live subscription. It is released when the handle drops.
    ///
    /// # Errors
    /// Returns [`AccessError::Source`] if the ledger lock is poisoned.
    pub fn subscribe(
        &self,
        contract: Address,
        kinds: &[EventKind],
    ) -> Result<Subscription, AccessError> {
        let mut inner = self.lock()?;
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.subscriptions.insert(
            id,
            SubscriptionSlot {
                contract,
                kinds: kinds.to_vec(),
                pending: VecDeque::new(),
                lagged: 0,
            },
        );
        tracing::debug!(subscription = id, contract = %contract, "opened ledger subscription");
        Ok(Subscription { id, inner: Arc::clone(&self.inner) })
    }

    /// # Errors
    /// Returns [`AccessError::Source`] if the ledger lock is poisoned.
    pub fn active_subscriptions(&self) -> Result<usize, AccessError> {
        Ok(self.lock()?.subscriptions.len())
    }
}

impl EventSource for InMemoryLedger {
    type Error = AccessError;

    fn fetch_events(
        &self,
        contract: &Address,
        kind: EventKind,
        range: BlockRange,
    ) -> Result<Vec<RawLog>, Self::Error> {
        let inner = self.lock()?;
        let mut logs = inner
            .logs
            .get(contract)
            .map(|logs| {
                logs.iter()
                    .filter(|log| log.kind() == Some(kind) && range.contains(log.block_number))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        logs.sort_by_key(RawLog::order_key);
        Ok(logs)
    }
}

/// Live feed handle from [`InMemoryLedger::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Arc<Mutex<LedgerInner>>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take every log delivered since the previous drain.
    ///
    /// # Errors
    /// Returns [`AccessError::Source`] if the ledger lock is poisoned.
    pub fn drain(&self) -> Result<Vec<RawLog>, AccessError> {
        let mut inner = self.lock()?;
        Ok(inner
            .subscriptions
            .get_mut(&self.id)
            .map(|slot| slot.pending.drain(..).collect())
            .unwrap_or_default())
    }

    /// Number of logs dropped on overflow since the previous call.
    ///
    /// # Errors
    /// Returns [`AccessError::Source`] if the ledger lock is poisoned.
    pub fn take_lagged(&self) -> Result<u64, AccessError> {
        let mut inner = self.lock()?;
        Ok(inner
            .subscriptions
            .get_mut(&self.id)
            .map(|slot| std::mem::take(&mut slot.lagged))
            .unwrap_or_default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerInner>, AccessError> {
        self.inner
            .lock()
            .map_err(|_| AccessError::Source("in-memory ledger lock poisoned".to_string()))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Release even if another holder panicked with the lock.
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscriptions.remove(&self.id);
        tracing::debug!(subscription = self.id, "released ledger subscription");
    }
}
