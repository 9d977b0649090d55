use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use stockledger_core::{LedgerError, LedgerResult, ReservationId, StockKey};
use stockledger_ledger::{
    AlertKind, InventoryBalance, MovementDraft, Reference, Reservation, StockAlert, StockMovement,
    desired_alert,
};

use super::{AlertTransitions, FulfillCommit, LedgerStore, MovementCommit, ReservationCommit};
use crate::query::{AlertFilter, BalanceFilter, HistoryRange, Page, Pagination, ReservationFilter};

const DEFAULT_LOCK_RETRIES: u32 = 40;
const DEFAULT_LOCK_BACKOFF: Duration = Duration::from_millis(5);

/// Committed state of one stock key.
///
/// One mutex guards the journal, the balance and the key's reservations, so
/// within a key they always change together.
#[derive(Debug)]
struct KeyCell {
    balance: InventoryBalance,
    journal: Vec<StockMovement>,
    reservations: HashMap<ReservationId, Reservation>,
}

impl KeyCell {
    fn new(key: StockKey) -> Self {
        Self {
            balance: InventoryBalance::empty(key),
            journal: Vec::new(),
            reservations: HashMap::new(),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.journal.last().map(|m| m.sequence).unwrap_or(0) + 1
    }
}

#[derive(Debug, Default)]
struct AlertSection {
    rows: Vec<StockAlert>,
    /// Index into `rows` of the active alert per (key, kind).
    active: HashMap<(StockKey, AlertKind), usize>,
    /// Highest balance version already reconciled per key.
    reconciled: HashMap<StockKey, u64>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev and for embedding without a database. Not
/// optimized for performance.
///
/// Each key's state lives behind its own mutex: writers to the same key
/// serialize, writers to different keys run in parallel. Transfers lock
/// both cells in ascending key order. Acquisition is bounded to
/// `lock_retries` attempts spaced `lock_backoff` apart, after which the
/// operation fails with `Conflict` instead of waiting indefinitely.
#[derive(Debug)]
pub struct MemoryLedgerStore {
    cells: RwLock<HashMap<StockKey, Arc<Mutex<KeyCell>>>>,
    reservation_keys: RwLock<HashMap<ReservationId, StockKey>>,
    alerts: Mutex<AlertSection>,
    lock_retries: u32,
    lock_backoff: Duration,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_budget(DEFAULT_LOCK_RETRIES, DEFAULT_LOCK_BACKOFF)
    }

    /// A store with an explicit per-key lock budget.
    pub fn with_lock_budget(retries: u32, backoff: Duration) -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            reservation_keys: RwLock::new(HashMap::new()),
            alerts: Mutex::new(AlertSection::default()),
            lock_retries: retries,
            lock_backoff: backoff,
        }
    }

    fn cell(&self, key: StockKey) -> LedgerResult<Arc<Mutex<KeyCell>>> {
        {
            let cells = self.cells.read().map_err(|_| poisoned())?;
            if let Some(cell) = cells.get(&key) {
                return Ok(Arc::clone(cell));
            }
        }
        let mut cells = self.cells.write().map_err(|_| poisoned())?;
        Ok(Arc::clone(
            cells
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(KeyCell::new(key)))),
        ))
    }

    fn existing_cell(&self, key: StockKey) -> LedgerResult<Option<Arc<Mutex<KeyCell>>>> {
        let cells = self.cells.read().map_err(|_| poisoned())?;
        Ok(cells.get(&key).cloned())
    }

    /// Acquire a cell within the bounded lock budget.
    fn lock_cell<'a>(
        &self,
        key: StockKey,
        cell: &'a Mutex<KeyCell>,
    ) -> LedgerResult<MutexGuard<'a, KeyCell>> {
        let mut attempts = 0u32;
        loop {
            match cell.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => return Err(poisoned()),
                Err(TryLockError::WouldBlock) => {
                    if attempts >= self.lock_retries {
                        warn!(key = %key, attempts, "per-key lock budget exhausted");
                        return Err(LedgerError::conflict(format!(
                            "stock key {key} is contended, retry the operation"
                        )));
                    }
                    attempts += 1;
                    thread::sleep(self.lock_backoff);
                }
            }
        }
    }

    fn reservation_key(&self, id: ReservationId) -> LedgerResult<StockKey> {
        self.reservation_keys
            .read()
            .map_err(|_| poisoned())?
            .get(&id)
            .copied()
            .ok_or_else(|| LedgerError::not_found(format!("reservation {id}")))
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn append_movements(&self, drafts: Vec<MovementDraft>) -> LedgerResult<MovementCommit> {
        if drafts.is_empty() {
            return Ok(MovementCommit {
                movements: vec![],
                balances: vec![],
            });
        }

        // Cells are locked in ascending key order, which is what keeps
        // opposite-direction transfers deadlock-free.
        let mut keys: Vec<StockKey> = drafts.iter().map(|d| d.key).collect();
        keys.sort();
        keys.dedup();

        let targets: Vec<(StockKey, Arc<Mutex<KeyCell>>)> = keys
            .iter()
            .map(|&key| Ok((key, self.cell(key)?)))
            .collect::<LedgerResult<_>>()?;
        let mut guards: Vec<(StockKey, MutexGuard<'_, KeyCell>)> =
            Vec::with_capacity(targets.len());
        for (key, cell) in &targets {
            guards.push((*key, self.lock_cell(*key, cell)?));
        }

        // Stage the whole batch against copies first, so a failing draft
        // leaves every balance untouched.
        let mut staged: HashMap<StockKey, InventoryBalance> = guards
            .iter()
            .map(|(key, guard)| (*key, guard.balance.clone()))
            .collect();
        for draft in &drafts {
            let balance = staged
                .get_mut(&draft.key)
                .ok_or_else(|| LedgerError::internal("draft key missing from lock set"))?;
            balance.apply_movement(draft)?;
        }

        // Commit under the held guards: journal rows in draft order, then
        // the staged balances.
        let mut movements = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let (_, guard) = guards
                .iter_mut()
                .find(|(key, _)| *key == draft.key)
                .ok_or_else(|| LedgerError::internal("draft key missing from lock set"))?;
            let sequence = guard.next_sequence();
            let movement = StockMovement::commit(draft, sequence);
            guard.journal.push(movement.clone());
            movements.push(movement);
        }

        let mut balances = Vec::with_capacity(guards.len());
        for (key, guard) in guards.iter_mut() {
            let balance = staged
                .remove(key)
                .ok_or_else(|| LedgerError::internal("staged balance missing"))?;
            if balance.available() < 0 {
                warn!(
                    key = %key,
                    available = balance.available(),
                    "adjustment drove available negative, outstanding holds exceed stock"
                );
            }
            guard.balance = balance;
            balances.push(guard.balance.clone());
        }

        Ok(MovementCommit {
            movements,
            balances,
        })
    }

    fn create_reservation(&self, reservation: Reservation) -> LedgerResult<ReservationCommit> {
        let key = reservation.key;
        let cell = self.cell(key)?;
        let mut guard = self.lock_cell(key, &cell)?;

        guard.balance.reserve(reservation.qty)?;
        guard.reservations.insert(reservation.id, reservation.clone());

        // The index entry is written under the cell lock, so an id becomes
        // resolvable only once its row and balance are committed.
        self.reservation_keys
            .write()
            .map_err(|_| poisoned())?
            .insert(reservation.id, key);

        Ok(ReservationCommit {
            balance: Some(guard.balance.clone()),
            reservation,
            changed: true,
        })
    }

    fn release_reservation(&self, id: ReservationId) -> LedgerResult<ReservationCommit> {
        let key = self.reservation_key(id)?;
        let cell = self.cell(key)?;
        let mut guard = self.lock_cell(key, &cell)?;

        let mut reservation = guard.reservations.get(&id).cloned().ok_or_else(|| {
            LedgerError::internal(format!("reservation {id} missing from its key cell"))
        })?;

        let changed = reservation.release(Utc::now());
        if changed {
            guard.balance.release_hold(reservation.qty)?;
            guard.reservations.insert(id, reservation.clone());
        }

        Ok(ReservationCommit {
            balance: changed.then(|| guard.balance.clone()),
            reservation,
            changed,
        })
    }

    fn fulfill_reservation(&self, id: ReservationId) -> LedgerResult<FulfillCommit> {
        let key = self.reservation_key(id)?;
        let cell = self.cell(key)?;
        let mut guard = self.lock_cell(key, &cell)?;

        let mut reservation = guard.reservations.get(&id).cloned().ok_or_else(|| {
            LedgerError::internal(format!("reservation {id} missing from its key cell"))
        })?;

        let now = Utc::now();
        let draft = MovementDraft::issue(
            key,
            reservation.qty,
            None,
            Reference::reservation(*id.as_uuid()),
            now,
        )?;
        let movement = StockMovement::commit(draft, guard.next_sequence());

        let changed = reservation.fulfill(movement.id, now);
        if !changed {
            // Already terminal, whether fulfilled earlier or released. The
            // speculative movement is discarded and its sequence slot was
            // never consumed.
            return Ok(FulfillCommit {
                reservation,
                movement: None,
                balance: None,
            });
        }

        guard.balance.fulfill_hold(reservation.qty)?;
        guard.journal.push(movement.clone());
        guard.reservations.insert(id, reservation.clone());

        Ok(FulfillCommit {
            balance: Some(guard.balance.clone()),
            reservation,
            movement: Some(movement),
        })
    }

    fn reconcile_alerts(&self, key: StockKey, threshold: i64) -> LedgerResult<AlertTransitions> {
        let Some(cell) = self.existing_cell(key)? else {
            return Ok(AlertTransitions::default());
        };
        let guard = self.lock_cell(key, &cell)?;
        let on_hand = guard.balance.on_hand;
        let version = guard.balance.version;

        // The cell lock stays held while the alert section updates, so a
        // concurrent writer cannot commit a newer balance between the
        // observation and the alert rows it produces.
        let mut section_guard = self.alerts.lock().map_err(|_| poisoned())?;
        let section = &mut *section_guard;
        if section.reconciled.get(&key).is_some_and(|&v| v >= version) {
            return Ok(AlertTransitions::default());
        }

        let now = Utc::now();
        let desired = desired_alert(on_hand, threshold);
        let mut transitions = AlertTransitions::default();

        for kind in AlertKind::ALL {
            let active_idx = section.active.get(&(key, kind)).copied();
            match (desired == Some(kind), active_idx) {
                (true, None) => {
                    let alert = StockAlert::raise(key, kind, threshold, on_hand, now);
                    section.active.insert((key, kind), section.rows.len());
                    section.rows.push(alert.clone());
                    transitions.raised.push(alert);
                }
                (false, Some(idx)) => {
                    section.active.remove(&(key, kind));
                    let row = section.rows.get_mut(idx).ok_or_else(|| {
                        LedgerError::internal("active alert index out of bounds")
                    })?;
                    row.clear(now);
                    transitions.cleared.push(row.clone());
                }
                _ => {}
            }
        }

        section.reconciled.insert(key, version);
        Ok(transitions)
    }

    fn balance(&self, key: StockKey) -> LedgerResult<Option<InventoryBalance>> {
        let Some(cell) = self.existing_cell(key)? else {
            return Ok(None);
        };
        let guard = cell.lock().map_err(|_| poisoned())?;
        // Cells created by rolled-back admissions have never committed a
        // write; they read as absent.
        if guard.balance.version == 0 {
            return Ok(None);
        }
        Ok(Some(guard.balance.clone()))
    }

    fn balances(
        &self,
        filter: &BalanceFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<InventoryBalance>> {
        let cells: Vec<(StockKey, Arc<Mutex<KeyCell>>)> = {
            let map = self.cells.read().map_err(|_| poisoned())?;
            map.iter().map(|(k, c)| (*k, Arc::clone(c))).collect()
        };

        let mut rows = Vec::new();
        for (key, cell) in cells {
            if let Some(warehouse_id) = filter.warehouse_id {
                if key.warehouse_id != warehouse_id {
                    continue;
                }
            }
            if let Some(variant_id) = filter.variant_id {
                if key.variant_id != variant_id {
                    continue;
                }
            }
            let balance = {
                let guard = cell.lock().map_err(|_| poisoned())?;
                guard.balance.clone()
            };
            if balance.version == 0 {
                continue;
            }
            if let Some(cap) = filter.available_at_most {
                if balance.available() > cap {
                    continue;
                }
            }
            rows.push(balance);
        }
        rows.sort_by_key(|b| b.key);
        Ok(Page::from_vec(rows, pagination))
    }

    fn history(&self, key: StockKey, range: &HistoryRange) -> LedgerResult<Vec<StockMovement>> {
        let Some(cell) = self.existing_cell(key)? else {
            return Ok(vec![]);
        };
        let guard = cell.lock().map_err(|_| poisoned())?;
        Ok(guard
            .journal
            .iter()
            .filter(|m| range.contains(m))
            .cloned()
            .collect())
    }

    fn reservation(&self, id: ReservationId) -> LedgerResult<Option<Reservation>> {
        let key = {
            let index = self.reservation_keys.read().map_err(|_| poisoned())?;
            match index.get(&id).copied() {
                Some(key) => key,
                None => return Ok(None),
            }
        };
        let Some(cell) = self.existing_cell(key)? else {
            return Ok(None);
        };
        let guard = cell.lock().map_err(|_| poisoned())?;
        Ok(guard.reservations.get(&id).cloned())
    }

    fn reservations(
        &self,
        filter: &ReservationFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<Reservation>> {
        let cells: Vec<Arc<Mutex<KeyCell>>> = match filter.key {
            Some(key) => match self.existing_cell(key)? {
                Some(cell) => vec![cell],
                None => vec![],
            },
            None => {
                let map = self.cells.read().map_err(|_| poisoned())?;
                map.values().cloned().collect()
            }
        };

        let mut rows = Vec::new();
        for cell in cells {
            let guard = cell.lock().map_err(|_| poisoned())?;
            rows.extend(
                guard
                    .reservations
                    .values()
                    .filter(|r| filter.status.is_none_or(|s| r.status == s))
                    .cloned(),
            );
        }
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(Page::from_vec(rows, pagination))
    }

    fn alerts(
        &self,
        filter: &AlertFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<StockAlert>> {
        let section = self.alerts.lock().map_err(|_| poisoned())?;
        let mut rows: Vec<StockAlert> = section
            .rows
            .iter()
            .filter(|a| {
                filter
                    .warehouse_id
                    .is_none_or(|w| a.key.warehouse_id == w)
                    && filter.kind.is_none_or(|k| a.kind == k)
                    && filter.status.is_none_or(|s| a.status == s)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.raised_at.cmp(&a.raised_at).then_with(|| b.id.cmp(&a.id)));
        Ok(Page::from_vec(rows, pagination))
    }
}

fn poisoned() -> LedgerError {
    LedgerError::internal("store lock poisoned")
}
