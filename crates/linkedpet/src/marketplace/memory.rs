use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use super::domain::{
    Account, DocumentStatus, NewPublication, NewRequest, Publication, PublicationId, Request,
    RequestId, UserId,
};
use super::store::{MarketplaceStore, PublicationFilter, StoreError, UnitOfWork};
use crate::config::StoreConfig;

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<UserId, Account>,
    publications: BTreeMap<PublicationId, Publication>,
    requests: BTreeMap<RequestId, Request>,
}

/// In-process store with unit-of-work isolation and per-publication row locks.
///
/// Units read committed rows overlaid with their own staged writes. Staged writes
/// are applied atomically on commit, after the (publication, particular)
/// uniqueness constraint on requests is re-checked against committed state.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<PublicationId, u64>>,
    lock_released: Condvar,
    lock_timeout: Duration,
    next_unit: AtomicU64,
    next_publication: AtomicU64,
    next_request: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            row_locks: Mutex::new(HashMap::new()),
            lock_released: Condvar::new(),
            lock_timeout: config.lock_timeout,
            next_unit: AtomicU64::new(1),
            next_publication: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
        }
    }

    /// Adds or replaces a directory entry outside any unit of work.
    pub fn register_account(&self, account: Account) -> Result<(), StoreError> {
        self.tables()?.accounts.insert(account.user_id, account);
        Ok(())
    }

    /// Committed state of one publication, as any other reader would see it.
    pub fn committed_publication(
        &self,
        id: PublicationId,
    ) -> Result<Option<Publication>, StoreError> {
        Ok(self.tables()?.publications.get(&id).cloned())
    }

    /// Committed requests of one publication, as any other reader would see them.
    pub fn committed_requests(
        &self,
        publication_id: PublicationId,
    ) -> Result<Vec<Request>, StoreError> {
        Ok(self
            .tables()?
            .requests
            .values()
            .filter(|request| request.publication_id == publication_id)
            .cloned()
            .collect())
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("table mutex poisoned".to_string()))
    }

    fn acquire(&self, unit: u64, id: PublicationId) -> Result<(), StoreError> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| StoreError::Unavailable("lock table mutex poisoned".to_string()))?;

        loop {
            match locks.get(&id) {
                None => {
                    locks.insert(id, unit);
                    return Ok(());
                }
                Some(holder) if *holder == unit => return Ok(()),
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StoreError::LockTimeout(id));
                    }
                    let (guard, _) = self
                        .lock_released
                        .wait_timeout(locks, deadline - now)
                        .map_err(|_| {
                            StoreError::Unavailable("lock table mutex poisoned".to_string())
                        })?;
                    locks = guard;
                }
            }
        }
    }

    fn release_all(&self, unit: u64) {
        if let Ok(mut locks) = self.row_locks.lock() {
            locks.retain(|_, holder| *holder != unit);
        }
        self.lock_released.notify_all();
    }
}

impl MarketplaceStore for MemoryStore {
    type Unit<'a> = MemoryUnit<'a>;

    fn begin(&self) -> Result<MemoryUnit<'_>, StoreError> {
        Ok(MemoryUnit {
            store: self,
            id: self.next_unit.fetch_add(1, Ordering::Relaxed),
            staged: Staged::default(),
            finished: false,
        })
    }
}

#[derive(Debug, Default)]
struct Staged {
    publications: BTreeMap<PublicationId, Publication>,
    /// `None` marks a deleted row.
    requests: BTreeMap<RequestId, Option<Request>>,
}

/// Unit of work over [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryUnit<'a> {
    store: &'a MemoryStore,
    id: u64,
    staged: Staged,
    finished: bool,
}

impl MemoryUnit<'_> {
    fn visible_publications(&self) -> Result<BTreeMap<PublicationId, Publication>, StoreError> {
        let mut rows = self.store.tables()?.publications.clone();
        for (id, row) in &self.staged.publications {
            rows.insert(*id, row.clone());
        }
        Ok(rows)
    }

    fn visible_requests(&self) -> Result<BTreeMap<RequestId, Request>, StoreError> {
        let mut rows = self.store.tables()?.requests.clone();
        apply_staged_requests(&mut rows, &self.staged.requests);
        Ok(rows)
    }

    fn visible_publication(&self, id: PublicationId) -> Result<Option<Publication>, StoreError> {
        if let Some(row) = self.staged.publications.get(&id) {
            return Ok(Some(row.clone()));
        }
        Ok(self.store.tables()?.publications.get(&id).cloned())
    }

    fn visible_request(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        if let Some(row) = self.staged.requests.get(&id) {
            return Ok(row.clone());
        }
        Ok(self.store.tables()?.requests.get(&id).cloned())
    }
}

fn apply_staged_requests(
    rows: &mut BTreeMap<RequestId, Request>,
    staged: &BTreeMap<RequestId, Option<Request>>,
) {
    for (id, row) in staged {
        match row {
            Some(request) => {
                rows.insert(*id, request.clone());
            }
            None => {
                rows.remove(id);
            }
        }
    }
}

fn check_request_pairs(rows: &BTreeMap<RequestId, Request>) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    for request in rows.values() {
        if !seen.insert((request.publication_id, request.particular_id)) {
            return Err(StoreError::Constraint(format!(
                "particular {} already has a request on publication {}",
                request.particular_id, request.publication_id
            )));
        }
    }
    Ok(())
}

impl UnitOfWork for MemoryUnit<'_> {
    fn account(&mut self, id: UserId) -> Result<Option<Account>, StoreError> {
        Ok(self.store.tables()?.accounts.get(&id).cloned())
    }

    fn publication(&mut self, id: PublicationId) -> Result<Option<Publication>, StoreError> {
        self.visible_publication(id)
    }

    fn lock_publication(&mut self, id: PublicationId) -> Result<Option<Publication>, StoreError> {
        self.store.acquire(self.id, id)?;
        self.visible_publication(id)
    }

    fn publications(
        &mut self,
        filter: &PublicationFilter,
    ) -> Result<Vec<Publication>, StoreError> {
        Ok(self
            .visible_publications()?
            .into_values()
            .filter(|publication| filter.matches(publication))
            .collect())
    }

    fn insert_publication(&mut self, row: NewPublication) -> Result<Publication, StoreError> {
        let id = PublicationId(self.store.next_publication.fetch_add(1, Ordering::Relaxed));
        let publication = Publication {
            id,
            kind: row.kind,
            owner: row.owner,
            title: row.title,
            animal: row.animal,
            price_cents: row.price_cents,
            document_status: DocumentStatus::InRevision,
            transaction_status: None,
            payment_intent: None,
            charge_in_flight: false,
            payout_in_flight: false,
            created_at: Utc::now(),
        };
        self.staged.publications.insert(id, publication.clone());
        Ok(publication)
    }

    fn update_publication(&mut self, publication: &Publication) -> Result<(), StoreError> {
        if self.visible_publication(publication.id)?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.store.acquire(self.id, publication.id)?;
        self.staged
            .publications
            .insert(publication.id, publication.clone());
        Ok(())
    }

    fn request(&mut self, id: RequestId) -> Result<Option<Request>, StoreError> {
        self.visible_request(id)
    }

    fn request_for(
        &mut self,
        publication_id: PublicationId,
        particular_id: UserId,
    ) -> Result<Option<Request>, StoreError> {
        Ok(self.visible_requests()?.into_values().find(|request| {
            request.publication_id == publication_id && request.particular_id == particular_id
        }))
    }

    fn requests_for_publication(
        &mut self,
        publication_id: PublicationId,
    ) -> Result<Vec<Request>, StoreError> {
        Ok(self
            .visible_requests()?
            .into_values()
            .filter(|request| request.publication_id == publication_id)
            .collect())
    }

    fn requests_by_particular(
        &mut self,
        particular_id: UserId,
    ) -> Result<Vec<Request>, StoreError> {
        Ok(self
            .visible_requests()?
            .into_values()
            .filter(|request| request.particular_id == particular_id)
            .collect())
    }

    fn insert_request(&mut self, row: NewRequest) -> Result<Request, StoreError> {
        if self.visible_publication(row.publication_id)?.is_none() {
            return Err(StoreError::Constraint(format!(
                "publication {} does not exist",
                row.publication_id
            )));
        }
        if self
            .request_for(row.publication_id, row.particular_id)?
            .is_some()
        {
            return Err(StoreError::Constraint(format!(
                "particular {} already has a request on publication {}",
                row.particular_id, row.publication_id
            )));
        }

        let request = Request {
            id: RequestId(self.store.next_request.fetch_add(1, Ordering::Relaxed)),
            publication_id: row.publication_id,
            particular_id: row.particular_id,
            status: row.status,
            is_favorite: row.is_favorite,
            created_at: Utc::now(),
        };
        self.staged
            .requests
            .insert(request.id, Some(request.clone()));
        Ok(request)
    }

    fn update_request(&mut self, request: &Request) -> Result<(), StoreError> {
        if self.visible_request(request.id)?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.staged
            .requests
            .insert(request.id, Some(request.clone()));
        Ok(())
    }

    fn delete_request(&mut self, id: RequestId) -> Result<(), StoreError> {
        if self.visible_request(id)?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.staged.requests.insert(id, None);
        Ok(())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let staged = std::mem::take(&mut self.staged);
        let mut tables = self.store.tables()?;

        let mut requests = tables.requests.clone();
        apply_staged_requests(&mut requests, &staged.requests);
        check_request_pairs(&requests)?;

        tables.requests = requests;
        tables.publications.extend(staged.publications);
        drop(tables);

        self.finished = true;
        debug!(unit = self.id, "unit of work committed");
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.staged = Staged::default();
        self.finished = true;
        debug!(unit = self.id, "unit of work rolled back");
        Ok(())
    }
}

impl Drop for MemoryUnit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(unit = self.id, "unit of work dropped without commit");
        }
        self.store.release_all(self.id);
    }
}
