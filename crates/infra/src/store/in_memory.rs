//! In-memory request store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use forgeexec_core::{ErrorRecord, Request, RequestId, RequestStatus, WorkerId};

use super::r#trait::{
    CancelResult, OutcomeWrite, RequestAdmin, RequestQuery, RequestStore, RequeueStore,
    StoreError, StoreResult,
};

/// In-memory request store.
///
/// Every mutation holds the request map's write lock for its full
/// check-and-write, which gives the same atomicity the Postgres adapter gets
/// from conditional updates. When both maps are needed, requests are locked
/// before errors.
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    requests: RwLock<HashMap<RequestId, Request>>,
    errors: RwLock<Vec<ErrorRecord>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read_requests(&self) -> StoreResult<RwLockReadGuard<'_, HashMap<RequestId, Request>>> {
        self.requests.read().map_err(|_| poisoned("requests"))
    }

    fn write_requests(&self) -> StoreResult<RwLockWriteGuard<'_, HashMap<RequestId, Request>>> {
        self.requests.write().map_err(|_| poisoned("requests"))
    }

    fn read_errors(&self) -> StoreResult<RwLockReadGuard<'_, Vec<ErrorRecord>>> {
        self.errors.read().map_err(|_| poisoned("errors"))
    }

    fn write_errors(&self) -> StoreResult<RwLockWriteGuard<'_, Vec<ErrorRecord>>> {
        self.errors.write().map_err(|_| poisoned("errors"))
    }

    fn collect<F>(&self, filter: F) -> StoreResult<Vec<Request>>
    where
        F: Fn(&Request) -> bool,
    {
        let requests = self.read_requests()?;
        let mut out: Vec<Request> = requests.values().filter(|r| filter(r)).cloned().collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }
}

fn poisoned(what: &str) -> StoreError {
    StoreError::Storage(format!("{what} lock poisoned"))
}

fn by_fire_time(requests: &mut [Request]) {
    requests.sort_by(|a, b| a.fire_time.cmp(&b.fire_time).then(a.id.cmp(&b.id)));
}

impl RequestStore for InMemoryRequestStore {
    fn insert(&self, request: Request) -> StoreResult<RequestId> {
        let mut requests = self.write_requests()?;
        if requests.contains_key(&request.id) {
            return Err(StoreError::AlreadyExists(request.id));
        }
        let id = request.id;
        requests.insert(id, request);
        Ok(id)
    }

    fn eligible(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Request>> {
        let requests = self.read_requests()?;
        let mut candidates: Vec<Request> = requests
            .values()
            .filter(|r| r.is_eligible(now))
            .cloned()
            .collect();
        by_fire_time(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn claim(
        &self,
        id: RequestId,
        expected: RequestStatus,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Request>> {
        let mut requests = self.write_requests()?;
        let Some(request) = requests.get_mut(&id) else {
            return Ok(None);
        };
        if request.status != expected || !request.is_eligible(now) {
            return Ok(None);
        }
        if request.claim(owner.clone(), now).is_err() {
            return Ok(None);
        }
        Ok(Some(request.clone()))
    }

    fn update_outcome(
        &self,
        id: RequestId,
        owner: &WorkerId,
        outcome: OutcomeWrite,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut requests = self.write_requests()?;
        let Some(request) = requests.get_mut(&id) else {
            return Ok(false);
        };
        if !request.is_owned_by(owner) {
            return Ok(false);
        }

        let mut updated = request.clone();
        let error = match outcome {
            OutcomeWrite::Done { response } => {
                updated.complete(response, now).map(|_| None)
            }
            OutcomeWrite::Rescheduled { context, fire_time } => {
                updated.reschedule(context, fire_time, now).map(|_| None)
            }
            OutcomeWrite::Retrying { fire_time, error } => {
                updated.retry(fire_time, now).map(|_| Some(error))
            }
            OutcomeWrite::Failed { error } => updated.fail(now).map(|_| Some(error)),
        }
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        if let Some(error) = error {
            self.write_errors()?.push(error);
        }
        *request = updated;
        Ok(true)
    }

    fn cancel(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<CancelResult> {
        let mut requests = self.write_requests()?;
        let Some(request) = requests.get_mut(&id) else {
            return Ok(CancelResult::NotFound);
        };
        match request.cancel(now) {
            Ok(()) => Ok(CancelResult::Cancelled(request.clone())),
            Err(_) => Ok(CancelResult::NotCancellable(request.status)),
        }
    }
}

impl RequestQuery for InMemoryRequestStore {
    fn get(&self, id: RequestId) -> StoreResult<Option<Request>> {
        Ok(self.read_requests()?.get(&id).cloned())
    }

    fn all_requests(&self) -> StoreResult<Vec<Request>> {
        self.collect(|_| true)
    }

    fn requests_by_status(&self, statuses: &[RequestStatus]) -> StoreResult<Vec<Request>> {
        self.collect(|r| statuses.contains(&r.status))
    }

    fn future_queued(&self, now: DateTime<Utc>) -> StoreResult<Vec<Request>> {
        let mut out = self.collect(|r| r.status.is_claimable() && r.fire_time > now)?;
        by_fire_time(&mut out);
        Ok(out)
    }

    fn pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<Request>> {
        let mut out = self.collect(|r| r.is_eligible(now))?;
        by_fire_time(&mut out);
        Ok(out)
    }

    fn pending_by_id(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<Option<Request>> {
        Ok(self
            .read_requests()?
            .get(&id)
            .filter(|r| r.is_eligible(now))
            .cloned())
    }

    fn by_business_key(&self, key: &str) -> StoreResult<Vec<Request>> {
        self.collect(|r| r.business_key.as_deref() == Some(key))
    }

    fn errors(&self) -> StoreResult<Vec<ErrorRecord>> {
        Ok(self.read_errors()?.clone())
    }

    fn errors_for(&self, id: RequestId) -> StoreResult<Vec<ErrorRecord>> {
        Ok(self
            .read_errors()?
            .iter()
            .filter(|e| e.request_id == id)
            .cloned()
            .collect())
    }
}

impl RequestAdmin for InMemoryRequestStore {
    fn clear_all_requests(&self) -> StoreResult<usize> {
        let mut requests = self.write_requests()?;
        let before = requests.len();
        requests.retain(|_, r| !r.status.is_terminal());
        Ok(before - requests.len())
    }

    fn clear_all_errors(&self) -> StoreResult<usize> {
        let mut errors = self.write_errors()?;
        let count = errors.len();
        errors.clear();
        Ok(count)
    }
}

impl RequeueStore for InMemoryRequestStore {
    fn requeue_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut requests = self.write_requests()?;
        let mut count = 0;
        for request in requests.values_mut() {
            if request.status == RequestStatus::Running
                && request.updated_at < cutoff
                && request.requeue(now).is_ok()
            {
                count += 1;
            }
        }
        Ok(count)
    }

    fn requeue_by_id(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut requests = self.write_requests()?;
        Ok(requests
            .get_mut(&id)
            .is_some_and(|r| r.requeue(now).is_ok()))
    }
}
