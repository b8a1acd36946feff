//! In-memory backends for the membership list and the relational store.
//!
//! All data is lost when the process exits. Both backends can be told to fail
//! so the compensation and degraded-health paths can be driven without a live
//! Redis or Postgres.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::db::{ActivityRepository, UserRepository};
use crate::error::{AppError, AppResult};
use crate::membership::MembershipStore;
use crate::types::{ActivityEvent, ActivityQuery, ChainType, NewUser, User};

#[derive(Default)]
pub struct InMemoryMembershipStore {
    lists: Mutex<HashMap<String, HashSet<String>>>,
    failing_adds: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    fail_removes: AtomicBool,
    yield_calls: AtomicBool,
    contains_calls: AtomicUsize,
}

impl InMemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `UpstreamUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes `add` fail for this key only.
    pub fn fail_add_for(&self, key: &str) {
        self.failing_adds.lock().unwrap().insert(key.to_string());
    }

    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Every call yields to the scheduler before touching the lists, so
    /// concurrent callers interleave the way network round trips do.
    pub fn set_yield_calls(&self, yield_calls: bool) {
        self.yield_calls.store(yield_calls, Ordering::SeqCst);
    }

    async fn maybe_yield(&self) {
        if self.yield_calls.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }

    /// Number of `contains_batch` round trips served so far.
    pub fn contains_calls(&self) -> usize {
        self.contains_calls.load(Ordering::SeqCst)
    }

    pub fn is_member(&self, list: &str, key: &str) -> bool {
        self.lists
            .lock()
            .unwrap()
            .get(list)
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }

    pub fn len(&self, list: &str) -> usize {
        self.lists.lock().unwrap().get(list).map(|set| set.len()).unwrap_or(0)
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamUnavailable("membership store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn contains_batch(&self, list: &str, keys: &[String]) -> AppResult<Vec<bool>> {
        self.maybe_yield().await;
        self.check_available()?;
        self.contains_calls.fetch_add(1, Ordering::SeqCst);
        let lists = self.lists.lock().unwrap();
        let set = lists.get(list);
        Ok(keys
            .iter()
            .map(|key| set.map(|s| s.contains(key)).unwrap_or(false))
            .collect())
    }

    async fn add(&self, list: &str, key: &str) -> AppResult<bool> {
        self.maybe_yield().await;
        self.check_available()?;
        if self.failing_adds.lock().unwrap().contains(key) {
            return Err(AppError::UpstreamUnavailable(format!("add rejected for {}", key)));
        }
        Ok(self
            .lists
            .lock()
            .unwrap()
            .entry(list.to_string())
            .or_default()
            .insert(key.to_string()))
    }

    async fn remove(&self, list: &str, key: &str) -> AppResult<()> {
        self.maybe_yield().await;
        self.check_available()?;
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamUnavailable(format!("remove rejected for {}", key)));
        }
        if let Some(set) = self.lists.lock().unwrap().get_mut(list) {
            set.remove(key);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDatabase {
    events: Mutex<Vec<ActivityEvent>>,
    users: Mutex<Vec<User>>,
    unavailable: AtomicBool,
    fail_user_writes: AtomicBool,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `UpstreamUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes user inserts fail with a generic persistence error.
    pub fn set_fail_user_writes(&self, fail: bool) {
        self.fail_user_writes.store(fail, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamUnavailable("database offline".to_string()));
        }
        Ok(())
    }

    fn check_user_writes(&self) -> AppResult<()> {
        self.check_available()?;
        if self.fail_user_writes.load(Ordering::SeqCst) {
            return Err(AppError::Persistence("user insert failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityRepository for InMemoryDatabase {
    async fn insert_batch(&self, batch: &[ActivityEvent]) -> AppResult<Vec<bool>> {
        self.check_available()?;
        let mut events = self.events.lock().unwrap();
        let mut seen: HashSet<String> = events.iter().map(|e| e.event_id.clone()).collect();

        let mut inserted = Vec::with_capacity(batch.len());
        for event in batch {
            let fresh = seen.insert(event.event_id.clone());
            if fresh {
                events.push(event.clone());
            }
            inserted.push(fresh);
        }
        Ok(inserted)
    }

    async fn recent(&self, query: &ActivityQuery) -> AppResult<Vec<ActivityEvent>> {
        self.check_available()?;
        let events = self.events.lock().unwrap();
        let mut matching: Vec<ActivityEvent> = events
            .iter()
            .filter(|e| query.address.as_ref().map_or(true, |a| &e.matched_address == a))
            .filter(|e| query.event_type.map_or(true, |t| e.kind.event_type() == t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.block_number
                .cmp(&a.block_number)
                .then_with(|| b.event_id.cmp(&a.event_id))
        });
        matching.truncate(query.effective_limit() as usize);
        Ok(matching)
    }

    async fn ping(&self) -> AppResult<()> {
        self.check_available()
    }
}

#[async_trait]
impl UserRepository for InMemoryDatabase {
    async fn find_by_address(&self, wallet_address: &str) -> AppResult<Option<User>> {
        self.check_available()?;
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.wallet_address == wallet_address)
            .cloned())
    }

    async fn create(&self, user: &NewUser) -> AppResult<User> {
        self.create_many(std::slice::from_ref(user))
            .await
            .map(|mut created| created.remove(0))
    }

    async fn create_many(&self, new_users: &[NewUser]) -> AppResult<Vec<User>> {
        self.check_user_writes()?;
        let mut users = self.users.lock().unwrap();
        let mut taken: HashSet<&str> = users.iter().map(|u| u.wallet_address.as_str()).collect();
        for new_user in new_users {
            if !taken.insert(new_user.wallet_address.as_str()) {
                return Err(AppError::Conflict(format!(
                    "duplicate key value violates unique constraint: {}",
                    new_user.wallet_address
                )));
            }
        }

        let created: Vec<User> = new_users.iter().cloned().map(NewUser::into_user).collect();
        users.extend(created.iter().cloned());
        Ok(created)
    }

    async fn delete_by_address(&self, wallet_address: &str) -> AppResult<bool> {
        self.check_available()?;
        let mut users = self.users.lock().unwrap();
        let before = users.len();
        users.retain(|u| u.wallet_address != wallet_address);
        Ok(users.len() != before)
    }

    async fn list(&self, chain: Option<ChainType>) -> AppResult<Vec<User>> {
        self.check_available()?;
        let users = self.users.lock().unwrap();
        let mut listed: Vec<User> = users
            .iter()
            .filter(|u| chain.map_or(true, |c| u.chain_type == c))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listed)
    }
}
