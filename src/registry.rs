//! Dual-write registration of monitored addresses.
//!
//! Every monitored address lives in two places: the chain-scoped membership
//! list read by the webhook path, and the `users` table. Writes go to the list
//! first. When the relational write fails the list write is undone through
//! [`with_compensation`]; undo failures are logged and never mask the
//! original error.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::UserRepository;
use crate::error::{AppError, AppResult};
use crate::membership::MembershipStore;
use crate::types::{normalize_address, short_address, ChainType, NewUser, User};

/// Runs `action`; if it fails, runs `undo` and returns the original error.
pub async fn with_compensation<T, A, U, F>(action: A, undo: U) -> AppResult<T>
where
    A: Future<Output = AppResult<T>>,
    U: FnOnce() -> F,
    F: Future<Output = AppResult<()>>,
{
    match action.await {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Err(undo_err) = undo().await {
                error!("Compensation failed after '{}': {}", e, undo_err);
            }
            Err(e)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAddReport {
    pub added: Vec<User>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Default)]
struct ParsedBatch {
    accepted: Vec<NewUser>,
    skipped: Vec<String>,
    failed: Vec<String>,
}

/// Key used to spot repeated lines before validation, so a malformed
/// address listed twice is reported once.
fn dedupe_key(chain: ChainType, raw_address: &str) -> String {
    let raw = raw_address.trim();
    match chain {
        ChainType::Evm => raw.to_ascii_lowercase(),
        ChainType::Sol => raw.to_string(),
    }
}

/// Splits `address[,name]` lines into normalized candidates.
fn parse_lines(chain: ChainType, lines: &[String]) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    let mut seen = HashSet::new();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (raw_address, name) = match line.split_once(',') {
            Some((address, name)) => (address, Some(name.trim())),
            None => (line, None),
        };

        let key = dedupe_key(chain, raw_address);
        if !seen.insert(key.clone()) {
            batch.skipped.push(key);
            continue;
        }

        let address = match normalize_address(chain, raw_address) {
            Ok(address) => address,
            Err(_) => {
                batch.failed.push(raw_address.trim().to_string());
                continue;
            }
        };

        let name = name
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| short_address(&address));
        batch.accepted.push(NewUser {
            wallet_address: address,
            chain_type: chain,
            name,
            display_name: None,
        });
    }
    batch
}

#[derive(Clone)]
pub struct RegistryMutator {
    membership: Arc<dyn MembershipStore>,
    users: Arc<dyn UserRepository>,
}

impl RegistryMutator {
    pub fn new(membership: Arc<dyn MembershipStore>, users: Arc<dyn UserRepository>) -> Self {
        Self { membership, users }
    }

    pub async fn add(
        &self,
        chain: ChainType,
        raw_address: &str,
        name: Option<String>,
        display_name: Option<String>,
    ) -> AppResult<User> {
        let address = normalize_address(chain, raw_address)?;
        let list = chain.list_key();

        if self.users.find_by_address(&address).await?.is_some() {
            return Err(AppError::Conflict(format!("Address {} is already registered", address)));
        }
        let listed = self
            .membership
            .contains_batch(list, std::slice::from_ref(&address))
            .await?;
        if listed.first().copied().unwrap_or(false) {
            return Err(AppError::Conflict(format!("Address {} is already monitored", address)));
        }

        // another writer may have claimed the entry since the check above;
        // only an entry this call created is ever compensated
        if !self.membership.add(list, &address).await? {
            return Err(AppError::Conflict(format!("Address {} is already monitored", address)));
        }

        let new_user = NewUser {
            name: name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| short_address(&address)),
            wallet_address: address.clone(),
            chain_type: chain,
            display_name,
        };

        let user = with_compensation(self.users.create(&new_user), || {
            self.membership.remove(list, &address)
        })
        .await
        .map_err(|e| {
            if e.is_conflict() {
                AppError::Conflict(format!("Address {} is already registered", address))
            } else {
                AppError::Persistence(e.to_string())
            }
        })?;

        info!("Registered {} address {}", chain, user.wallet_address);
        Ok(user)
    }

    pub async fn bulk_add(&self, chain: ChainType, lines: &[String]) -> AppResult<BulkAddReport> {
        let list = chain.list_key();
        let ParsedBatch {
            accepted,
            mut skipped,
            mut failed,
        } = parse_lines(chain, lines);

        let addresses: Vec<String> = accepted.iter().map(|u| u.wallet_address.clone()).collect();
        let listed = if addresses.is_empty() {
            Vec::new()
        } else {
            self.membership.contains_batch(list, &addresses).await?
        };

        let mut fresh = Vec::with_capacity(accepted.len());
        for (user, already) in accepted.into_iter().zip(listed) {
            if already {
                debug!("{} already monitored, skipping", user.wallet_address);
                skipped.push(user.wallet_address);
            } else {
                fresh.push(user);
            }
        }

        if fresh.is_empty() {
            return Ok(BulkAddReport {
                added: Vec::new(),
                skipped,
                failed,
            });
        }

        // list writes continue past individual failures so the report is complete
        let mut written = Vec::with_capacity(fresh.len());
        let mut claimed = Vec::with_capacity(fresh.len());
        let mut write_failures = Vec::new();
        for user in fresh {
            match self.membership.add(list, &user.wallet_address).await {
                Ok(true) => {
                    written.push(user.wallet_address.clone());
                    claimed.push(user);
                }
                Ok(false) => {
                    debug!("{} claimed by another writer, skipping", user.wallet_address);
                    skipped.push(user.wallet_address);
                }
                Err(e) => {
                    warn!("Membership add failed for {}: {}", user.wallet_address, e);
                    write_failures.push(user.wallet_address);
                }
            }
        }

        if !write_failures.is_empty() {
            let message = format!(
                "{} of {} addresses could not be added; batch rolled back",
                write_failures.len(),
                written.len() + write_failures.len()
            );
            failed.extend(write_failures);
            let conflict = AppError::BulkConflict {
                message,
                failed,
                skipped,
                rolled_back: written.clone(),
            };
            return with_compensation(async { Err(conflict) }, || {
                self.remove_all(list, &written)
            })
            .await;
        }

        if claimed.is_empty() {
            return Ok(BulkAddReport {
                added: Vec::new(),
                skipped,
                failed,
            });
        }

        let created = with_compensation(self.users.create_many(&claimed), || {
            self.remove_all(list, &written)
        })
        .await;
        let added = match created {
            Ok(added) => added,
            Err(e) => {
                failed.extend(written.iter().cloned());
                return Err(AppError::BulkConflict {
                    message: format!("Registration of {} addresses rolled back: {}", written.len(), e),
                    failed,
                    skipped,
                    rolled_back: written,
                });
            }
        };

        info!(
            "Bulk registered {} {} addresses ({} skipped, {} failed)",
            added.len(),
            chain,
            skipped.len(),
            failed.len()
        );
        Ok(BulkAddReport {
            added,
            skipped,
            failed,
        })
    }

    /// Deletes the row, then drops the address from the list in the
    /// background. The list removal is never rolled back.
    pub async fn remove(&self, chain: ChainType, raw_address: &str) -> AppResult<String> {
        let address = normalize_address(chain, raw_address)?;
        if !self.users.delete_by_address(&address).await? {
            return Err(AppError::NotFound(format!("Address {} is not registered", address)));
        }

        let membership = Arc::clone(&self.membership);
        let key = address.clone();
        tokio::spawn(async move {
            if let Err(e) = membership.remove(chain.list_key(), &key).await {
                error!("Membership removal failed for {}: {}", key, e);
            }
        });

        info!("Unregistered {} address {}", chain, address);
        Ok(address)
    }

    pub async fn list(&self, chain: Option<ChainType>) -> AppResult<Vec<User>> {
        self.users.list(chain).await
    }

    async fn remove_all(&self, list: &str, addresses: &[String]) -> AppResult<()> {
        let mut leftover = Vec::new();
        for address in addresses {
            if let Err(e) = self.membership.remove(list, address).await {
                error!("Rollback removal failed for {}: {}", address, e);
                leftover.push(address.clone());
            }
        }
        if leftover.is_empty() {
            Ok(())
        } else {
            Err(AppError::UpstreamUnavailable(format!(
                "{} addresses left in {}: {}",
                leftover.len(),
                list,
                leftover.join(", ")
            )))
        }
    }
}
