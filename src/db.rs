use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::types::{
    ActivityEvent, ActivityQuery, ChainType, Direction, EventType, NewUser, TransferKind, TxStatus,
    User,
};

#[async_trait]
pub trait ActivityRepository: Send + Sync {
    /// Inserts the batch in one transaction, skipping ids that already exist.
    /// Returns one flag per event: `true` if the row was newly written.
    async fn insert_batch(&self, events: &[ActivityEvent]) -> AppResult<Vec<bool>>;

    async fn recent(&self, query: &ActivityQuery) -> AppResult<Vec<ActivityEvent>>;

    /// Cheap round trip used by the health endpoint.
    async fn ping(&self) -> AppResult<()>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_address(&self, wallet_address: &str) -> AppResult<Option<User>>;

    async fn create(&self, user: &NewUser) -> AppResult<User>;

    /// All-or-nothing insert of every row.
    async fn create_many(&self, users: &[NewUser]) -> AppResult<Vec<User>>;

    /// Returns `false` when no row matched.
    async fn delete_by_address(&self, wallet_address: &str) -> AppResult<bool>;

    async fn list(&self, chain: Option<ChainType>) -> AppResult<Vec<User>>;
}

/// Postgres-backed store for users and activity. Transactions need exclusive
/// access to the client, so it sits behind an async mutex.
pub struct Database {
    client: Mutex<Client>,
}

impl Database {
    pub async fn connect(dsn: &str, schema: &str) -> AppResult<Self> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {:?}", e);
            }
        });

        // Create schema if not exists
        client.batch_execute(schema).await?;

        info!("PostgreSQL ready");

        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

const INSERT_EVENT: &str = r#"
    INSERT INTO activity_events (
        event_id,
        event_type,
        matched_address,
        direction,
        counterparty,
        network,
        block_number,
        block_timestamp,
        tx_hash,
        log_index,
        token_address,
        amount,
        status
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12::text::numeric, $13)
    ON CONFLICT (event_id) DO NOTHING
"#;

const SELECT_EVENTS: &str = r#"
    SELECT event_id, event_type, matched_address, direction, counterparty, network,
           block_number, block_timestamp, tx_hash, log_index, token_address,
           amount::text AS amount, status
    FROM activity_events
    WHERE ($1::text IS NULL OR matched_address = $1)
      AND ($2::text IS NULL OR event_type = $2)
    ORDER BY block_number DESC, event_id DESC
    LIMIT $3
"#;

const INSERT_USER: &str = r#"
    INSERT INTO users (id, wallet_address, chain_type, name, display_name, created_at)
    VALUES ($1, $2, $3, $4, $5, $6)
"#;

const USER_COLUMNS: &str = "id, wallet_address, chain_type, name, display_name, created_at";

/// BIGINT columns hold chain counters; values past `i64::MAX` are refused
/// instead of wrapping.
fn to_column(value: u64, column: &str) -> AppResult<i64> {
    i64::try_from(value)
        .map_err(|_| AppError::Persistence(format!("{} {} does not fit a BIGINT column", column, value)))
}

fn from_column(value: i64, column: &str) -> AppResult<u64> {
    u64::try_from(value)
        .map_err(|_| AppError::Persistence(format!("Stored {} {} is negative", column, value)))
}

fn row_to_event(row: &Row) -> AppResult<ActivityEvent> {
    let event_type: String = row.try_get("event_type")?;
    let amount: String = row.try_get("amount")?;
    let kind = match EventType::from_str(&event_type)
        .map_err(|e| AppError::Persistence(e.to_string()))?
    {
        EventType::NativeTransfer => TransferKind::NativeTransfer { amount },
        EventType::Erc20Transfer => TransferKind::Erc20Transfer {
            token_address: row.try_get::<_, Option<String>>("token_address")?.unwrap_or_default(),
            amount_raw: amount,
        },
    };

    let block_number: i64 = row.try_get("block_number")?;
    let log_index: Option<i64> = row.try_get("log_index")?;
    let status: Option<String> = row.try_get("status")?;

    Ok(ActivityEvent {
        event_id: row.try_get("event_id")?,
        kind,
        matched_address: row.try_get("matched_address")?,
        direction: Direction::from_str(&row.try_get::<_, String>("direction")?)?,
        counterparty: row.try_get("counterparty")?,
        network: row.try_get("network")?,
        block_number: from_column(block_number, "block_number")?,
        block_timestamp: row.try_get::<_, DateTime<Utc>>("block_timestamp")?,
        tx_hash: row.try_get("tx_hash")?,
        log_index: log_index.map(|index| from_column(index, "log_index")).transpose()?,
        status: status.as_deref().map(TxStatus::from_str).transpose()?,
    })
}

fn row_to_user(row: &Row) -> AppResult<User> {
    let chain_type: String = row.try_get("chain_type")?;
    Ok(User {
        id: row.try_get::<_, Uuid>("id")?,
        wallet_address: row.try_get("wallet_address")?,
        chain_type: ChainType::from_str(&chain_type)
            .map_err(|e| AppError::Persistence(e.to_string()))?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ActivityRepository for Database {
    async fn insert_batch(&self, events: &[ActivityEvent]) -> AppResult<Vec<bool>> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let statement = tx.prepare(INSERT_EVENT).await?;

        let mut inserted = Vec::with_capacity(events.len());
        for event in events {
            let block_number = to_column(event.block_number, "block_number")?;
            let log_index = event
                .log_index
                .map(|index| to_column(index, "log_index"))
                .transpose()?;
            let status = event.status.map(|status| status.as_str());
            let rows = tx
                .execute(
                    &statement,
                    &[
                        &event.event_id,
                        &event.kind.event_type().as_str(),
                        &event.matched_address,
                        &event.direction.as_str(),
                        &event.counterparty,
                        &event.network,
                        &block_number,
                        &event.block_timestamp,
                        &event.tx_hash,
                        &log_index,
                        &event.kind.token_address(),
                        &event.kind.amount(),
                        &status,
                    ],
                )
                .await?;
            inserted.push(rows == 1);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn recent(&self, query: &ActivityQuery) -> AppResult<Vec<ActivityEvent>> {
        let address = query.address.as_deref();
        let event_type = query.event_type.map(|t| t.as_str());
        let limit = i64::from(query.effective_limit());

        let client = self.client.lock().await;
        let rows = client.query(SELECT_EVENTS, &[&address, &event_type, &limit]).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn ping(&self) -> AppResult<()> {
        let client = self.client.lock().await;
        client.execute("SELECT 1", &[]).await?;
        Ok(())
    }
}

#[async_trait]
impl UserRepository for Database {
    async fn find_by_address(&self, wallet_address: &str) -> AppResult<Option<User>> {
        let client = self.client.lock().await;
        let query = format!("SELECT {} FROM users WHERE wallet_address = $1", USER_COLUMNS);
        let row = client.query_opt(query.as_str(), &[&wallet_address]).await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn create(&self, user: &NewUser) -> AppResult<User> {
        let user = user.clone().into_user();
        let client = self.client.lock().await;
        client
            .execute(
                INSERT_USER,
                &[
                    &user.id,
                    &user.wallet_address,
                    &user.chain_type.as_str(),
                    &user.name,
                    &user.display_name,
                    &user.created_at,
                ],
            )
            .await?;
        Ok(user)
    }

    async fn create_many(&self, users: &[NewUser]) -> AppResult<Vec<User>> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let statement = tx.prepare(INSERT_USER).await?;

        let mut created = Vec::with_capacity(users.len());
        for new_user in users {
            let user = new_user.clone().into_user();
            tx.execute(
                &statement,
                &[
                    &user.id,
                    &user.wallet_address,
                    &user.chain_type.as_str(),
                    &user.name,
                    &user.display_name,
                    &user.created_at,
                ],
            )
            .await?;
            created.push(user);
        }

        // dropping an uncommitted transaction rolls it back
        tx.commit().await?;
        Ok(created)
    }

    async fn delete_by_address(&self, wallet_address: &str) -> AppResult<bool> {
        let client = self.client.lock().await;
        let rows = client
            .execute("DELETE FROM users WHERE wallet_address = $1", &[&wallet_address])
            .await?;
        Ok(rows > 0)
    }

    async fn list(&self, chain: Option<ChainType>) -> AppResult<Vec<User>> {
        let chain = chain.map(|c| c.as_str());
        let client = self.client.lock().await;
        let query = format!(
            "SELECT {} FROM users WHERE ($1::text IS NULL OR chain_type = $1) ORDER BY created_at DESC",
            USER_COLUMNS
        );
        let rows = client.query(query.as_str(), &[&chain]).await?;
        rows.iter().map(row_to_user).collect()
    }
}
