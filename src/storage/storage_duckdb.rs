// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Module that handles the connection to the DuckDB database.

use crate::{
    IndexerError,
    constants::*,
    storage::{
        AgreementFilter, AgreementStatus, ExecutableContract, IdxAgreement, IdxOrder,
        IdxTransferApproval, IndexBatch, Listing, ListingFilter, Node, Notification,
        NotificationFilter, NotificationMetainfo, NotificationType, OrderBookEntry,
        OrderBookQuery, OrderFilter, Page, PageRequest, ResultSet, RowMutation, Storage,
        StorageQuery, TransferApplicationKey, TransferApprovalFilter,
        storage_query::OrderType,
    },
};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use duckdb::{
    Connection, OptionalExt, Row, Transaction, params, params_from_iter,
    types::{Type, Value},
};
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, error, warn};

/// Implementation of the [Storage] and [StorageQuery] traits for the DuckDB database.
///
/// # Description
///
/// The DuckDBStorage object owns one connection to the database and serializes its use with a mutex. Sync jobs
/// share a single instance; readers such as the REST API get their own connection from a
/// [DuckDBStorageFactory] to avoid contending with the writers.
pub struct DuckDBStorage {
    conn: Mutex<Connection>,
    db_path: String,
}

/// Simple factory pattern to allow opening a new connection to the same database from a task.
///
/// # Description
///
/// Connections handed out by the factory are clones of a base connection, so they share the database instance
/// with the writer (this also holds for in-memory databases). The main use case is the REST API, which opens a
/// new connection for each request.
pub struct DuckDBStorageFactory {
    base: Mutex<Connection>,
    db_path: String,
}

impl DuckDBStorageFactory {
    pub fn create(&self) -> Result<DuckDBStorage> {
        let conn = self
            .base
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?
            .try_clone()
            .context("Failed to open a new connection to the database")?;

        Ok(DuckDBStorage {
            conn: Mutex::new(conn),
            db_path: self.db_path.clone(),
        })
    }
}

/// Equality filters of a list query.
#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Conditions {
    fn eq(mut self, column: &str, value: Option<Value>) -> Self {
        if let Some(value) = value {
            self.clauses.push(format!("{column} = ?"));
            self.params.push(value);
        }
        self
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn text(address: Option<Address>) -> Option<Value> {
    address.map(|a| Value::Text(a.to_string()))
}

fn flag(value: Option<bool>) -> Option<Value> {
    value.map(Value::Boolean)
}

fn micros(timestamp: Option<DateTime<Utc>>) -> Option<i64> {
    timestamp.map(|t| t.timestamp_micros())
}

/// Addresses that may be absent are stored as an empty string so they can be part of a key.
fn address_or_empty(address: &Option<Address>) -> String {
    address.map(|a| a.to_string()).unwrap_or_default()
}

fn address_at(row: &Row<'_>, idx: usize) -> duckdb::Result<Address> {
    let raw: String = row.get(idx)?;
    Address::from_str(&raw)
        .map_err(|e| duckdb::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_address_at(row: &Row<'_>, idx: usize) -> duckdb::Result<Option<Address>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) if !raw.is_empty() => Address::from_str(&raw)
            .map(Some)
            .map_err(|e| duckdb::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        _ => Ok(None),
    }
}

fn datetime_at(row: &Row<'_>, idx: usize) -> duckdb::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<i64>>(idx)?
        .and_then(DateTime::<Utc>::from_timestamp_micros))
}

fn required_datetime_at(row: &Row<'_>, idx: usize) -> duckdb::Result<DateTime<Utc>> {
    datetime_at(row, idx)?.ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(idx, Type::Null, "missing timestamp".into())
    })
}

const LISTING_COLUMNS: &str =
    "id, token_address, is_public, max_holding_quantity, max_sell_amount, owner_address";
const LISTING_SORTABLE: &[&str] = &[
    "id",
    "token_address",
    "owner_address",
    "is_public",
    "max_holding_quantity",
    "max_sell_amount",
];

fn listing_from_row(row: &Row<'_>) -> duckdb::Result<Listing> {
    Ok(Listing {
        id: row.get(0)?,
        token_address: address_at(row, 1)?,
        is_public: row.get(2)?,
        max_holding_quantity: row.get(3)?,
        max_sell_amount: row.get(4)?,
        owner_address: address_at(row, 5)?,
    })
}

const ORDER_COLUMNS: &str = "exchange_address, order_id, unique_order_id, token_address, account_address, \
    counterpart_address, is_buy, price, amount, agent_address, is_cancelled, order_timestamp, transaction_hash";
const ORDER_SORTABLE: &[&str] = &[
    "exchange_address",
    "order_id",
    "token_address",
    "account_address",
    "price",
    "amount",
    "order_timestamp",
];

fn order_from_row(row: &Row<'_>) -> duckdb::Result<IdxOrder> {
    Ok(IdxOrder {
        exchange_address: address_at(row, 0)?,
        order_id: row.get(1)?,
        unique_order_id: row.get(2)?,
        token_address: address_at(row, 3)?,
        account_address: address_at(row, 4)?,
        counterpart_address: optional_address_at(row, 5)?,
        is_buy: row.get(6)?,
        price: row.get(7)?,
        amount: row.get(8)?,
        agent_address: address_at(row, 9)?,
        is_cancelled: row.get(10)?,
        order_timestamp: datetime_at(row, 11)?,
        transaction_hash: row.get(12)?,
    })
}

const AGREEMENT_COLUMNS: &str = "exchange_address, order_id, agreement_id, unique_order_id, counterpart_address, \
    buyer_address, seller_address, price, amount, status, agreement_timestamp, settlement_timestamp";
const AGREEMENT_SORTABLE: &[&str] = &[
    "exchange_address",
    "order_id",
    "agreement_id",
    "price",
    "amount",
    "status",
    "agreement_timestamp",
    "settlement_timestamp",
];

fn agreement_from_row(row: &Row<'_>) -> duckdb::Result<IdxAgreement> {
    let status: i64 = row.get(9)?;
    Ok(IdxAgreement {
        exchange_address: address_at(row, 0)?,
        order_id: row.get(1)?,
        agreement_id: row.get(2)?,
        unique_order_id: row.get(3)?,
        counterpart_address: address_at(row, 4)?,
        buyer_address: address_at(row, 5)?,
        seller_address: address_at(row, 6)?,
        price: row.get(7)?,
        amount: row.get(8)?,
        status: AgreementStatus::from_i64(status).ok_or_else(|| {
            duckdb::Error::FromSqlConversionFailure(
                9,
                Type::BigInt,
                format!("unknown agreement status {status}").into(),
            )
        })?,
        agreement_timestamp: datetime_at(row, 10)?,
        settlement_timestamp: datetime_at(row, 11)?,
    })
}

const TRANSFER_APPROVAL_COLUMNS: &str = "token_address, exchange_address, application_id, from_address, \
    to_address, value, application_datetime, application_blocktimestamp, approval_datetime, \
    approval_blocktimestamp, cancelled, escrow_finished, transfer_approved";
const TRANSFER_APPROVAL_SORTABLE: &[&str] = &[
    "token_address",
    "exchange_address",
    "application_id",
    "from_address",
    "to_address",
    "value",
    "application_datetime",
    "application_blocktimestamp",
    "approval_datetime",
    "approval_blocktimestamp",
];

fn transfer_approval_from_row(row: &Row<'_>) -> duckdb::Result<IdxTransferApproval> {
    Ok(IdxTransferApproval {
        token_address: address_at(row, 0)?,
        exchange_address: optional_address_at(row, 1)?,
        application_id: row.get(2)?,
        from_address: address_at(row, 3)?,
        to_address: address_at(row, 4)?,
        value: row.get(5)?,
        application_datetime: datetime_at(row, 6)?,
        application_blocktimestamp: required_datetime_at(row, 7)?,
        approval_datetime: datetime_at(row, 8)?,
        approval_blocktimestamp: datetime_at(row, 9)?,
        cancelled: row.get(10)?,
        escrow_finished: row.get(11)?,
        transfer_approved: row.get(12)?,
    })
}

const NOTIFICATION_COLUMNS: &str = "notification_id, notification_type, priority, address, block_timestamp, \
    args, metainfo, is_read, is_flagged, is_deleted, deleted_at, created";
const NOTIFICATION_SORTABLE: &[&str] = &[
    "notification_id",
    "notification_type",
    "priority",
    "block_timestamp",
    "created",
];

fn notification_from_row(row: &Row<'_>) -> duckdb::Result<Notification> {
    let notification_type: String = row.get(1)?;
    let priority: i64 = row.get(2)?;
    let args: String = row.get(5)?;
    let metainfo: String = row.get(6)?;

    Ok(Notification {
        notification_id: row.get(0)?,
        notification_type: NotificationType::from_str(&notification_type).map_err(|e| {
            duckdb::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
        })?,
        priority: u8::try_from(priority).map_err(|e| {
            duckdb::Error::FromSqlConversionFailure(2, Type::BigInt, Box::new(e))
        })?,
        address: optional_address_at(row, 3)?,
        block_timestamp: required_datetime_at(row, 4)?,
        args: serde_json::from_str(&args)
            .map_err(|e| duckdb::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        metainfo: serde_json::from_str::<NotificationMetainfo>(&metainfo)
            .map_err(|e| duckdb::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
        is_read: row.get(7)?,
        is_flagged: row.get(8)?,
        is_deleted: row.get(9)?,
        deleted_at: datetime_at(row, 10)?,
        created: required_datetime_at(row, 11)?,
    })
}

impl Storage for DuckDBStorage {
    fn commit_batch(&self, batch: &IndexBatch) -> Result<usize> {
        let next_block = i64::try_from(batch.next_block)
            .with_context(|| format!("Checkpoint {} out of range", batch.next_block))?;
        let updated_at = Utc::now().timestamp_micros();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut written = 0;
        for mutation in &batch.mutations {
            written += Self::apply_mutation(&tx, mutation)
                .with_context(|| format!("Failed to apply a mutation of {}", batch.job_name))?;
        }

        if !batch.catch_up {
            tx.execute(
                "INSERT INTO checkpoint (job_name, next_block, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT (job_name) DO UPDATE SET next_block = excluded.next_block, updated_at = excluded.updated_at",
                params![batch.job_name, next_block, updated_at],
            )?;
        }

        if !batch.targets.is_empty() {
            let mut statement = tx.prepare(
                "INSERT INTO target_checkpoint (job_name, contract_address, next_block, updated_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT (job_name, contract_address) DO UPDATE SET next_block = excluded.next_block,
                    updated_at = excluded.updated_at",
            )?;
            for target in &batch.targets {
                statement.execute(params![batch.job_name, target.to_string(), next_block, updated_at])?;
            }
        }

        // Explicitly commit the transaction
        tx.commit()?;

        debug!(
            "{}: {} rows written, next block {}{}",
            batch.job_name,
            written,
            batch.next_block,
            if batch.catch_up { " (catch up)" } else { "" }
        );

        Ok(written)
    }

    fn load_checkpoint(&self, job_name: &str) -> Result<Option<u64>> {
        let conn = self.lock()?;
        let next_block: Option<i64> = conn
            .query_row(
                "SELECT next_block FROM checkpoint WHERE job_name = ?",
                [job_name],
                |row| row.get(0),
            )
            .optional()?;

        next_block
            .map(|block| u64::try_from(block).context("Negative checkpoint in the database"))
            .transpose()
    }

    fn load_target_checkpoints(&self, job_name: &str) -> Result<HashMap<Address, u64>> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare("SELECT contract_address, next_block FROM target_checkpoint WHERE job_name = ?")?;
        let rows = statement
            .query_map([job_name], |row| Ok((address_at(row, 0)?, row.get::<_, i64>(1)?)))?
            .collect::<duckdb::Result<Vec<(Address, i64)>>>()?;

        rows.into_iter()
            .map(|(target, next_block)| {
                let next_block = u64::try_from(next_block).context("Negative checkpoint in the database")?;
                Ok((target, next_block))
            })
            .collect()
    }

    fn is_listed(&self, token_address: &Address) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM listing WHERE token_address = ?",
            [token_address.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn listed_tokens(&self, public_only: bool) -> Result<Vec<Address>> {
        let conn = self.lock()?;
        let sql = if public_only {
            "SELECT token_address FROM listing WHERE is_public ORDER BY id"
        } else {
            "SELECT token_address FROM listing ORDER BY id"
        };
        let mut statement = conn.prepare(sql)?;
        let tokens = statement
            .query_map([], |row| address_at(row, 0))?
            .collect::<duckdb::Result<Vec<Address>>>()?;
        Ok(tokens)
    }

    fn insert_listing(&self, listing: &Listing) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        Self::insert_listing_in(&tx, listing)?;
        tx.commit()?;

        Ok(())
    }

    fn insert_executable_contract(&self, contract_address: &Address) -> Result<ExecutableContract> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let contract = Self::insert_executable_contract_in(&tx, contract_address)?;
        tx.commit()?;

        Ok(contract)
    }

    fn register_token(&self, listing: &Listing) -> Result<ExecutableContract> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        // An early return drops the transaction, which rolls back the listing row.
        Self::insert_listing_in(&tx, listing)?;
        let contract = Self::insert_executable_contract_in(&tx, &listing.token_address)?;
        tx.commit()?;

        Ok(contract)
    }

    fn is_executable(&self, contract_address: &Address) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM executable_contract WHERE contract_address = ?",
            [contract_address.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn upsert_node(&self, node: &Node) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO node (id, endpoint_uri, priority, is_synced) VALUES (?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET endpoint_uri = excluded.endpoint_uri,
                priority = excluded.priority, is_synced = excluded.is_synced",
            params![node.id, node.endpoint_uri, node.priority, node.is_synced],
        )?;
        Ok(())
    }
}

impl StorageQuery for DuckDBStorage {
    fn list_listings(&self, filter: &ListingFilter, page: &PageRequest) -> Result<Page<Listing>> {
        let conditions = Conditions::default()
            .eq("token_address", text(filter.token_address))
            .eq("owner_address", text(filter.owner_address))
            .eq("is_public", flag(filter.is_public));
        let column = page.sort_column(LISTING_SORTABLE, "id")?;

        self.fetch_page(
            "listing",
            LISTING_COLUMNS,
            conditions,
            format!("{column} {}, id", page.sort_order),
            page,
            listing_from_row,
        )
    }

    fn list_executable_contracts(&self, page: &PageRequest) -> Result<Page<ExecutableContract>> {
        let column = page.sort_column(&["id", "contract_address"], "id")?;

        self.fetch_page(
            "executable_contract",
            "id, contract_address",
            Conditions::default(),
            format!("{column} {}, id", page.sort_order),
            page,
            |row| {
                Ok(ExecutableContract {
                    id: row.get(0)?,
                    contract_address: address_at(row, 1)?,
                })
            },
        )
    }

    fn list_orders(&self, filter: &OrderFilter, page: &PageRequest) -> Result<Page<IdxOrder>> {
        let conditions = Conditions::default()
            .eq("exchange_address", text(filter.exchange_address))
            .eq("token_address", text(filter.token_address))
            .eq("account_address", text(filter.account_address))
            .eq("is_buy", flag(filter.is_buy))
            .eq("is_cancelled", flag(filter.is_cancelled));
        let column = page.sort_column(ORDER_SORTABLE, "order_id")?;

        self.fetch_page(
            "idx_order",
            ORDER_COLUMNS,
            conditions,
            format!("{column} {}, exchange_address, order_id", page.sort_order),
            page,
            order_from_row,
        )
    }

    fn list_agreements(
        &self,
        filter: &AgreementFilter,
        page: &PageRequest,
    ) -> Result<Page<IdxAgreement>> {
        let conditions = Conditions::default()
            .eq("exchange_address", text(filter.exchange_address))
            .eq("order_id", filter.order_id.map(Value::BigInt))
            .eq("buyer_address", text(filter.buyer_address))
            .eq("seller_address", text(filter.seller_address))
            .eq("status", filter.status.map(|s| Value::BigInt(s.as_i64())));
        let column = page.sort_column(AGREEMENT_SORTABLE, "agreement_id")?;

        self.fetch_page(
            "idx_agreement",
            AGREEMENT_COLUMNS,
            conditions,
            format!(
                "{column} {}, exchange_address, order_id, agreement_id",
                page.sort_order
            ),
            page,
            agreement_from_row,
        )
    }

    fn list_transfer_approvals(
        &self,
        filter: &TransferApprovalFilter,
        page: &PageRequest,
    ) -> Result<Page<IdxTransferApproval>> {
        let conditions = Conditions::default()
            .eq("token_address", text(filter.token_address))
            .eq("from_address", text(filter.from_address))
            .eq("to_address", text(filter.to_address))
            .eq("cancelled", flag(filter.cancelled))
            .eq("transfer_approved", flag(filter.transfer_approved));
        let column = page.sort_column(TRANSFER_APPROVAL_SORTABLE, "application_id")?;

        self.fetch_page(
            "idx_transfer_approval",
            TRANSFER_APPROVAL_COLUMNS,
            conditions,
            format!(
                "{column} {}, token_address, exchange_address, application_id",
                page.sort_order
            ),
            page,
            transfer_approval_from_row,
        )
    }

    fn list_notifications(
        &self,
        filter: &NotificationFilter,
        page: &PageRequest,
    ) -> Result<Page<Notification>> {
        let conditions = Conditions::default()
            .eq("address", text(filter.address))
            .eq(
                "notification_type",
                filter.notification_type.map(|t| Value::Text(t.to_string())),
            )
            .eq("priority", filter.priority.map(|p| Value::BigInt(p.into())));
        let column = page.sort_column(NOTIFICATION_SORTABLE, "notification_id")?;

        self.fetch_page(
            "notification",
            NOTIFICATION_COLUMNS,
            conditions,
            format!("{column} {}, notification_id", page.sort_order),
            page,
            notification_from_row,
        )
    }

    fn order_book(&self, query: &OrderBookQuery) -> Result<Vec<OrderBookEntry>> {
        // A buyer takes sell orders and a seller takes buy orders.
        let (is_buy, direction) = match query.order_type {
            OrderType::Buy => (false, "ASC"),
            OrderType::Sell => (true, "DESC"),
        };

        let conditions = Conditions::default()
            .eq("o.token_address", text(Some(query.token_address)))
            .eq("o.is_buy", Some(Value::Boolean(is_buy)))
            .eq("o.is_cancelled", Some(Value::Boolean(false)))
            .eq("o.exchange_address", text(query.exchange_address))
            .eq("o.agent_address", text(query.agent_address));
        let mut where_sql = conditions.sql();
        let mut params = conditions.params;
        if let Some(account) = query.account_address {
            where_sql.push_str(" AND o.account_address <> ?");
            params.push(Value::Text(account.to_string()));
        }

        let sql = format!(
            "SELECT o.exchange_address, o.order_id, o.price,
                CAST(o.amount - COALESCE(SUM(a.amount), 0) AS BIGINT) AS remaining,
                o.account_address
             FROM idx_order o
             LEFT JOIN idx_agreement a
                ON a.unique_order_id = o.unique_order_id AND a.status <> {canceled}
             {where_sql}
             GROUP BY o.exchange_address, o.order_id, o.price, o.amount, o.account_address
             HAVING o.amount - COALESCE(SUM(a.amount), 0) > 0
             ORDER BY o.price {direction}, o.order_id ASC",
            canceled = AgreementStatus::Canceled.as_i64(),
        );

        let conn = self.lock()?;
        let mut statement = conn.prepare(&sql)?;
        let entries = statement
            .query_map(params_from_iter(params.iter()), |row| {
                Ok(OrderBookEntry {
                    exchange_address: address_at(row, 0)?,
                    order_id: row.get(1)?,
                    price: row.get(2)?,
                    amount: row.get(3)?,
                    account_address: address_at(row, 4)?,
                })
            })?
            .collect::<duckdb::Result<Vec<OrderBookEntry>>>()?;

        Ok(entries)
    }

    fn list_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare("SELECT id, endpoint_uri, priority, is_synced FROM node ORDER BY priority, id")?;
        let nodes = statement
            .query_map([], |row| {
                Ok(Node {
                    id: row.get(0)?,
                    endpoint_uri: row.get(1)?,
                    priority: row.get(2)?,
                    is_synced: row.get(3)?,
                })
            })?
            .collect::<duckdb::Result<Vec<Node>>>()?;
        Ok(nodes)
    }
}

impl DuckDBStorage {
    pub fn new() -> Result<DuckDBStorage> {
        Self::with_db(DUCKDB_FILE_PATH)
    }

    /// Creates a new DuckDBStorage with the given database path.
    pub fn with_db(db_path: &str) -> Result<DuckDBStorage> {
        let conn = Connection::open(db_path).map_err(|e| {
            error!(
                "Failed to open database: {db_path}. Check that the DB file is not locked by another process."
            );
            anyhow::anyhow!("Failed to open database {db_path}: {e}")
        })?;

        let table_exists: bool = conn.query_row(
            r#"
                SELECT
                    count(*)
                FROM
                    information_schema.tables
                WHERE
                    table_schema = 'main'
                    AND table_name = ?
                    AND table_type = 'BASE TABLE';"#,
            [DUCKDB_BASE_TABLE_NAME],
            |row| row.get(0),
        )?;

        if !table_exists {
            DuckDBStorage::create_schema(&conn)?;
        } else {
            let version: String = conn
                .query_row(
                    format!("SELECT version FROM {DUCKDB_BASE_TABLE_NAME} LIMIT 1").as_str(),
                    [],
                    |row| row.get(0),
                )
                .with_context(|| {
                    format!("Failed to retrieve version from {DUCKDB_BASE_TABLE_NAME} table")
                })?;

            if version != DUCKDB_SCHEMA_VERSION {
                warn!("Your database is out of date. Please run the database upgrade.");
            }
        }

        debug!("Database connection successfully established");

        Ok(DuckDBStorage {
            conn: Mutex::new(conn),
            db_path: db_path.to_string(),
        })
    }

    /// Builds a factory of connections that share this database instance.
    pub fn factory(&self) -> Result<DuckDBStorageFactory> {
        let base = self
            .lock()?
            .try_clone()
            .context("Failed to open a new connection to the database")?;

        Ok(DuckDBStorageFactory {
            base: Mutex::new(base),
            db_path: self.db_path.clone(),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))
    }

    fn insert_listing_in(tx: &Transaction<'_>, listing: &Listing) -> Result<()> {
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM listing WHERE token_address = ?",
            [listing.token_address.to_string()],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(IndexerError::DataConflict(format!(
                "token {} is already listed",
                listing.token_address
            ))
            .into());
        }

        tx.execute(
            "INSERT INTO listing (token_address, is_public, max_holding_quantity, max_sell_amount, owner_address)
             VALUES (?, ?, ?, ?, ?)",
            params![
                listing.token_address.to_string(),
                listing.is_public,
                listing.max_holding_quantity,
                listing.max_sell_amount,
                listing.owner_address.to_string()
            ],
        )?;

        Ok(())
    }

    fn insert_executable_contract_in(
        tx: &Transaction<'_>,
        contract_address: &Address,
    ) -> Result<ExecutableContract> {
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM executable_contract WHERE contract_address = ?",
            [contract_address.to_string()],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(IndexerError::DataConflict(format!(
                "contract {contract_address} is already registered"
            ))
            .into());
        }

        let id: i64 = tx.query_row(
            "INSERT INTO executable_contract (contract_address) VALUES (?) RETURNING id",
            [contract_address.to_string()],
            |row| row.get(0),
        )?;

        Ok(ExecutableContract {
            id: Some(id),
            contract_address: *contract_address,
        })
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        let statement = format!(
            "
            BEGIN;
            CREATE TABLE IF NOT EXISTS {DUCKDB_BASE_TABLE_NAME}(
                version VARCHAR NOT NULL,
                PRIMARY KEY (version)
            );
            CREATE SEQUENCE IF NOT EXISTS listing_id_seq START 1;
            CREATE TABLE IF NOT EXISTS listing(
                id BIGINT NOT NULL DEFAULT nextval('listing_id_seq'),
                token_address VARCHAR(42) NOT NULL,
                is_public BOOLEAN NOT NULL,
                max_holding_quantity BIGINT,
                max_sell_amount BIGINT,
                owner_address VARCHAR(42) NOT NULL,
                PRIMARY KEY (token_address)
            );
            CREATE SEQUENCE IF NOT EXISTS executable_contract_id_seq START 1;
            CREATE TABLE IF NOT EXISTS executable_contract(
                id BIGINT NOT NULL DEFAULT nextval('executable_contract_id_seq'),
                contract_address VARCHAR(42) NOT NULL,
                PRIMARY KEY (contract_address)
            );
            CREATE TABLE IF NOT EXISTS idx_order(
                exchange_address VARCHAR(42) NOT NULL,
                order_id BIGINT NOT NULL,
                unique_order_id VARCHAR NOT NULL,
                token_address VARCHAR(42) NOT NULL,
                account_address VARCHAR(42) NOT NULL,
                counterpart_address VARCHAR(42) NOT NULL,
                is_buy BOOLEAN NOT NULL,
                price BIGINT NOT NULL,
                amount BIGINT NOT NULL,
                agent_address VARCHAR(42) NOT NULL,
                is_cancelled BOOLEAN NOT NULL,
                order_timestamp BIGINT,
                transaction_hash VARCHAR(66) NOT NULL,
                PRIMARY KEY (exchange_address, order_id)
            );
            CREATE TABLE IF NOT EXISTS idx_agreement(
                exchange_address VARCHAR(42) NOT NULL,
                order_id BIGINT NOT NULL,
                agreement_id BIGINT NOT NULL,
                unique_order_id VARCHAR NOT NULL,
                counterpart_address VARCHAR(42) NOT NULL,
                buyer_address VARCHAR(42) NOT NULL,
                seller_address VARCHAR(42) NOT NULL,
                price BIGINT NOT NULL,
                amount BIGINT NOT NULL,
                status BIGINT NOT NULL,
                agreement_timestamp BIGINT,
                settlement_timestamp BIGINT,
                PRIMARY KEY (exchange_address, order_id, agreement_id)
            );
            CREATE TABLE IF NOT EXISTS idx_transfer_approval(
                token_address VARCHAR(42) NOT NULL,
                exchange_address VARCHAR(42) NOT NULL,
                application_id BIGINT NOT NULL,
                from_address VARCHAR(42) NOT NULL,
                to_address VARCHAR(42) NOT NULL,
                value BIGINT NOT NULL,
                application_datetime BIGINT,
                application_blocktimestamp BIGINT NOT NULL,
                approval_datetime BIGINT,
                approval_blocktimestamp BIGINT,
                cancelled BOOLEAN,
                escrow_finished BOOLEAN,
                transfer_approved BOOLEAN,
                PRIMARY KEY (token_address, exchange_address, application_id)
            );
            CREATE TABLE IF NOT EXISTS notification(
                notification_id VARCHAR(28) NOT NULL,
                notification_type VARCHAR NOT NULL,
                priority BIGINT NOT NULL,
                address VARCHAR(42),
                block_timestamp BIGINT NOT NULL,
                args VARCHAR NOT NULL,
                metainfo VARCHAR NOT NULL,
                is_read BOOLEAN NOT NULL,
                is_flagged BOOLEAN NOT NULL,
                is_deleted BOOLEAN NOT NULL,
                deleted_at BIGINT,
                created BIGINT NOT NULL,
                PRIMARY KEY (notification_id)
            );
            CREATE TABLE IF NOT EXISTS node(
                id BIGINT NOT NULL,
                endpoint_uri VARCHAR NOT NULL,
                priority INTEGER NOT NULL,
                is_synced BOOLEAN NOT NULL,
                PRIMARY KEY (id)
            );
            CREATE TABLE IF NOT EXISTS checkpoint(
                job_name VARCHAR NOT NULL,
                next_block BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (job_name)
            );
            CREATE TABLE IF NOT EXISTS target_checkpoint(
                job_name VARCHAR NOT NULL,
                contract_address VARCHAR(42) NOT NULL,
                next_block BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (job_name, contract_address)
            );
            INSERT INTO {DUCKDB_BASE_TABLE_NAME} (version) VALUES ('{DUCKDB_SCHEMA_VERSION}');
            COMMIT;"
        );
        conn.execute_batch(&statement)?;

        Ok(())
    }

    /// Applies one mutation and returns the number of affected rows.
    fn apply_mutation(tx: &Transaction<'_>, mutation: &RowMutation) -> Result<usize> {
        let written = match mutation {
            RowMutation::NewOrder(order) => tx.execute(
                "INSERT INTO idx_order (exchange_address, order_id, unique_order_id, token_address,
                    account_address, counterpart_address, is_buy, price, amount, agent_address,
                    is_cancelled, order_timestamp, transaction_hash)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (exchange_address, order_id) DO NOTHING",
                params![
                    order.exchange_address.to_string(),
                    order.order_id,
                    order.unique_order_id,
                    order.token_address.to_string(),
                    order.account_address.to_string(),
                    address_or_empty(&order.counterpart_address),
                    order.is_buy,
                    order.price,
                    order.amount,
                    order.agent_address.to_string(),
                    order.is_cancelled,
                    micros(order.order_timestamp),
                    order.transaction_hash
                ],
            )?,
            RowMutation::CancelOrder {
                exchange_address,
                order_id,
            } => tx.execute(
                "UPDATE idx_order SET is_cancelled = true
                 WHERE exchange_address = ? AND order_id = ? AND NOT is_cancelled",
                params![exchange_address.to_string(), order_id],
            )?,
            RowMutation::NewAgreement {
                exchange_address,
                order_id,
                agreement_id,
                buyer_address,
                seller_address,
                price,
                amount,
                agreement_timestamp,
            } => {
                // The counterpart is whoever took the order.
                let is_buy_order: Option<bool> = tx
                    .query_row(
                        "SELECT is_buy FROM idx_order WHERE exchange_address = ? AND order_id = ?",
                        params![exchange_address.to_string(), order_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let counterpart = match is_buy_order {
                    Some(true) => seller_address,
                    Some(false) => buyer_address,
                    None => {
                        warn!(
                            "Agreement {agreement_id} references order {order_id} of {exchange_address}, which is not indexed"
                        );
                        buyer_address
                    }
                };

                tx.execute(
                    "INSERT INTO idx_agreement (exchange_address, order_id, agreement_id, unique_order_id,
                        counterpart_address, buyer_address, seller_address, price, amount, status,
                        agreement_timestamp, settlement_timestamp)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
                     ON CONFLICT (exchange_address, order_id, agreement_id) DO NOTHING",
                    params![
                        exchange_address.to_string(),
                        order_id,
                        agreement_id,
                        IdxOrder::unique_order_id(exchange_address, *order_id),
                        counterpart.to_string(),
                        buyer_address.to_string(),
                        seller_address.to_string(),
                        price,
                        amount,
                        AgreementStatus::Pending.as_i64(),
                        agreement_timestamp.timestamp_micros()
                    ],
                )?
            }
            RowMutation::SettleAgreement {
                exchange_address,
                order_id,
                agreement_id,
                status,
                settlement_timestamp,
            } => tx.execute(
                "UPDATE idx_agreement SET status = ?, settlement_timestamp = ?
                 WHERE exchange_address = ? AND order_id = ? AND agreement_id = ? AND status = ?",
                params![
                    status.as_i64(),
                    micros(*settlement_timestamp),
                    exchange_address.to_string(),
                    order_id,
                    agreement_id,
                    AgreementStatus::Pending.as_i64()
                ],
            )?,
            RowMutation::ApplyForTransfer(application) => tx.execute(
                "INSERT INTO idx_transfer_approval (token_address, exchange_address, application_id,
                    from_address, to_address, value, application_datetime, application_blocktimestamp)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (token_address, exchange_address, application_id) DO UPDATE SET
                    value = excluded.value,
                    application_datetime = excluded.application_datetime,
                    application_blocktimestamp = excluded.application_blocktimestamp",
                params![
                    application.token_address.to_string(),
                    address_or_empty(&application.exchange_address),
                    application.application_id,
                    application.from_address.to_string(),
                    application.to_address.to_string(),
                    application.value,
                    micros(application.application_datetime),
                    application.application_blocktimestamp.timestamp_micros()
                ],
            )?,
            RowMutation::CancelTransfer(key) => Self::update_application(
                tx,
                "cancelled = true",
                "approval_blocktimestamp IS NULL",
                key,
            )?,
            RowMutation::ApproveTransfer {
                key,
                approval_datetime,
                approval_blocktimestamp,
            } => tx.execute(
                "UPDATE idx_transfer_approval
                 SET approval_datetime = ?, approval_blocktimestamp = ?, transfer_approved = true
                 WHERE token_address = ? AND exchange_address = ? AND application_id = ?
                    AND COALESCE(cancelled, false) = false",
                params![
                    micros(*approval_datetime),
                    approval_blocktimestamp.timestamp_micros(),
                    key.token_address.to_string(),
                    address_or_empty(&key.exchange_address),
                    key.application_id
                ],
            )?,
            RowMutation::FinishEscrow(key) => {
                Self::update_application(tx, "escrow_finished = true", "true", key)?
            }
            RowMutation::Notify(notification) => tx.execute(
                "INSERT INTO notification (notification_id, notification_type, priority, address,
                    block_timestamp, args, metainfo, is_read, is_flagged, is_deleted, deleted_at, created)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (notification_id) DO NOTHING",
                params![
                    notification.notification_id,
                    notification.notification_type.to_string(),
                    i64::from(notification.priority),
                    notification.address.map(|a| a.to_string()),
                    notification.block_timestamp.timestamp_micros(),
                    serde_json::to_string(&notification.args)?,
                    serde_json::to_string(&notification.metainfo)?,
                    notification.is_read,
                    notification.is_flagged,
                    notification.is_deleted,
                    micros(notification.deleted_at),
                    notification.created.timestamp_micros()
                ],
            )?,
        };

        Ok(written)
    }

    fn update_application(
        tx: &Transaction<'_>,
        assignment: &str,
        guard: &str,
        key: &TransferApplicationKey,
    ) -> Result<usize> {
        Ok(tx.execute(
            &format!(
                "UPDATE idx_transfer_approval SET {assignment}
                 WHERE token_address = ? AND exchange_address = ? AND application_id = ? AND {guard}"
            ),
            params![
                key.token_address.to_string(),
                address_or_empty(&key.exchange_address),
                key.application_id
            ],
        )?)
    }

    fn fetch_page<T, F>(
        &self,
        table: &str,
        columns: &str,
        conditions: Conditions,
        order_by: String,
        page: &PageRequest,
        mapper: F,
    ) -> Result<Page<T>>
    where
        F: FnMut(&Row<'_>) -> duckdb::Result<T>,
    {
        let conn = self.lock()?;
        let where_sql = conditions.sql();

        let total: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table}{where_sql}"),
            params_from_iter(conditions.params.iter()),
            |row| row.get(0),
        )?;

        let mut sql = format!("SELECT {columns} FROM {table}{where_sql} ORDER BY {order_by}");
        if let Some(limit) = page.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = page.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let mut statement = conn.prepare(&sql)?;
        let rows = statement
            .query_map(params_from_iter(conditions.params.iter()), mapper)?
            .collect::<duckdb::Result<Vec<T>>>()?;

        Ok(Page {
            result_set: ResultSet {
                count: count as u64,
                offset: page.offset,
                limit: page.limit,
                total: total as u64,
            },
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NotificationArgs, SortOrder, StatusArgs};
    use crate::test_utils::{fake_address, listing_for};
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};
    use serde_json::json;

    #[fixture]
    fn storage() -> DuckDBStorage {
        DuckDBStorage::with_db(":memory:").expect("in-memory DB should open")
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn batch(job_name: &str, next_block: u64, mutations: Vec<RowMutation>) -> IndexBatch {
        IndexBatch {
            job_name: job_name.to_string(),
            next_block,
            mutations,
            ..Default::default()
        }
    }

    fn order(exchange: Address, order_id: i64, is_buy: bool, price: i64, amount: i64) -> IdxOrder {
        IdxOrder {
            exchange_address: exchange,
            order_id,
            unique_order_id: IdxOrder::unique_order_id(&exchange, order_id),
            token_address: Address::repeat_byte(0x70),
            account_address: Address::repeat_byte(0x01),
            counterpart_address: None,
            is_buy,
            price,
            amount,
            agent_address: Address::repeat_byte(0xa9),
            is_cancelled: false,
            order_timestamp: Some(at(1_700_000_000)),
            transaction_hash: format!("0x{:064x}", order_id),
        }
    }

    fn agreement(exchange: Address, order_id: i64, agreement_id: i64, amount: i64) -> RowMutation {
        RowMutation::NewAgreement {
            exchange_address: exchange,
            order_id,
            agreement_id,
            buyer_address: Address::repeat_byte(0xb0),
            seller_address: Address::repeat_byte(0x5e),
            price: 100,
            amount,
            agreement_timestamp: at(1_700_000_100),
        }
    }

    fn settle(exchange: Address, order_id: i64, agreement_id: i64, status: AgreementStatus) -> RowMutation {
        RowMutation::SettleAgreement {
            exchange_address: exchange,
            order_id,
            agreement_id,
            status,
            settlement_timestamp: Some(at(1_700_000_200)),
        }
    }

    fn application(token: Address, application_id: i64) -> IdxTransferApproval {
        IdxTransferApproval {
            token_address: token,
            exchange_address: None,
            application_id,
            from_address: Address::repeat_byte(0x0f),
            to_address: Address::repeat_byte(0x07),
            value: 10,
            application_datetime: Some(at(1_600_000_000)),
            application_blocktimestamp: at(1_700_000_000),
            approval_datetime: None,
            approval_blocktimestamp: None,
            cancelled: None,
            escrow_finished: None,
            transfer_approved: None,
        }
    }

    fn key(token: Address, application_id: i64) -> TransferApplicationKey {
        TransferApplicationKey {
            token_address: token,
            exchange_address: None,
            application_id,
        }
    }

    fn notification(block: u64) -> Notification {
        Notification {
            notification_id: format!("0x{block:012x}{:06x}{:06x}{:02x}", 0, 0, 0),
            notification_type: NotificationType::StartOffering,
            priority: 0,
            address: None,
            block_timestamp: at(1_700_000_000 + block as i64),
            args: serde_json::to_value(NotificationArgs::Status(StatusArgs { status: true }))
                .unwrap(),
            metainfo: NotificationMetainfo {
                company_name: "DEMO".to_string(),
                token_address: Address::repeat_byte(0x70).to_string(),
                token_name: "Membership".to_string(),
                exchange_address: String::new(),
                token_type: "IbetMembership".to_string(),
            },
            is_read: false,
            is_flagged: false,
            is_deleted: false,
            deleted_at: None,
            created: at(1_800_000_000),
        }
    }

    #[rstest]
    fn checkpoint_is_stored_with_the_batch(storage: DuckDBStorage) {
        assert_eq!(storage.load_checkpoint("orders").unwrap(), None);

        storage.commit_batch(&batch("orders", 101, vec![])).unwrap();
        storage.commit_batch(&batch("orders", 202, vec![])).unwrap();

        assert_eq!(storage.load_checkpoint("orders").unwrap(), Some(202));
        assert_eq!(storage.load_checkpoint("notifications").unwrap(), None);
    }

    #[rstest]
    fn catch_up_batches_only_move_their_targets(storage: DuckDBStorage) {
        let (shared, late) = (Address::repeat_byte(0x31), Address::repeat_byte(0x32));
        storage
            .commit_batch(&IndexBatch {
                targets: vec![shared],
                ..batch("orders", 101, vec![])
            })
            .unwrap();
        storage
            .commit_batch(&IndexBatch {
                targets: vec![late],
                catch_up: true,
                ..batch("orders", 51, vec![])
            })
            .unwrap();

        assert_eq!(storage.load_checkpoint("orders").unwrap(), Some(101));
        assert_eq!(
            storage.load_target_checkpoints("orders").unwrap(),
            HashMap::from([(shared, 101), (late, 51)])
        );
        assert!(storage.load_target_checkpoints("notifications").unwrap().is_empty());
    }

    #[rstest]
    fn token_registration_writes_both_rows(storage: DuckDBStorage) {
        let token = fake_address();

        let contract = storage.register_token(&listing_for(token, true)).unwrap();

        assert_eq!(contract.contract_address, token);
        assert!(storage.is_listed(&token).unwrap());
        assert!(storage.is_executable(&token).unwrap());
    }

    #[rstest]
    fn token_registration_rolls_back_on_conflict(storage: DuckDBStorage) {
        let token = fake_address();
        storage.insert_executable_contract(&token).unwrap();

        let error = storage.register_token(&listing_for(token, true)).unwrap_err();

        assert!(matches!(
            IndexerError::find(&error),
            Some(IndexerError::DataConflict(_))
        ));
        assert!(!storage.is_listed(&token).unwrap());
        assert_eq!(storage.listed_tokens(false).unwrap(), Vec::<Address>::new());
    }

    #[rstest]
    fn replaying_a_batch_does_not_duplicate_rows(storage: DuckDBStorage) {
        let exchange = fake_address();
        let mutations = vec![
            RowMutation::NewOrder(order(exchange, 1, false, 100, 1_000_000)),
            agreement(exchange, 1, 1, 1_000_000),
            RowMutation::Notify(notification(10)),
            RowMutation::ApplyForTransfer(application(fake_address(), 0)),
        ];

        let first = storage.commit_batch(&batch("job", 11, mutations.clone())).unwrap();
        let second = storage.commit_batch(&batch("job", 11, mutations)).unwrap();

        assert_eq!(first, 4);
        // The application is refreshed in place, everything else is skipped.
        assert_eq!(second, 1);
        let page = PageRequest::default();
        assert_eq!(storage.list_orders(&OrderFilter::default(), &page).unwrap().rows.len(), 1);
        assert_eq!(storage.list_agreements(&AgreementFilter::default(), &page).unwrap().rows.len(), 1);
        assert_eq!(
            storage.list_notifications(&NotificationFilter::default(), &page).unwrap().rows.len(),
            1
        );
        assert_eq!(
            storage
                .list_transfer_approvals(&TransferApprovalFilter::default(), &page)
                .unwrap()
                .rows
                .len(),
            1
        );
    }

    #[rstest]
    fn cancel_order_flips_the_flag(storage: DuckDBStorage) {
        let exchange = fake_address();
        storage
            .commit_batch(&batch(
                "job",
                2,
                vec![
                    RowMutation::NewOrder(order(exchange, 7, true, 50, 3)),
                    RowMutation::CancelOrder {
                        exchange_address: exchange,
                        order_id: 7,
                    },
                ],
            ))
            .unwrap();

        let orders = storage
            .list_orders(&OrderFilter::default(), &PageRequest::default())
            .unwrap();

        assert!(orders.rows[0].is_cancelled);
        assert_eq!(orders.rows[0].unique_order_id, format!("{exchange}_7"));
    }

    #[rstest]
    #[case::buy_order_is_taken_by_a_seller(true, 0x5e)]
    #[case::sell_order_is_taken_by_a_buyer(false, 0xb0)]
    fn agreement_counterpart_is_the_taker(
        storage: DuckDBStorage,
        #[case] is_buy: bool,
        #[case] counterpart: u8,
    ) {
        let exchange = fake_address();
        storage
            .commit_batch(&batch(
                "job",
                2,
                vec![
                    RowMutation::NewOrder(order(exchange, 1, is_buy, 100, 10)),
                    agreement(exchange, 1, 1, 10),
                ],
            ))
            .unwrap();

        let agreements = storage
            .list_agreements(&AgreementFilter::default(), &PageRequest::default())
            .unwrap();

        assert_eq!(
            agreements.rows[0].counterpart_address,
            Address::repeat_byte(counterpart)
        );
        assert_eq!(agreements.rows[0].status, AgreementStatus::Pending);
    }

    #[rstest]
    #[case::done_is_final(AgreementStatus::Done, AgreementStatus::Canceled)]
    #[case::canceled_is_final(AgreementStatus::Canceled, AgreementStatus::Done)]
    fn agreement_status_only_leaves_pending(
        storage: DuckDBStorage,
        #[case] first: AgreementStatus,
        #[case] second: AgreementStatus,
    ) {
        let exchange = fake_address();
        storage
            .commit_batch(&batch(
                "job",
                2,
                vec![
                    RowMutation::NewOrder(order(exchange, 1, false, 100, 10)),
                    agreement(exchange, 1, 1, 10),
                    settle(exchange, 1, 1, first),
                    settle(exchange, 1, 1, second),
                ],
            ))
            .unwrap();

        let agreements = storage
            .list_agreements(&AgreementFilter::default(), &PageRequest::default())
            .unwrap();

        assert_eq!(agreements.rows[0].status, first);
    }

    #[rstest]
    fn approval_updates_the_application_in_place(storage: DuckDBStorage) {
        let token = fake_address();
        storage
            .commit_batch(&batch(
                "job",
                3,
                vec![
                    RowMutation::ApplyForTransfer(application(token, 0)),
                    RowMutation::ApproveTransfer {
                        key: key(token, 0),
                        approval_datetime: Some(at(1_600_000_500)),
                        approval_blocktimestamp: at(1_700_000_500),
                    },
                ],
            ))
            .unwrap();

        let rows = storage
            .list_transfer_approvals(&TransferApprovalFilter::default(), &PageRequest::default())
            .unwrap()
            .rows;

        let expected = IdxTransferApproval {
            approval_datetime: Some(at(1_600_000_500)),
            approval_blocktimestamp: Some(at(1_700_000_500)),
            transfer_approved: Some(true),
            ..application(token, 0)
        };
        assert_eq!(rows, vec![expected]);
    }

    #[rstest]
    fn cancellation_excludes_a_later_approval(storage: DuckDBStorage) {
        let token = fake_address();
        storage
            .commit_batch(&batch(
                "job",
                3,
                vec![
                    RowMutation::ApplyForTransfer(application(token, 0)),
                    RowMutation::CancelTransfer(key(token, 0)),
                    RowMutation::ApproveTransfer {
                        key: key(token, 0),
                        approval_datetime: None,
                        approval_blocktimestamp: at(1_700_000_500),
                    },
                ],
            ))
            .unwrap();

        let rows = storage
            .list_transfer_approvals(&TransferApprovalFilter::default(), &PageRequest::default())
            .unwrap()
            .rows;

        assert_eq!(rows[0].cancelled, Some(true));
        assert_eq!(rows[0].approval_blocktimestamp, None);
        assert_eq!(rows[0].transfer_approved, None);
    }

    #[rstest]
    fn updates_for_unknown_applications_are_no_ops(storage: DuckDBStorage) {
        let written = storage
            .commit_batch(&batch(
                "job",
                3,
                vec![
                    RowMutation::CancelTransfer(key(fake_address(), 4)),
                    RowMutation::FinishEscrow(key(fake_address(), 5)),
                ],
            ))
            .unwrap();

        assert_eq!(written, 0);
    }

    #[rstest]
    fn duplicated_listing_is_a_conflict(storage: DuckDBStorage) {
        let listing = listing_for(fake_address(), true);
        storage.insert_listing(&listing).unwrap();

        let error = storage.insert_listing(&listing).unwrap_err();

        assert!(matches!(
            IndexerError::find(&error),
            Some(IndexerError::DataConflict(_))
        ));
        assert!(storage.is_listed(&listing.token_address).unwrap());
    }

    #[rstest]
    fn duplicated_executable_contract_is_a_conflict(storage: DuckDBStorage) {
        let contract = fake_address();
        let first = storage.insert_executable_contract(&contract).unwrap();

        let error = storage.insert_executable_contract(&contract).unwrap_err();

        assert_eq!(first.contract_address, contract);
        assert!(matches!(
            IndexerError::find(&error),
            Some(IndexerError::DataConflict(_))
        ));
        assert!(storage.is_executable(&contract).unwrap());
        assert!(!storage.is_executable(&fake_address()).unwrap());
    }

    #[rstest]
    fn listed_tokens_can_be_restricted_to_public_ones(storage: DuckDBStorage) {
        let public = fake_address();
        let private = fake_address();
        storage.insert_listing(&listing_for(public, true)).unwrap();
        storage.insert_listing(&listing_for(private, false)).unwrap();

        assert_eq!(storage.listed_tokens(true).unwrap(), vec![public]);
        assert_eq!(storage.listed_tokens(false).unwrap(), vec![public, private]);
    }

    #[rstest]
    fn offset_beyond_the_last_row_returns_an_empty_page(storage: DuckDBStorage) {
        for _ in 0..5 {
            storage
                .insert_listing(&listing_for(fake_address(), true))
                .unwrap();
        }

        let page = storage
            .list_listings(&ListingFilter::default(), &PageRequest::new(Some(7), None))
            .unwrap();

        assert_eq!(
            page.result_set,
            ResultSet {
                count: 5,
                offset: Some(7),
                limit: None,
                total: 5
            }
        );
        assert!(page.rows.is_empty());
    }

    #[rstest]
    fn count_reflects_the_filters_and_total_the_table(storage: DuckDBStorage) {
        let owner = fake_address();
        for index in 0..4 {
            let mut listing = listing_for(fake_address(), index % 2 == 0);
            listing.owner_address = owner;
            storage.insert_listing(&listing).unwrap();
        }
        storage
            .insert_listing(&listing_for(fake_address(), true))
            .unwrap();

        let filter = ListingFilter {
            owner_address: Some(owner),
            is_public: Some(true),
            ..Default::default()
        };
        let page = storage
            .list_listings(&filter, &PageRequest::new(Some(1), Some(1)))
            .unwrap();

        assert_eq!(
            page.result_set,
            ResultSet {
                count: 2,
                offset: Some(1),
                limit: Some(1),
                total: 5
            }
        );
        assert_eq!(page.rows.len(), 1);
    }

    #[rstest]
    fn listings_sort_by_the_requested_column(storage: DuckDBStorage) {
        for quantity in [3, 1, 2] {
            let mut listing = listing_for(fake_address(), true);
            listing.max_holding_quantity = Some(quantity);
            storage.insert_listing(&listing).unwrap();
        }

        let page = storage
            .list_listings(
                &ListingFilter::default(),
                &PageRequest::default().sorted_by("max_holding_quantity", SortOrder::Desc),
            )
            .unwrap();

        let quantities: Vec<Option<i64>> =
            page.rows.iter().map(|l| l.max_holding_quantity).collect();
        assert_eq!(quantities, vec![Some(3), Some(2), Some(1)]);
    }

    #[rstest]
    fn notifications_come_back_in_identifier_order(storage: DuckDBStorage) {
        storage
            .commit_batch(&batch(
                "job",
                30,
                vec![
                    RowMutation::Notify(notification(20)),
                    RowMutation::Notify(notification(3)),
                    RowMutation::Notify(notification(11)),
                ],
            ))
            .unwrap();

        let rows = storage
            .list_notifications(&NotificationFilter::default(), &PageRequest::default())
            .unwrap()
            .rows;

        let blocks: Vec<String> = rows.iter().map(|n| n.notification_id.clone()).collect();
        let mut sorted = blocks.clone();
        sorted.sort();
        assert_eq!(blocks, sorted);
        assert_eq!(rows[0], notification(3));
        assert_eq!(rows[0].args, json!({ "status": true }));
    }

    #[rstest]
    fn order_book_hides_filled_orders(storage: DuckDBStorage) {
        let exchange = fake_address();
        let token = Address::repeat_byte(0x70);
        let query = OrderBookQuery {
            exchange_address: None,
            token_address: token,
            order_type: OrderType::Buy,
            account_address: None,
            agent_address: None,
        };

        storage
            .commit_batch(&batch(
                "job",
                2,
                vec![RowMutation::NewOrder(order(exchange, 1, false, 100, 1_000_000))],
            ))
            .unwrap();
        assert_eq!(
            storage.order_book(&query).unwrap(),
            vec![OrderBookEntry {
                exchange_address: exchange,
                order_id: 1,
                price: 100,
                amount: 1_000_000,
                account_address: Address::repeat_byte(0x01),
            }]
        );

        storage
            .commit_batch(&batch(
                "job",
                3,
                vec![
                    agreement(exchange, 1, 1, 1_000_000),
                    settle(exchange, 1, 1, AgreementStatus::Done),
                ],
            ))
            .unwrap();
        assert_eq!(storage.order_book(&query).unwrap(), vec![]);
    }

    #[rstest]
    fn cancelled_agreements_give_the_amount_back(storage: DuckDBStorage) {
        let exchange = fake_address();
        let query = OrderBookQuery {
            exchange_address: Some(exchange),
            token_address: Address::repeat_byte(0x70),
            order_type: OrderType::Buy,
            account_address: None,
            agent_address: None,
        };

        storage
            .commit_batch(&batch(
                "job",
                2,
                vec![
                    RowMutation::NewOrder(order(exchange, 1, false, 100, 30)),
                    agreement(exchange, 1, 1, 10),
                    agreement(exchange, 1, 2, 20),
                    settle(exchange, 1, 2, AgreementStatus::Canceled),
                ],
            ))
            .unwrap();

        let book = storage.order_book(&query).unwrap();

        assert_eq!(book.len(), 1);
        assert_eq!(book[0].amount, 20);
    }

    #[rstest]
    fn order_book_sorts_by_side_and_excludes_the_caller(storage: DuckDBStorage) {
        let exchange = fake_address();
        let mut own = order(exchange, 4, true, 300, 1);
        own.account_address = Address::repeat_byte(0xcc);
        storage
            .commit_batch(&batch(
                "job",
                2,
                vec![
                    RowMutation::NewOrder(order(exchange, 1, true, 100, 1)),
                    RowMutation::NewOrder(order(exchange, 2, true, 200, 1)),
                    RowMutation::NewOrder(order(exchange, 3, false, 150, 1)),
                    RowMutation::NewOrder(own),
                ],
            ))
            .unwrap();

        let book = storage
            .order_book(&OrderBookQuery {
                exchange_address: None,
                token_address: Address::repeat_byte(0x70),
                order_type: OrderType::Sell,
                account_address: Some(Address::repeat_byte(0xcc)),
                agent_address: None,
            })
            .unwrap();

        let ids: Vec<i64> = book.iter().map(|e| e.order_id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[rstest]
    fn nodes_are_upserted_by_id(storage: DuckDBStorage) {
        let mut node = Node {
            id: 1,
            endpoint_uri: "http://localhost:8545".to_string(),
            priority: 0,
            is_synced: true,
        };
        storage.upsert_node(&node).unwrap();
        node.is_synced = false;
        storage.upsert_node(&node).unwrap();

        assert_eq!(storage.list_nodes().unwrap(), vec![node]);
    }

    #[rstest]
    fn factory_connections_see_the_same_database(storage: DuckDBStorage) {
        let token = fake_address();
        let factory = storage.factory().unwrap();
        storage.insert_listing(&listing_for(token, true)).unwrap();

        let reader = factory.create().unwrap();

        assert!(reader.is_listed(&token).unwrap());
    }
}
