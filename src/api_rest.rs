// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! REST API over the index tables.
//!
//! # Description
//!
//! Successful responses are wrapped as `{"meta": {"code": 200, "message": "OK"}, "data": ...}` and list endpoints
//! return `{"result_set": {...}, "<rows>": [...]}` as data. Errors carry the status and code of the
//! [IndexerError] found in the error chain: `{"meta": {"code", "message", "description"}}`.

use crate::{
    CancellationToken, IndexerError,
    chain::ChainClient,
    registry::ContractRegistry,
    storage::{
        AgreementStatus, DuckDBStorage, DuckDBStorageFactory, Listing, NotificationType, Page,
        PageRequest, SortOrder, Storage, StorageQuery,
        storage_query::{
            AgreementFilter, ListingFilter, NotificationFilter, OrderBookQuery, OrderFilter,
            OrderType, TransferApprovalFilter,
        },
    },
};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Query, State, rejection::JsonRejection, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{net::SocketAddr, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared state of the handlers.
#[derive(Clone)]
pub struct ApiState {
    pub storage: Arc<DuckDBStorageFactory>,
    pub registry: Arc<dyn ContractRegistry>,
    pub chain: Arc<dyn ChainClient>,
}

impl ApiState {
    /// Opens a new connection for the request.
    fn storage(&self) -> Result<DuckDBStorage> {
        self.storage
            .create()
            .context("Failed to create database connection")
    }
}

#[derive(Serialize)]
pub struct Meta {
    pub code: u16,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Serialize)]
pub struct SuccessResponse<T> {
    pub meta: Meta,
    pub data: T,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub meta: Meta,
}

/// Error returned by the handlers, rendered with the status and code of the [IndexerError] it carries.
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(error: E) -> Self {
        Self(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, meta) = match IndexerError::find(&self.0) {
            Some(e) => (
                e.status_code(),
                Meta {
                    code: e.error_code(),
                    message: e.title(),
                    description: Some(e.description()),
                },
            ),
            None => {
                error!("API request failed: {:#}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Meta {
                        code: 1,
                        message: "Internal Server Error",
                        description: Some(self.0.to_string()),
                    },
                )
            }
        };

        (status, Json(ErrorResponse { meta })).into_response()
    }
}

type ApiResult<T> = Result<Json<SuccessResponse<T>>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(SuccessResponse {
        meta: Meta {
            code: 200,
            message: "OK",
            description: None,
        },
        data,
    }))
}

/// Lays out a page as `{"result_set": ..., "<rows_key>": [...]}`.
fn page_data<T: Serialize>(page: Page<T>, rows_key: &str) -> Result<Value> {
    let mut data = Map::new();
    data.insert("result_set".to_string(), serde_json::to_value(page.result_set)?);
    data.insert(rows_key.to_string(), serde_json::to_value(page.rows)?);
    Ok(Value::Object(data))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(params)| params)
        .map_err(|e| IndexerError::InvalidParameter(e.body_text()).into())
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(payload)| payload)
        .map_err(|e| IndexerError::InvalidParameter(e.body_text()).into())
}

fn page_request(
    offset: Option<u64>,
    limit: Option<u64>,
    sort_item: Option<String>,
    sort_order: Option<SortOrder>,
) -> PageRequest {
    PageRequest {
        offset,
        limit,
        sort_item,
        sort_order: sort_order.unwrap_or_default(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListingsParams {
    pub token_address: Option<Address>,
    pub owner_address: Option<Address>,
    pub is_public: Option<bool>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub sort_item: Option<String>,
    pub sort_order: Option<SortOrder>,
}

async fn list_listings_handler(
    State(state): State<ApiState>,
    params: Result<Query<ListingsParams>, QueryRejection>,
) -> ApiResult<Value> {
    let params = query_params(params)?;
    let filter = ListingFilter {
        token_address: params.token_address,
        owner_address: params.owner_address,
        is_public: params.is_public,
    };
    let page = page_request(params.offset, params.limit, params.sort_item, params.sort_order);

    let listings = state.storage()?.list_listings(&filter, &page)?;
    ok(page_data(listings, "tokens")?)
}

#[derive(Debug, Deserialize)]
pub struct PagingParams {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub sort_item: Option<String>,
    pub sort_order: Option<SortOrder>,
}

async fn list_executable_contracts_handler(
    State(state): State<ApiState>,
    params: Result<Query<PagingParams>, QueryRejection>,
) -> ApiResult<Value> {
    let params = query_params(params)?;
    let page = page_request(params.offset, params.limit, params.sort_item, params.sort_order);

    let contracts = state.storage()?.list_executable_contracts(&page)?;
    ok(page_data(contracts, "contracts")?)
}

#[derive(Debug, Deserialize)]
pub struct NotificationsParams {
    pub address: Option<Address>,
    pub notification_type: Option<NotificationType>,
    pub priority: Option<u8>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub sort_item: Option<String>,
    pub sort_order: Option<SortOrder>,
}

async fn list_notifications_handler(
    State(state): State<ApiState>,
    params: Result<Query<NotificationsParams>, QueryRejection>,
) -> ApiResult<Value> {
    let params = query_params(params)?;
    let filter = NotificationFilter {
        address: params.address,
        notification_type: params.notification_type,
        priority: params.priority,
    };
    let page = page_request(params.offset, params.limit, params.sort_item, params.sort_order);

    let notifications = state.storage()?.list_notifications(&filter, &page)?;
    ok(page_data(notifications, "notifications")?)
}

#[derive(Debug, Deserialize)]
pub struct OrderBookParams {
    pub exchange_address: Option<Address>,
    pub token_address: Address,
    pub order_type: OrderType,
    pub account_address: Option<Address>,
    pub agent_address: Option<Address>,
}

async fn order_book_handler(
    State(state): State<ApiState>,
    params: Result<Query<OrderBookParams>, QueryRejection>,
) -> ApiResult<Value> {
    let params = query_params(params)?;
    let query = OrderBookQuery {
        exchange_address: params.exchange_address,
        token_address: params.token_address,
        order_type: params.order_type,
        account_address: params.account_address,
        agent_address: params.agent_address,
    };

    let entries = state.storage()?.order_book(&query)?;
    ok(serde_json::to_value(entries)?)
}

#[derive(Debug, Deserialize)]
pub struct OrdersParams {
    pub exchange_address: Option<Address>,
    pub token_address: Option<Address>,
    pub account_address: Option<Address>,
    pub is_buy: Option<bool>,
    pub is_cancelled: Option<bool>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub sort_item: Option<String>,
    pub sort_order: Option<SortOrder>,
}

async fn list_orders_handler(
    State(state): State<ApiState>,
    params: Result<Query<OrdersParams>, QueryRejection>,
) -> ApiResult<Value> {
    let params = query_params(params)?;
    let filter = OrderFilter {
        exchange_address: params.exchange_address,
        token_address: params.token_address,
        account_address: params.account_address,
        is_buy: params.is_buy,
        is_cancelled: params.is_cancelled,
    };
    let page = page_request(params.offset, params.limit, params.sort_item, params.sort_order);

    let orders = state.storage()?.list_orders(&filter, &page)?;
    ok(page_data(orders, "orders")?)
}

#[derive(Debug, Deserialize)]
pub struct AgreementsParams {
    pub exchange_address: Option<Address>,
    pub order_id: Option<i64>,
    pub buyer_address: Option<Address>,
    pub seller_address: Option<Address>,
    pub status: Option<AgreementStatus>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub sort_item: Option<String>,
    pub sort_order: Option<SortOrder>,
}

async fn list_agreements_handler(
    State(state): State<ApiState>,
    params: Result<Query<AgreementsParams>, QueryRejection>,
) -> ApiResult<Value> {
    let params = query_params(params)?;
    let filter = AgreementFilter {
        exchange_address: params.exchange_address,
        order_id: params.order_id,
        buyer_address: params.buyer_address,
        seller_address: params.seller_address,
        status: params.status,
    };
    let page = page_request(params.offset, params.limit, params.sort_item, params.sort_order);

    let agreements = state.storage()?.list_agreements(&filter, &page)?;
    ok(page_data(agreements, "agreements")?)
}

#[derive(Debug, Deserialize)]
pub struct TransferApprovalsParams {
    pub token_address: Option<Address>,
    pub from_address: Option<Address>,
    pub to_address: Option<Address>,
    pub cancelled: Option<bool>,
    pub transfer_approved: Option<bool>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub sort_item: Option<String>,
    pub sort_order: Option<SortOrder>,
}

async fn list_transfer_approvals_handler(
    State(state): State<ApiState>,
    params: Result<Query<TransferApprovalsParams>, QueryRejection>,
) -> ApiResult<Value> {
    let params = query_params(params)?;
    let filter = TransferApprovalFilter {
        token_address: params.token_address,
        from_address: params.from_address,
        to_address: params.to_address,
        cancelled: params.cancelled,
        transfer_approved: params.transfer_approved,
    };
    let page = page_request(params.offset, params.limit, params.sort_item, params.sort_order);

    let approvals = state.storage()?.list_transfer_approvals(&filter, &page)?;
    ok(page_data(approvals, "transfer_approval_history")?)
}

#[derive(Debug, Deserialize)]
pub struct RegisterTokenRequest {
    pub contract_address: Address,
    pub is_public: bool,
    pub max_holding_quantity: Option<i64>,
    pub max_sell_amount: Option<i64>,
    /// Answer with success when the token is already registered.
    #[serde(default)]
    pub skip_conflict_error: bool,
}

/// Lists a token and allows relaying transactions to it.
async fn register_token_handler(
    State(state): State<ApiState>,
    body: Result<Json<RegisterTokenRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let request = json_body(body)?;
    let contract_address = request.contract_address;
    for quantity in [request.max_holding_quantity, request.max_sell_amount].into_iter().flatten() {
        if quantity < 0 {
            return Err(IndexerError::InvalidParameter(
                "max_holding_quantity and max_sell_amount must not be negative".to_string(),
            )
            .into());
        }
    }

    let storage = state.storage()?;
    if storage.is_listed(&contract_address)? || storage.is_executable(&contract_address)? {
        if request.skip_conflict_error {
            return ok(Value::Object(Map::new()));
        }
        return Err(
            IndexerError::DataConflict("contract_address already exist".to_string()).into(),
        );
    }

    if state
        .registry
        .resolve_token_type(contract_address)
        .await?
        .is_none()
    {
        return Err(IndexerError::InvalidParameter(
            "contract_address is invalid token address".to_string(),
        )
        .into());
    }
    let owner_address = state.registry.token_owner(contract_address).await?;

    let registered = storage.register_token(&Listing {
        id: None,
        token_address: contract_address,
        is_public: request.is_public,
        max_holding_quantity: request.max_holding_quantity,
        max_sell_amount: request.max_sell_amount,
        owner_address,
    });
    match registered {
        Ok(_) => info!("Token {contract_address} registered"),
        // Registered by a concurrent request since the check above.
        Err(e)
            if request.skip_conflict_error
                && matches!(IndexerError::find(&e), Some(IndexerError::DataConflict(_))) =>
        {
            return ok(Value::Object(Map::new()));
        }
        Err(e) => return Err(e.into()),
    }

    ok(Value::Object(Map::new()))
}

#[derive(Debug, Deserialize)]
pub struct RegisterExecutableContractRequest {
    pub contract_address: Address,
}

async fn register_executable_contract_handler(
    State(state): State<ApiState>,
    body: Result<Json<RegisterExecutableContractRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let request = json_body(body)?;

    let contract = state
        .storage()?
        .insert_executable_contract(&request.contract_address)?;
    ok(serde_json::to_value(contract)?)
}

#[derive(Debug, Serialize)]
pub struct BlockSyncStatus {
    pub is_synced: bool,
    pub latest_block_number: Option<u64>,
}

async fn block_sync_status_handler(State(state): State<ApiState>) -> ApiResult<BlockSyncStatus> {
    let is_synced = state
        .storage()?
        .list_nodes()?
        .iter()
        .any(|node| node.is_synced);
    if !is_synced {
        return ok(BlockSyncStatus {
            is_synced: false,
            latest_block_number: None,
        });
    }

    let latest_block_number = state.chain.current_block_number().await.map_err(|e| {
        error!("Failed to read the latest block: {e:#}");
        IndexerError::ServiceUnavailable("Temporarily unable to connect to web3 provider".to_string())
    })?;

    ok(BlockSyncStatus {
        is_synced: true,
        latest_block_number: Some(latest_block_number),
    })
}

/// Creates and returns the REST API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/Listings", get(list_listings_handler))
        .route("/ExecutableContracts", get(list_executable_contracts_handler))
        .route("/Notifications", get(list_notifications_handler))
        .route("/OrderBook", get(order_book_handler))
        .route("/Orders", get(list_orders_handler))
        .route("/Agreements", get(list_agreements_handler))
        .route("/TransferApprovals", get(list_transfer_approvals_handler))
        .route("/Admin/Tokens", post(register_token_handler))
        .route(
            "/Admin/ExecutableContracts",
            post(register_executable_contract_handler),
        )
        .route("/NodeInfo/BlockSyncStatus", get(block_sync_status_handler))
        .with_state(state)
}

/// Starts the REST API server in a separate task.
pub async fn start_api_server(
    server_address: &str,
    state: ApiState,
    cancellation_token: CancellationToken,
) -> Result<JoinHandle<()>> {
    let addr: SocketAddr = server_address
        .parse()
        .with_context(|| format!("Invalid API server address {server_address}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API server to {addr}"))?;
    info!("REST API server listening on {}", listener.local_addr()?);

    let app = create_router(state);
    let mut shutdown = cancellation_token.subscribe();
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("API server shutdown signal received");
            })
            .await
        {
            error!("API server error: {e}");
        }
    });

    Ok(handle)
}
