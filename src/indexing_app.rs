// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

use crate::{
    CancellationToken,
    api_rest::{ApiState, start_api_server},
    chain::{ChainClient, FailoverChainClient, NodeHealthMonitor, NodePool, RpcChainClient, redact_endpoint},
    configuration::IndexerConfiguration,
    engine::{SyncEngine, SyncJob, run_job},
    error_codes,
    indexer::{OrderAgreementIndexer, TransferApprovalIndexer},
    metrics::MetricsHandle,
    registry::{CompanyDirectory, CompanyList, ContractRegistry, OnChainRegistry},
    storage::{DuckDBStorage, DuckDBStorageFactory, Node, Storage},
    watcher::{WatcherContext, WatcherFactory},
};
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use std::{collections::HashSet, sync::Arc};
use tokio::{signal::ctrl_c, task::JoinHandle};
use tracing::{error, info, warn};

pub struct IndexingApp {
    pub config: IndexerConfiguration,
    pub storage: Arc<DuckDBStorage>,
    pub storage_for_api: Arc<DuckDBStorageFactory>,
    pub chain: Arc<FailoverChainClient>,
    pub registry: Arc<dyn ContractRegistry>,
    pub metrics: MetricsHandle,
    pub cancellation_token: CancellationToken,
    pub jobs: Vec<Box<dyn SyncJob>>,
}

impl IndexingApp {
    /// Builds a new instance of the indexing app using the configuration.
    pub async fn build_app(config: IndexerConfiguration) -> Result<Self> {
        let cancellation_token = CancellationToken::default();

        // Instantiate the DB handlers, for the sync jobs and the API server.
        let storage = match DuckDBStorage::with_db(&config.database_path) {
            Ok(storage) => Arc::new(storage),
            Err(e) => {
                error!("{e:#}");
                std::process::exit(error_codes::ERROR_CODE_DATABASE_LOCKED);
            }
        };
        let storage_for_api = Arc::new(storage.factory()?);

        let metrics = MetricsHandle::new(&config.metrics)?;

        let mut nodes = Vec::with_capacity(config.nodes.len());
        for (position, node_config) in config.nodes.iter().enumerate() {
            let endpoint = node_config.endpoint_uri.expose_secret();
            let node = Node {
                id: position as i64 + 1,
                endpoint_uri: redact_endpoint(endpoint),
                priority: node_config.priority,
                is_synced: true,
            };
            storage.upsert_node(&node)?;
            let client: Arc<dyn ChainClient> = Arc::new(RpcChainClient::connect(endpoint, config.rpc_timeout)?);
            nodes.push((node, client));
        }
        let chain = Arc::new(FailoverChainClient::new(
            Arc::new(NodePool::new(nodes)),
            config.rpc_retry,
        ));

        let registry: Arc<dyn ContractRegistry> =
            Arc::new(OnChainRegistry::new(chain.clone(), config.token_list_address));

        let companies = match &config.company_list {
            Some(source) => match source.load().await {
                Ok(companies) => {
                    info!("{} companies loaded", companies.len());
                    companies
                }
                Err(e) => {
                    warn!("Failed to load the company list, issuer names will be empty: {e:#}");
                    CompanyList::default()
                }
            },
            None => CompanyList::default(),
        };

        let jobs = build_jobs(
            &config,
            chain.clone(),
            storage.clone(),
            registry.clone(),
            Arc::new(companies),
            &metrics,
        )?;
        info!("{} sync jobs configured", jobs.len());

        Ok(Self {
            config,
            storage,
            storage_for_api,
            chain,
            registry,
            metrics,
            cancellation_token,
            jobs,
        })
    }

    /// Runs the indexing app.
    ///
    /// # Description
    ///
    /// Every sync job runs in its own task. The node health monitor, the REST API and the metrics server run
    /// next to them until Ctrl+C is received.
    pub async fn run(self) -> Result<()> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        if !self.config.disable_api {
            let api_server_address = format!(
                "{}:{}",
                self.config.api_server_address, self.config.api_server_port
            );
            let state = ApiState {
                storage: self.storage_for_api.clone(),
                registry: self.registry.clone(),
                chain: self.chain.clone(),
            };
            let handle = start_api_server(&api_server_address, state, self.cancellation_token.clone())
                .await
                .context("Failure in the REST API server")?;
            handles.push(handle);
        }

        if let Some(handle) = self
            .metrics
            .serve(self.config.metrics.clone(), self.cancellation_token.clone())
            .await
            .context("Failure in the metrics server")?
        {
            handles.push(handle);
        }

        let monitor = NodeHealthMonitor::new(
            self.chain.pool().clone(),
            self.storage.clone(),
            self.config.sync_thresholds,
        )
        .with_metrics(self.metrics.clone());
        handles.push(tokio::spawn(
            monitor.run(self.config.node_monitor_interval, self.cancellation_token.clone()),
        ));

        info!("Starting the sync jobs");
        for job in self.jobs {
            handles.push(tokio::spawn(run_job(
                job,
                self.config.poll_interval,
                self.cancellation_token.clone(),
            )));
        }

        let ctrl_c_task = IndexingApp::spawn_ctrl_c_handler(self.cancellation_token.clone());
        ctrl_c_task.await?;

        for handle in handles {
            let _ = handle.await;
        }

        info!("Shutdown complete");

        Ok(())
    }

    fn spawn_ctrl_c_handler(cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            ctrl_c().await.ok();
            warn!("Received Ctrl+C, shutting down gracefully...");
            cancellation_token.graceful_shutdown();
        })
    }
}

/// Builds the index and notification jobs of the enabled templates.
pub fn build_jobs(
    config: &IndexerConfiguration,
    chain: Arc<dyn ChainClient>,
    storage: Arc<dyn Storage>,
    registry: Arc<dyn ContractRegistry>,
    companies: Arc<dyn CompanyDirectory>,
    metrics: &MetricsHandle,
) -> Result<Vec<Box<dyn SyncJob>>> {
    let mut jobs: Vec<Box<dyn SyncJob>> = Vec::new();
    let exchanges = config.exchange_addresses();

    if !exchanges.is_empty() {
        let engine = SyncEngine::new(
            OrderAgreementIndexer::new(exchanges.clone()),
            chain.clone(),
            storage.clone(),
            config.engine,
        )?
        .with_metrics(metrics.clone());
        jobs.push(Box::new(engine));
    }

    if config
        .templates
        .iter()
        .any(|template| template.template.supports_transfer_approval())
    {
        let engine = SyncEngine::new(
            TransferApprovalIndexer::new(registry.clone()),
            chain.clone(),
            storage.clone(),
            config.engine,
        )?
        .with_metrics(metrics.clone());
        jobs.push(Box::new(engine));
    }

    let factory = WatcherFactory {
        chain,
        storage,
        options: config.engine,
        metrics: metrics.clone(),
        context: WatcherContext {
            registry,
            companies,
            exchanges: Arc::new(exchanges.into_iter().collect::<HashSet<_>>()),
        },
    };
    for template in &config.templates {
        if config.token_notifications {
            jobs.extend(factory.token_watchers(template.template)?);
        }
        if config.exchange_notifications
            && let Some(exchange) = template.exchange_address
        {
            jobs.extend(factory.exchange_watchers(template.template, exchange)?);
        }
    }

    Ok(jobs)
}
