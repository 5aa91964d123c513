// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

use ibet_indexer::{
    IndexingApp, configuration::IndexerConfiguration, error_codes, telemetry::setup_tracing,
};
use tracing::error;

#[tokio::main]
async fn main() {
    let config = IndexerConfiguration::parse();

    if let Err(e) = setup_tracing(config.verbosity) {
        eprintln!("Failed to set up tracing: {e:#}");
    }

    let result = match IndexingApp::build_app(config).await {
        Ok(app) => app.run().await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("Indexer failure: {e:#}");
        std::process::exit(error_codes::ERROR_CODE_INDEXER_FAILURE);
    }
}
