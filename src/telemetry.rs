// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{filter::Targets, fmt, prelude::*};

/// Maps the verbosity flag of the CLI to a tracing level.
pub fn tracing_level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

pub fn setup_tracing(verbosity: u8) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_line_number(false))
        .with(Targets::new().with_target("ibet_indexer", tracing_level(verbosity)))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case::quiet(0, Level::WARN)]
    #[case::default(1, Level::INFO)]
    #[case::debug(2, Level::DEBUG)]
    #[case::trace(3, Level::TRACE)]
    #[case::saturated(9, Level::TRACE)]
    fn verbosity_selects_the_level(#[case] verbosity: u8, #[case] expected: Level) {
        assert_eq!(tracing_level(verbosity), expected);
    }
}
