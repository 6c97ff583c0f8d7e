// SPDX-License-Identifier: PolyForm-Shield-1.0

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directive used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global tracing subscriber: human-readable `fmt` output
/// filtered by `RUST_LOG`, falling back to [`DEFAULT_DIRECTIVE`].
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_DIRECTIVE);
}

/// Like [`init_tracing`] with an explicit fallback directive, e.g.
/// `"neuron=debug,info"` for a `--verbose` flag.
pub fn init_tracing_with(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
