//! provides logging helpers

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// `RUST_LOG` overrides the default level, which is `debug` when `debug` is
/// set and `info` otherwise. `pretty` selects human readable output,
/// JSON lines otherwise. Logs go to stderr through a non-blocking writer;
/// keep the returned guard alive until exit so buffered lines are flushed.
pub fn init(debug: bool, pretty: bool) -> WorkerGuard {
    let default_level = if debug {
        filter::LevelFilter::DEBUG
    } else {
        filter::LevelFilter::INFO
    };
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    if pretty {
        let fmt_layer = layer()
            .with_writer(writer)
            .with_target(true)
            .with_filter(env_filter);
        registry().with(fmt_layer).init();
    } else {
        let fmt_layer = layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_current_span(false)
            .with_filter(env_filter);
        registry().with(fmt_layer).init();
    }

    guard
}
