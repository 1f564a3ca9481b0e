//! Logger handed to the raft-rs engine.

use slog::{o, Drain};

use crate::config::LogFormat;

// Size of logger channel buffer
const LOGGER_CHANNEL_SIZE: usize = 4096;

/// Builds the engine logger for node `id`.
///
/// `StdLog` forwards engine records into the `log` facade so they end up in
/// the same output as the rest of the node. `Term` writes them to the
/// terminal from a dedicated async drain.
pub fn raft_logger(format: LogFormat, id: u64) -> slog::Logger {
    let root = match format {
        LogFormat::StdLog => slog::Logger::root(slog_stdlog::StdLog.fuse(), o!()),
        LogFormat::Term => {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain)
                .chan_size(LOGGER_CHANNEL_SIZE)
                .overflow_strategy(slog_async::OverflowStrategy::Block)
                .build()
                .fuse();
            slog::Logger::root(drain, o!())
        }
    };
    root.new(o!("tag" => format!("peer_{}", id)))
}
