//! Logger configuration.
//!
//! Interactive runs get column-aligned, color-coded lines. Trace summaries
//! emitted under the `wicket::trace` target are written as bare JSON lines
//! with no decoration so a log shipper can consume them unmodified.
//! Filtering follows `RUST_LOG` (default `debug`); `NO_COLOR` disables ANSI
//! styling.

use env_logger::{Builder, Env};
use log::Level;
use std::env;
use std::io::Write;

/// Target whose records bypass the column format.
const TRACE_TARGET: &str = "wicket::trace";

/// ANSI foreground code for a level.
fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31m",
        Level::Warn => "\x1b[33m",
        Level::Info => "\x1b[32m",
        Level::Debug => "\x1b[34m",
        Level::Trace => "\x1b[35m",
    }
}

/// Configure and initialize the process-wide logger.
///
/// Call once during startup. Output format:
///
/// ```text
/// 2026-03-15 14:30:45.012 INFO  main.rs:42               gateway listening on 0.0.0.0:5900
/// ```
pub fn configure_logger() {
    let color = env::var_os("NO_COLOR").is_none();

    Builder::from_env(Env::default().default_filter_or("debug"))
        .format(move |buf, record| {
            // Trace summaries are machine-readable; pass them through bare.
            if record.target() == TRACE_TARGET {
                return writeln!(buf, "{}", record.args());
            }

            // Columns are padded before any styling is applied, so escape
            // sequences never count against the column widths.
            let level = format!("{:<5}", record.level());
            let origin = format!(
                "{}:{}",
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0)
            );
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

            if color {
                writeln!(
                    buf,
                    "{timestamp} {}{level}\x1b[0m {origin:<24} {}",
                    level_color(record.level()),
                    record.args()
                )
            } else {
                writeln!(buf, "{timestamp} {level} {origin:<24} {}", record.args())
            }
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn each_level_gets_its_own_color() {
        let colors: HashSet<&str> = [
            Level::Error,
            Level::Warn,
            Level::Info,
            Level::Debug,
            Level::Trace,
        ]
        .into_iter()
        .map(level_color)
        .collect();

        assert_eq!(colors.len(), 5);
    }
}
