// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{Drain, Logger, o};

/// Creates a terminal logger for the test named `test_name`
///
/// Set `SPARING_TEST_LOG=debug` to see more than warnings.
pub fn test_setup_log(test_name: &str) -> Logger {
    let level = match std::env::var("SPARING_TEST_LOG").as_deref() {
        Ok("trace") => slog::Level::Trace,
        Ok("debug") => slog::Level::Debug,
        Ok("info") => slog::Level::Info,
        _ => slog::Level::Warning,
    };
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("test" => test_name.to_string()))
}
