// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::errors::{Result, ResultExt};

/// Environment variable controlling the log verbosity,
/// one of `error`, `warn`, `info`, `debug`, `trace`.
pub const LOG_LEVEL_ENV: &str = "RVSIM_LOG_LEVEL";

struct StderrLogger {
    level: Level,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = writeln!(
            std::io::stderr().lock(),
            "{}: [{}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn env_level() -> Level {
    match std::env::var(LOG_LEVEL_ENV).as_ref().map(|s| s.as_str()) {
        Ok("error") => Level::Error,
        Ok("warn") => Level::Warn,
        Ok("debug") => Level::Debug,
        Ok("trace") => Level::Trace,
        _ => Level::Info,
    }
}

/// Install the stderr logger as the process-global logger.
/// Calling it twice returns an error, as the log facade allows
/// only one logger per process.
pub fn init_default_logger() -> Result<()> {
    let level = env_level();
    log::set_boxed_logger(Box::new(StderrLogger { level }))
        .chain_err(|| crate::errors::ErrorKind::SetLoggerErr)?;
    log::set_max_level(LevelFilter::max());
    Ok(())
}
