// Copyright 2024 The Bootlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod fs;
pub mod retry;
pub mod task;

// Re-export tracing mostly for use in macros.
pub use tracing as __tracing;

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "BOOTLINK_LOG";

/// Initialize tracing.
///
/// The filter is read from `RUST_LOG` (default `warn`). The output format is
/// read from `BOOTLINK_LOG`: `pretty` (default), `compact` or `json`.
pub fn init_tracing() -> Result<(), bootlink_error::Error> {
    static LOGGING_INITIALIZED: std::sync::Mutex<bool> = std::sync::Mutex::new(false);
    let mut logging_initialized_guard = LOGGING_INITIALIZED.lock().map_err(|e| {
        bootlink_error::make_err!(
            bootlink_error::Code::Internal,
            "Logging lock poisoned: {e}"
        )
    })?;
    if *logging_initialized_guard {
        return Err(bootlink_error::make_err!(
            bootlink_error::Code::Internal,
            "Logging already initialized"
        ));
    }
    *logging_initialized_guard = true;
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::WARN.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::time())
        .with_env_filter(env_filter);
    match std::env::var(LOG_FORMAT_ENV).as_deref() {
        Ok("json") => builder.json().init(),
        Ok("compact") => builder.compact().init(),
        _ => builder.pretty().init(),
    }
    Ok(())
}
