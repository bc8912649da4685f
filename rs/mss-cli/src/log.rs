//! A small local stand-in for the teacher's `moq_native::Log` arg group.
//! `mss-cli` doesn't depend on `moq-native` (see DESIGN.md), so this
//! reproduces just the `--log-level` flag and `tracing-subscriber`
//! initialization in the same shape.

use clap::Args;
use tracing_subscriber::EnvFilter;

#[derive(Args, Clone)]
pub struct LogArgs {
    /// Log level, e.g. "error", "warn", "info", "debug", "trace".
    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,
}

impl LogArgs {
    pub fn init(&self) {
        let filter = EnvFilter::builder()
            .with_default_directive(self.log_level.into())
            .from_env_lossy();

        tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }
}
