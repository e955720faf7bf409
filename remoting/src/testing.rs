//! Helpers for testing the remoting crate.
//!
//! This module is only compiled when `test` is enabled.  Integration tests include it with
//! `#[path]`, so nothing in here may refer to `crate::`.
#![allow(dead_code)]

use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

/// Initialize tracing with a subscriber and some reasonable defaults suitable for enabling log
/// output in tests.
///
/// This is idempotent; it can be called from multiple tests in multiple threads but will only
/// initialize tracing once.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "remoting=debug";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        let _ = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
            .with_test_writer()
            .try_init();
    });
}

/// Two ends of an in-memory byte pipe, each framed with a clone of `codec`.
pub fn setup_test_channel<C: Clone>(codec: C) -> (Framed<DuplexStream, C>, Framed<DuplexStream, C>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (Framed::new(client, codec.clone()), Framed::new(server, codec))
}
