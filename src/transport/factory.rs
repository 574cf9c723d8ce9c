//! Constructs a `Transport` from a `kind` tag.
//!
//! The registry is the only caller: on `Add` it builds a transport here and
//! hands the same `Arc` to the connection pool, so the factory is the one
//! place kind dispatch happens rather than spread across call sites.

use std::sync::Arc;

use super::ssh::SshTransport;
use super::{Kind, Transport, WorkerConfig};

/// Builds the `Transport` implementation for a worker `kind`.
///
/// All three kinds share the same SSH/SFTP dialect underneath — only the
/// probe commands differ, and those live on `Kind` itself (see `transport::mod`).
/// A future non-SSH kind would branch here instead of growing a subclass tree.
pub fn create(name: impl Into<String>, kind: Kind, config: WorkerConfig) -> Arc<dyn Transport> {
    Arc::new(SshTransport::new(name, kind, config))
}
