//! The remote call boundary.
//!
//! The core only relies on the success/failure shape of remote calls: every
//! operation is `(name, args) -> Result<Value>`. There is no timeout, batching
//! or ordering guarantee; resilience is layered on top by the caller.

mod http;

pub use http::HttpGateway;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Asynchronous call-by-name gateway to the remote backend.
#[async_trait]
pub trait RpcGateway: Send + Sync {
  /// Invoke remote operation `name` with positional `args`.
  async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value>;
}

/// Names of the remote operations the core itself relies on.
pub mod ops {
  /// No-op reachability probe
  pub const PING: &str = "ping";
  pub const SYNC_OFFLINE_CHANGE: &str = "syncOfflineChange";
  pub const REPORT_ERROR: &str = "reportError";
  /// Remote self-check, replies `{isValid, issues}`
  pub const VALIDATE_DATA_INTEGRITY: &str = "validateDataIntegrity";

  pub const GET_SERVER_TIMESTAMP: &str = "getServerTimestamp";
  pub const GET_SERVER_VERSION: &str = "getServerVersion";
  pub const GET_ACTIVE_EDITORS: &str = "getActiveEditors";

  pub const FORCE_UPDATE_WITH_LOCAL_DATA: &str = "forceUpdateWithLocalData";
  pub const GET_LATEST_SERVER_DATA: &str = "getLatestServerData";
  pub const SAVE_MERGED_DATA: &str = "saveMergedData";

  /// Plain (conflict-free) write of an entity
  pub const SAVE_ENTITY: &str = "saveEntity";
}
