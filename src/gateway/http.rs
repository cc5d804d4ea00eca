use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::RpcGateway;
use crate::error::{Error, Result};

/// Gateway that posts JSON to `<base>/rpc/<name>`.
///
/// Request body: `{"args": [...]}`. A 2xx reply carries the result as JSON;
/// anything else is a transient remote failure.
#[derive(Clone)]
pub struct HttpGateway {
  client: reqwest::Client,
  base: Url,
}

impl HttpGateway {
  pub fn new(base_url: &str) -> Result<Self> {
    let mut base = Url::parse(base_url)
      .map_err(|e| Error::Validation(format!("invalid gateway url `{}`: {}", base_url, e)))?;
    // Keep the last path segment when joining
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }

    Ok(Self {
      client: reqwest::Client::new(),
      base,
    })
  }

  fn endpoint(&self, name: &str) -> Result<Url> {
    self
      .base
      .join(&format!("rpc/{}", name))
      .map_err(|e| Error::Validation(format!("invalid operation name `{}`: {}", name, e)))
  }
}

#[async_trait]
impl RpcGateway for HttpGateway {
  async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
    let url = self.endpoint(name)?;
    debug!(%url, "remote call");

    let response = self
      .client
      .post(url)
      .json(&json!({ "args": args }))
      .send()
      .await
      .map_err(|e| Error::remote(name, e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(Error::remote(name, format!("HTTP {}: {}", status, body)));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| Error::remote(name, e.to_string()))?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| Error::remote(name, format!("bad reply: {}", e)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_keeps_base_path() {
    let gateway = HttpGateway::new("https://example.com/macros/exec").unwrap();
    assert_eq!(
      gateway.endpoint("ping").unwrap().as_str(),
      "https://example.com/macros/exec/rpc/ping"
    );
  }

  #[test]
  fn test_rejects_invalid_url() {
    assert!(matches!(
      HttpGateway::new("not a url"),
      Err(Error::Validation(_))
    ));
  }
}
