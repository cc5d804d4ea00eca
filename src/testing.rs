//! Scripted gateway used by unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::gateway::RpcGateway;

type Handler = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

#[derive(Default)]
pub struct FakeGateway {
  handlers: Mutex<HashMap<String, Handler>>,
  calls: Mutex<Vec<(String, Vec<Value>)>>,
  down: AtomicBool,
}

impl FakeGateway {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Answer `name` with `handler`.
  pub fn on<F>(&self, name: &str, handler: F)
  where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
  {
    self
      .handlers
      .lock()
      .unwrap()
      .insert(name.to_string(), Arc::new(handler));
  }

  /// Answer `name` with a fixed value.
  pub fn reply(&self, name: &str, value: Value) {
    self.on(name, move |_| Ok(value.clone()));
  }

  /// Fail every call regardless of handlers.
  pub fn set_down(&self, down: bool) {
    self.down.store(down, Ordering::SeqCst);
  }

  pub fn calls(&self, name: &str) -> Vec<Vec<Value>> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(n, _)| n == name)
      .map(|(_, args)| args.clone())
      .collect()
  }

  pub fn call_count(&self, name: &str) -> usize {
    self.calls(name).len()
  }
}

#[async_trait]
impl RpcGateway for FakeGateway {
  async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
    self
      .calls
      .lock()
      .unwrap()
      .push((name.to_string(), args.clone()));

    if self.down.load(Ordering::SeqCst) {
      return Err(Error::remote(name, "network error"));
    }

    let handler = self.handlers.lock().unwrap().get(name).cloned();
    match handler {
      Some(handler) => handler(&args),
      None => Err(Error::remote(name, "no handler")),
    }
  }
}
