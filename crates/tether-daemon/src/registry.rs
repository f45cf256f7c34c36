//! Typed registry of the methods a daemon exposes.
//!
//! Methods are addressed by `(server_file, method_name)`. Each handler is an
//! async function from a deserializable input to a serializable output; the
//! registry erases those types behind JSON so the HTTP surface can dispatch
//! without knowing them.

use crate::{DaemonError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

type ErasedMethod = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Methods keyed by server file, then by method name.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    files: BTreeMap<String, BTreeMap<String, ErasedMethod>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as `server_file.method_name`.
    ///
    /// The input is deserialized from the request's `data`; a mismatch is
    /// reported as [`DaemonError::InvalidInput`] without calling the handler.
    pub fn register<I, O, F, Fut>(
        &mut self,
        server_file: impl Into<String>,
        method_name: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let server_file = server_file.into();
        let method_name = method_name.into();

        let methods = self.files.entry(server_file.clone()).or_default();
        if methods.contains_key(&method_name) {
            return Err(DaemonError::DuplicateMethod {
                server_file,
                method: method_name,
            });
        }

        let erased: ErasedMethod = Arc::new(move |data: Value| {
            let call = serde_json::from_value::<I>(data).map(&handler);
            async move {
                let output = call
                    .map_err(|e| DaemonError::InvalidInput {
                        message: e.to_string(),
                    })?
                    .await
                    .map_err(|e| DaemonError::Method {
                        message: format!("{:#}", e),
                    })?;
                Ok(serde_json::to_value(output)?)
            }
            .boxed()
        });
        methods.insert(method_name, erased);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_method<I, O, F, Fut>(
        mut self,
        server_file: impl Into<String>,
        method_name: impl Into<String>,
        handler: F,
    ) -> Result<Self>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        self.register(server_file, method_name, handler)?;
        Ok(self)
    }

    /// Reject a registry a daemon could never serve anything from.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(DaemonError::EmptyRegistry);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every method as `server_file.method_name`, sorted.
    pub fn method_names(&self) -> Vec<String> {
        self.files
            .iter()
            .flat_map(|(file, methods)| methods.keys().map(move |name| format!("{}.{}", file, name)))
            .collect()
    }

    /// Run one method. A panic inside the handler becomes a
    /// [`DaemonError::Method`] for this call only.
    pub async fn call(&self, server_file: &str, method_name: &str, data: Value) -> Result<Value> {
        let methods = self
            .files
            .get(server_file)
            .ok_or_else(|| DaemonError::UnknownFile {
                server_file: server_file.to_string(),
            })?;
        let method = methods
            .get(method_name)
            .ok_or_else(|| DaemonError::UnknownMethod {
                server_file: server_file.to_string(),
                method: method_name.to_string(),
            })?
            .clone();

        match AssertUnwindSafe(async move { method(data).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(DaemonError::Method {
                message: format!(
                    "{}.{} panicked: {}",
                    server_file,
                    method_name,
                    panic_message(panic.as_ref())
                ),
            }),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.method_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    async fn add(input: AddInput) -> anyhow::Result<i64> {
        Ok(input.a + input.b)
    }

    async fn fail(_: Value) -> anyhow::Result<Value> {
        anyhow::bail!("disk full")
    }

    async fn explode(_: Value) -> anyhow::Result<Value> {
        panic!("kaboom")
    }

    fn registry() -> MethodRegistry {
        MethodRegistry::new()
            .with_method("math", "add", add)
            .unwrap()
            .with_method("math", "fail", fail)
            .unwrap()
            .with_method("math", "explode", explode)
            .unwrap()
    }

    #[tokio::test]
    async fn test_typed_call() {
        let result = registry()
            .call("math", "add", json!({"a": 2, "b": 40}))
            .await
            .unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = registry();
        let result = registry.register("math", "add", add);
        assert!(matches!(result, Err(DaemonError::DuplicateMethod { .. })));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_empty_registry_fails_validation() {
        assert!(matches!(
            MethodRegistry::new().validate(),
            Err(DaemonError::EmptyRegistry)
        ));
        assert!(registry().validate().is_ok());
    }

    #[test]
    fn test_method_names_sorted() {
        assert_eq!(
            registry().method_names(),
            vec!["math.add", "math.explode", "math.fail"]
        );
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let registry = registry();

        let err = registry.call("text", "add", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "No methods found for file text");

        let err = registry.call("math", "mul", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "No method found for math.mul");

        let err = registry
            .call("math", "add", json!({"a": "two"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::InvalidInput { .. }));

        let err = registry.call("math", "fail", json!(null)).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let registry = registry();

        let err = registry
            .call("math", "explode", json!(null))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "math.explode panicked: kaboom");

        let result = registry
            .call("math", "add", json!({"a": 1, "b": 1}))
            .await
            .unwrap();
        assert_eq!(result, json!(2));
    }
}
