//! Startup handlers: work that must finish before a daemon accepts calls.

use crate::{DaemonContext, DaemonError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use tracing::{error, info};

type StartupFn = Box<dyn FnOnce(DaemonContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Handlers run one after another, in registration order.
#[derive(Default)]
pub struct StartupHandlers {
    handlers: Vec<(String, StartupFn)>,
}

impl StartupHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnOnce(DaemonContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .push((name.into(), Box::new(move |ctx| handler(ctx).boxed())));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler. The first failure stops the sequence.
    pub async fn run(self, ctx: &DaemonContext) -> Result<()> {
        for (name, handler) in self.handlers {
            info!("Running startup handler '{}'", name);
            if let Err(e) = handler(ctx.clone()).await {
                error!("Startup handler '{}' failed: {:#}", name, e);
                return Err(DaemonError::StartupHandlerFailed {
                    name,
                    message: format!("{:#}", e),
                });
            }
        }
        Ok(())
    }
}
