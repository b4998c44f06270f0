//! Extension trait for a shared Engine.

use std::sync::Arc;

use evalflow::Engine;

use crate::server::run_server;

/// Extension trait that serves an engine over HTTP.
pub trait EngineHarnessExt: Sized {
    /// Serve the API on the given port.
    ///
    /// This spawns an HTTP server in the background that shares the engine
    /// with the caller. Must be called from within a Tokio runtime.
    fn with_api(self, port: u16) -> Self;
}

impl EngineHarnessExt for Arc<Engine> {
    fn with_api(self, port: u16) -> Self {
        let engine = self.clone();

        // Spawn server in background
        tokio::spawn(async move {
            run_server(engine, port).await;
        });

        self
    }
}
