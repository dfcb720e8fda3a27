use anyhow::Result;
use async_trait::async_trait;

use crate::models::{AppIdentity, FocusContext};

/// Injected capability that resolves an application identity into a focus
/// snapshot (window title, browser tab, document path). Implementations may
/// take tens to hundreds of milliseconds and may return a mostly-empty
/// context when the target exposes no metadata; the engine guards against
/// results arriving after a newer focus change.
#[async_trait]
pub trait ContextReader: Send + Sync {
    async fn fetch(&self, app: &AppIdentity) -> Result<FocusContext>;
}

/// Reader that reports nothing beyond the identity itself. Stands in where
/// no platform extractor is wired up.
pub struct NullContextReader;

#[async_trait]
impl ContextReader for NullContextReader {
    async fn fetch(&self, app: &AppIdentity) -> Result<FocusContext> {
        Ok(FocusContext::bare(app.clone()))
    }
}
