mod context;
mod session;

pub use context::{AppIdentity, BrowserContext, FocusContext};
pub use session::Session;
