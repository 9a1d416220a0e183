pub mod chromium;
pub mod session;

pub use chromium::{ChromiumLauncher, ChromiumSession};
pub use session::{BrowserSession, ContextHandle, SessionLauncher, SessionOptions};
