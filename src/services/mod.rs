//! Data services built on the connection manager
//!
//! Small stores that use the manager's leases and transactions: value interning,
//! typed user settings and login sessions, plus the caches in front of them.

pub mod cache;
pub mod ids;
pub mod sessions;
pub mod settings;

pub use cache::{BiCache, ExpiringCache};
pub use ids::{Collision, IdManager, RebuildReport};
pub use sessions::{SessionManager, SessionRecord};
pub use settings::{Setting, SettingsManager};
