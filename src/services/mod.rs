//! Services - business logic and state management
//!
//! - `normalizer` - Raw scan records to canonical observations
//! - `fingerprint` - Stable identity from advertisement content
//! - `classifier` - Vendor and beacon labels
//! - `presence` - Per-device ENTER/LEAVE state machine
//! - `aggregator` - Daily dwell totals
//! - `notifier` - Async entry notification worker
//! - `recovery` - Rebuild state from history
//! - `pipeline` - Central observation processor

pub mod aggregator;
pub mod classifier;
pub mod fingerprint;
pub mod normalizer;
pub mod notifier;
pub mod pipeline;
pub mod presence;
pub mod recovery;

// Re-export commonly used types
pub use fingerprint::{FingerprintEngine, FingerprintVersion};
pub use notifier::{create_notifier, NotificationWorker, NotifierHandle};
pub use pipeline::Pipeline;
pub use presence::PresenceTracker;
