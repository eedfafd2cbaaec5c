//! IO modules - external system interfaces
//!
//! - `scan_source` - JSON-lines scan input (stdin or file)
//! - `history` - Append-only presence history (JSONL format)
//! - `webhook` - HTTP client for entry notifications

pub mod history;
pub mod scan_source;
pub mod webhook;

// Re-export commonly used types
pub use history::{EventHistoryStore, EventQuery, HistoryRecord, PersistError};
pub use scan_source::{open_source, JsonLinesSource, ScanSource};
pub use webhook::WebhookClient;
