//! Interception results: target definitions, captured responses, and their
//! classification into per-key outcomes.

pub mod classifier;
pub mod types;

pub use classifier::{RESPONSE_MISSING_MESSAGE, ResponseClassifier};
pub use types::{
    CapturedResponse, ErrorKind, MENU_KEY, SHOP_INFO_KEY, ScrapeFailure, ScrapeOutcome,
    ScrapeReport, ScrapeTarget, TargetError, WatchResult,
};
