//! Inbox Pilot — automated replies for a business direct-message inbox.

pub mod admin;
pub mod completion;
pub mod config;
pub mod error;
pub mod model;
pub mod observe;
pub mod pipeline;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod store;
