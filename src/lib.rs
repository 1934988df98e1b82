//! Job scanner: chat job postings in, routed application emails out.

pub mod apply;
pub mod channels;
pub mod config;
pub mod error;
pub mod outbox;
pub mod pipeline;
pub mod report;
pub mod store;
