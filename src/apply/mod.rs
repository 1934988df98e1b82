//! Outbound side: the gated sender and the route/send pass that drives it.

pub mod run;
pub mod sender;

pub use run::{ApplyOptions, ApplyPass, ApplyReport};
pub use sender::{SendOutcome, Sender};
