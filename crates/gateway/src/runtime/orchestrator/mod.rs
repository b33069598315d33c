//! Ticket/conversation-based agent orchestration.
//!
//! Laid out as its own module tree, separate from the session/transcript
//! runtime above it: [`conversation_store`] and [`tickets`] persist the
//! ticket/conversation model, [`context`] defines the types every tool
//! handler shares, and the remaining modules build up the driver and
//! orchestrator loop on top of them.

pub mod compacting;
pub mod context;
pub mod conversation_store;
pub mod driver;
pub mod model_switch;
pub mod orchestrate;
pub mod sfcm;
pub mod tickets;
pub mod tools;
pub mod watchdog;
