//! Repository implementations for database operations

pub mod bot;
pub mod strategy;
pub mod trade;

pub use bot::*;
pub use strategy::*;
pub use trade::*;
