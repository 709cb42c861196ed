//! Hooks implemented by applications embedding the cluster service.

pub mod listener;
pub mod watch;
pub mod weight;
