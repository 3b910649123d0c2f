//! Rolling capture engine: one recording session at a time, rotated on a
//! schedule, interrupted by calls, pruned by retention and watched by a
//! health monitor.

pub mod arbiter;
pub mod controller;
pub mod health;
pub mod reservation;
pub mod retention;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;
