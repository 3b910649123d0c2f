//! Shared types and storage collaborators for the rewind capture service.

pub mod config;
pub mod error;
pub mod files;
pub mod index;
pub mod protocol;
pub mod segment;
