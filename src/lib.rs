// Public API - data types and export functions
pub mod config;
pub mod error;
pub mod export;
pub mod state;

// Probe machinery, public for the binary and integration tests
pub mod lookup;
pub mod probe;
pub mod trace;
