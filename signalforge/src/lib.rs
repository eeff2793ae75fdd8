// Command-line parsing
pub mod cli;

// Flag, environment and default resolution
pub mod config;

pub mod error;

// Research intent extraction from notes
pub mod intents;

// Loop lock and daemon control
pub mod lock;

pub mod logging;

// Vault note discovery
pub mod registry;

// Provider lookup, enrichment and synthesis
pub mod research;

// Cycle orchestration and command handlers
pub mod runner;

// Persistent task state
pub mod state;

pub mod utils;

// Finding documents and backlinks
pub mod writer;
