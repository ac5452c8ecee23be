pub mod app; // application state and setup
pub mod auth; // session verification
pub mod completion; // external completion client
pub mod config; // promptdesk.toml config file
pub mod endpoints; // HTTP handlers
pub mod error; // error handling
pub mod observability; // utilities for observability (logs)
pub mod quota; // usage counting and the quota gate
