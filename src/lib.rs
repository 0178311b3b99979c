//! Sanity harness library
//!
//! Boots a firewall image next to a client container, joins them with a veth
//! pair and checks DHCP, DNS and the allowed ports from the client side.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod network;
pub mod registry;
pub mod report;
pub mod runner;
pub mod runtime;
pub mod tty;

pub use error::{HarnessError, Result};
