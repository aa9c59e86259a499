//! Network helpers used before anything is exposed.
//!
//! - Local port availability checks
//! - TCP connect scans of a host's port range
//! - Outbound local address discovery

pub mod probe;

pub use probe::{
    is_port_free, local_address, local_address_toward, scan_open_ports, PortScanner,
    DEFAULT_SCAN_CONCURRENCY, DEFAULT_SCAN_TIMEOUT, LOOPBACK_ADDRESS,
};
