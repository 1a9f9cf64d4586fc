//! End-to-end integration tests for interpose.
//!
//! These tests exercise the full stack:
//! - Root CA generation, import and export
//! - Leaf minting through the provisioner
//! - Real rustls handshakes against server and client engines
//! - Configuration-driven provisioner construction

#![cfg(test)]
