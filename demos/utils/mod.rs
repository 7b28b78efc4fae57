//! Utility functions for the TUN demos

pub mod network;
