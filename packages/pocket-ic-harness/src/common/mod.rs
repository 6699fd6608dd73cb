//! Types shared with the PocketIC server.

pub mod rest;
