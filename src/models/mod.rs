//! Core data model for the chunked upload coordinator.
//!
//! The only durable entity is the upload session. Chunk payloads and the
//! final assembled object live in the blob store as opaque keys and carry
//! no model of their own.

pub mod session;
