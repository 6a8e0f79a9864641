//! Types serialised over the client message channel.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize`; the surface
//! (WebSocket or otherwise) forwards them as JSON without interpretation.

pub mod frames;
