//! Event types broadcast by the engine.
//!
//! Everything derives `serde::Serialize` + `serde::Deserialize` so a host
//! application can forward events over its own bus (IPC, WebSocket, stdout)
//! as camelCase JSON.

pub mod events;
