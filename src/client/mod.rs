//! Client-side session layer.
//!
//! ARCHITECTURE
//! ============
//! A native frontend spawns one [`session::SessionHandle`] per user and
//! drives it with commands while rendering its events. The session task owns
//! the connection lifecycle (reconnect, credential refresh, conversation
//! continuity); the [`assembler`] keeps the visible transcript consistent
//! with the server's streaming protocol.

pub mod assembler;
pub mod auth;
pub mod session;
pub mod transport;
