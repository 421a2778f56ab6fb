//! Wire-level building blocks: packet framing, payload transcoding, the
//! request body model and the duplex channel.
//!
//! The layering is strict. `packet` knows only bytes and headers;
//! `transcode` turns values into body bytes; `message` gives CALL bodies
//! their shape; `channel` moves packets and knows nothing about calls. Call
//! semantics (correlation, dispatch, error mapping) live with the clients
//! and the server on top of this module.

pub mod channel;
pub mod message;
pub mod packet;
pub mod transcode;
