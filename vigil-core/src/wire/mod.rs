//! JSON messages exchanged with transport clients.

pub mod events;
