//! Decoded frame payloads exchanged with the transport collaborator.
//!
//! The wire codec itself lives behind the
//! [`ControlTransport`](crate::transport::ControlTransport) trait; this
//! module only models the already-decoded payloads the control channel
//! consumes: server-pushed events and result sets of system-table queries.

pub mod events;
pub mod response;
