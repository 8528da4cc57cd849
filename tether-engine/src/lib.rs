//! # tether-engine
//!
//! Runtime logic for the Tether session relay, embedded into the `tether`
//! server binary.
//!
//! This crate provides:
//! - **Session registry**: the `Active → Ended` state machine, the two
//!   participant roles and their current connection ids, inactivity expiry
//! - **Signaling router**: per-connection outboxes and the routed calls
//!   (input, media negotiation, key exchange, transfer notifications)
//! - **TCP rendezvous**: two port-0 listeners per transfer and the byte
//!   relay between them, with progress pushed to both participants
//! - **Engine**: the accept loop, the per-connection channel handler and an
//!   event bus consumed by the CLI
//! - **Client**: signaling and control clients over any `Connector`

pub mod auth;
pub mod channel;
pub mod client;
pub mod control;
pub mod engine;
pub mod framing;
pub mod hub;
pub mod keys;
pub mod message_processor;
pub mod registry;
pub mod rendezvous;
pub mod router;
pub mod store;
pub mod tcp;
pub mod transfers;
