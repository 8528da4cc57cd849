//! # tether-core
//!
//! Shared building blocks for the Tether session relay.
//!
//! This crate provides the foundational types used by [`tether-engine`]
//! and the `tether` server binary.
//!
//! ## Responsibilities
//!
//! - **Protocol primitives**: frame format (magic / version / type / length),
//!   the hello handshake, channel requests, control requests, server events
//!   and the uniform response envelope, all as JSON payloads.
//!
//! - **Error taxonomy**: [`error::ErrorCode`] with stable wire strings and
//!   the [`error::RelayError`] carried by every domain failure.
//!
//! - **Crypto engine**: ephemeral P-256 key pairs, ECDH + HKDF-SHA-256
//!   session key derivation and AES-256-GCM message sealing.
//!
//! - **Transport traits**: [`listener::Connection`], [`listener::Listener`],
//!   [`listener::ListenerFactory`] and [`listener::Connector`] so the engine
//!   can run over TCP in production and anything else in tests.

pub mod crypto;
pub mod error;
pub mod listener;
pub mod protocol;
