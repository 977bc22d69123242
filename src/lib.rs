//! A pure Rust implementation of a length-prefixed wire protocol for remote
//! access to debug and instrumentation devices, suitable for writing servers
//! and clients.
//!
//! The protocol exposes the registers, memory regions, and configuration
//! items of a set of enumerable devices over any transport with message
//! semantics. Commands can be issued one at a time or grouped into batches
//! with a shared error policy.
//!
//! - [`protocol`] holds the codec: the positional [`protocol::Buffer`], the
//!   command catalog, and the wire-level result codes.
//! - [`client`] implements the client session state machine.
//! - [`server`] implements the dispatch loop and the pluggable
//!   [`server::Backend`] capability interface.
//! - [`transport`] defines the four-method transport contract and a TCP
//!   framing binding.

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications,
    variant_size_differences
)]

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;
