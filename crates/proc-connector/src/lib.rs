//! Client for the kernel process events connector.
//!
//! The kernel reports process lifecycle and credential changes through a
//! netlink connector multicast group. This crate implements exactly the
//! subset needed to follow credential changes:
//!
//! - [`ProcConnector`] owns the netlink socket, performs the subscribe
//!   handshake and hands out raw batches as they arrive.
//! - [`decode`] walks a batch frame by frame and yields the
//!   [`CredentialEvent`]s it contains, stopping at kernel error markers.
//! - [`wire`] holds the bit-exact layouts of the netlink, connector and
//!   `proc_event` records, with length-checked parsing.
//!
//! It is not a general netlink library and does not try to recover events the
//! kernel dropped.

mod channel;
mod decoder;
mod error;
mod event;
pub mod wire;

pub use channel::{Batch, ChannelOptions, ProcConnector, RecvOutcome, RetryReason, classify_recv};
pub use decoder::{BatchDecoder, DecodeStats, Interruption, decode};
pub use error::{ChannelError, WireError};
pub use event::{CredentialEvent, CredentialKind, IdPair};

pub use nix::unistd::Pid;
