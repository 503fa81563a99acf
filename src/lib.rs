//! # Teleswitch - UDP Telex Switch
//!
//! Teleswitch implements one peer ("switch") of a JSON-over-UDP messaging
//! protocol. Switches exchange small envelopes called telexes: each
//! datagram is a JSON object whose top-level entries are split into
//! protocol commands, signals, and headers by the leading character of
//! their value text, with everything else left as application payload.
//!
//! ## Quick Start
//!
//! ```ignore
//! // Construct a switch and start receiving
//! let switch = Switch::new(derive_identity(&public_addr));
//! switch.start_listening(42424).await?;
//!
//! // Subscribe and consume received telexes
//! let mut telexes = switch.subscribe().await;
//! while let Some(received) = telexes.recv().await {
//!     println!("{} -> {}", received.from, received.telex);
//! }
//!
//! // Send to a peer; one ephemeral socket per datagram
//! switch.send(r#"{"+ping":"+1"}"#, peer_addr).await?;
//!
//! // Tear down: ends every subscription deterministically
//! switch.stop_listening().await;
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `telex` | Envelope parsing, classification, and rendering |
//! | `switch` | Node lifecycle: bounded send, receive loop, subscriptions |
//! | `identity` | SHA-1 identity derivation and local address discovery |

mod identity;
mod switch;
mod telex;

pub use identity::{derive_identity, local_ip};
pub use switch::{BindError, ListenOutcome, ReceivedTelex, SendError, Switch, TelexStream};
pub use telex::{MAX_TELEX_SIZE, MalformedTelex, Telex};
