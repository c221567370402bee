//! eCard-API (BSI TR-03112 / ISO 24727) eID-client protocol engine.
//!
//! This crate implements the machinery an eID client needs to authenticate a
//! smart-card holder against a remote relying-party backend:
//!
//! * [`transport`]: the PAOS transport loop, which carries a long-lived,
//!   message-correlated conversation with a server whose "responses" are
//!   themselves requests the client services locally.
//! * [`state`]: the concurrent, multiply-indexed card/session registry the
//!   SAL consults to resolve a connection handle to live card state.
//! * [`protocol`]: the per-instance step dispatcher executing a card
//!   authentication protocol as an ordered sequence of operations.
//! * [`dispatch`]: the generic delivery seam between transport and SAL.
//!
//! Card I/O (APDU transmission), the TLV/ASN.1 codec, GUI rendering and the
//! local control-channel binding are consumed through narrow traits and are
//! out of scope here.

pub mod definitions;
pub mod dispatch;
pub mod protocol;
pub mod state;
pub mod transport;
