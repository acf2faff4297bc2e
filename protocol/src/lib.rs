// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tokenflow Protocol: Core Library
//!
//! Multi-party token transactions without a trusted coordinator. A sender,
//! its recipients, an issuer and an auditor each keep their own keys and
//! talk over point-to-point sessions; the library drives the whole
//! lifecycle between them:
//!
//! ```text
//! identity exchange ─► actions ─► endorsements ─► audit ─► ordering ─► finality
//! ```
//!
//! ## Architecture
//!
//! - **config**: Protocol constants and the configuration structs.
//! - **crypto**: Ed25519 keys and the hashing helpers.
//! - **identity**: Identities, wallets and recipient data.
//! - **session**: Ordered message pipes between parties, and the hub
//!   that routes them.
//! - **ledger**: The ledger backend seam plus an in-memory ledger.
//! - **storage**: Transaction status stores and the auditor's log.
//! - **vault**: Unspent tokens.
//! - **selector**: Token selection and the lock table.
//! - **ttx**: The transaction protocol itself.
//!
//! Collaborators are passed in explicitly through
//! [`ttx::PartyContext`]; there is no global registry.

pub mod config;
pub mod crypto;
pub mod identity;
pub mod ledger;
pub mod selector;
pub mod session;
pub mod storage;
pub mod ttx;
pub mod vault;
