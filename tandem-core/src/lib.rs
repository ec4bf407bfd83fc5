//! # tandem-core — Scene model and convergence rules
//!
//! Pure, synchronous building blocks shared by every collaborating peer.
//!
//! ```text
//!   remote payload (JSON)
//!          │ decode_remote_elements
//!          ▼
//!   ┌──────────────┐  reconcile   ┌──────────────┐
//!   │ remote set   │ ───────────► │ merged scene │ ──► ElementStore
//!   └──────────────┘      ▲       └──────┬───────┘
//!                         │              │ scene_version
//!                  local set             ▼
//!                                   SceneVersion
//! ```
//!
//! ## Modules
//!
//! - [`element`] — Element model and the regression-rejecting store
//! - [`scene`] — Order-independent scene fingerprint
//! - [`reconcile`] — Per-id merge of remote and local element sets

pub mod element;
pub mod reconcile;
pub mod scene;

pub use element::{
    demote_saved_files, Element, ElementError, ElementId, ElementStore, FileStatus, MAX_VERSION,
};
pub use reconcile::{compare_precedence, decode_remote_elements, reconcile, DecodedElements};
pub use scene::{scene_version, SceneVersion};
