//! Toxide Core - toxics and toxic chains.
//!
//! This crate holds the parts of the toxic pipeline that do not touch sockets:
//!
//! - [`Toxic`] / [`ToxicKind`]: the closed set of fault-injection behaviours
//!   with typed attributes, resolved and validated at attach time
//! - [`Batch`] / [`Segment`]: a chunk of stream data with its write schedule
//! - [`ToxicChain`]: the ordered, copy-on-write list of toxics for one direction
//! - [`ToxicStates`]: per-connection activation and counters
//!
//! ## Pipeline
//!
//! ```text
//! socket read ─▶ Batch ─▶ toxic[0] ─▶ toxic[1] ─▶ … ─▶ scheduled segments ─▶ socket write
//!                           ▲
//!                  snapshot of the chain taken for this chunk
//! ```

pub mod batch;
pub mod chain;
pub mod direction;
pub mod error;
pub mod state;
pub mod toxic;

pub use batch::{Batch, Segment};
pub use chain::{apply, Snapshot, ToxicChain, ToxicChains};
pub use direction::Direction;
pub use error::{Result, ToxicError};
pub use state::{Effects, ToxicState, ToxicStates};
pub use toxic::{
    canonical_type, BandwidthAttributes, LatencyAttributes, LimitDataAttributes,
    ResetPeerAttributes, Sampling, SlicerAttributes, SlowCloseAttributes, TimeoutAttributes,
    Toxic, ToxicDefinition, ToxicKind, ToxicPatch,
};
