//! State Management Module
//!
//! Persistent epoch tracking, the ensemble membership view, and the
//! shared server state / vote of a quorum peer.

pub mod zxid;
mod epoch;
mod view;
mod status;

pub use zxid::{Epoch, Zxid};
pub use epoch::{EpochFile, EpochPair, EpochStore, ACCEPTED_EPOCH_FILENAME, CURRENT_EPOCH_FILENAME};
pub use view::{LearnerType, QuorumView, ServerDescriptor, ServerId};
pub use status::{PeerStatus, ServerState, Vote};
