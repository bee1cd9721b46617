//! Transaction Identifiers
//!
//! A zxid packs the leadership epoch into its high 32 bits and the
//! per-epoch transaction counter into its low 32 bits.

/// Transaction identifier
pub type Zxid = u64;

/// Epoch number (high half of a zxid)
pub type Epoch = u64;

const COUNTER_MASK: u64 = 0xffff_ffff;

/// Extract the epoch component of a zxid
pub fn epoch_of(zxid: Zxid) -> Epoch {
    zxid >> 32
}

/// Extract the counter component of a zxid
pub fn counter_of(zxid: Zxid) -> u64 {
    zxid & COUNTER_MASK
}

/// Build a zxid from an epoch and a counter
pub fn make_zxid(epoch: Epoch, counter: u64) -> Zxid {
    (epoch << 32) | (counter & COUNTER_MASK)
}

/// Render a zxid (or epoch) the way it appears in logs
pub fn zxid_to_string(zxid: Zxid) -> String {
    format!("0x{:x}", zxid)
}
