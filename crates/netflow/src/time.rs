//! Flow timestamps: seconds plus a millisecond fraction, packed the way the
//! upstream transport carries `TIME_FIRST`/`TIME_LAST` (32 bits seconds,
//! 32 bits sub-second fraction).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u32,
    pub millis: u32,
}

impl Timestamp {
    pub fn from_secs(secs: u32) -> Self {
        Self { secs, millis: 0 }
    }

    pub fn from_packed(packed: u64) -> Self {
        Self {
            secs: (packed >> 32) as u32,
            millis: packed as u32,
        }
    }

    pub fn to_packed(self) -> u64 {
        (u64::from(self.secs) << 32) | u64::from(self.millis)
    }
}
