use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{TofError, TofResult};
use crate::physics::constants::MAX_GROUP_SIZE;

/// A single digitizer hit on one acquisition channel.
///
/// # Fields
///
/// * `channel_id` - physical channel the pulse was recorded on
/// * `timestamp` - fine timestamp in clock ticks
/// * `charge_short` - integrated charge of the short gate
/// * `charge_long` - integrated charge of the long gate, used as pulse height
/// * `baseline` - baseline estimate of the pulse
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ChannelHit {
    pub channel_id: u8,
    pub timestamp: u64,
    pub charge_short: u16,
    pub charge_long: u16,
    pub baseline: u16,
}

impl ChannelHit {
    pub fn new(channel_id: u8, timestamp: u64, charge_short: u16, charge_long: u16, baseline: u16) -> Self {
        ChannelHit { channel_id, timestamp, charge_short, charge_long, baseline }
    }
}

/// One coincidence window: the hits in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ChannelEvent {
    pub hits: Vec<ChannelHit>,
}

impl ChannelEvent {
    /// Creates an event, rejecting groups the acquisition counter cannot express.
    ///
    /// # Arguments
    ///
    /// * `hits` - hits of the coincidence group in arrival order
    ///
    /// # Returns
    ///
    /// * `ChannelEvent` or `TofError::InputFormat` if more than 255 hits are given
    ///
    pub fn new(hits: Vec<ChannelHit>) -> TofResult<Self> {
        let event = ChannelEvent { hits };
        event.validate()?;
        Ok(event)
    }

    /// Number of hits, the acquisition's coincidence group counter.
    pub fn coincidence_group_counter(&self) -> usize {
        self.hits.len()
    }

    pub fn validate(&self) -> TofResult<()> {
        if self.hits.len() > MAX_GROUP_SIZE {
            return Err(TofError::InputFormat { hits: self.hits.len(), max: MAX_GROUP_SIZE });
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_group_rejected() {
        let hits = vec![ChannelHit::new(0, 0, 0, 0, 0); 256];
        assert!(matches!(ChannelEvent::new(hits), Err(TofError::InputFormat { hits: 256, .. })));
    }

    #[test]
    fn test_full_group_accepted() {
        let hits = vec![ChannelHit::new(1, 10, 1, 2, 3); 255];
        let event = ChannelEvent::new(hits).unwrap();
        assert_eq!(event.coincidence_group_counter(), 255);
    }
}
