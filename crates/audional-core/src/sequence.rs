//! A sequence: one page of channels sharing a step grid

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub channels: Vec<Channel>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut Channel> {
        self.channels.get_mut(index)
    }

    pub fn channel_by_id(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id() == id)
    }

    pub fn index_of(&self, id: ChannelId) -> Option<usize> {
        self.channels.iter().position(|c| c.id() == id)
    }

    /// Check if any channel is soloed
    pub fn has_solo(&self) -> bool {
        self.channels.iter().any(|c| c.mix().solo)
    }

    /// Longest step grid among the channels
    pub fn step_count(&self) -> usize {
        self.channels.iter().map(|c| c.steps().len()).max().unwrap_or(0)
    }

    /// Channels lit at `step`, in channel order
    pub fn lit_channels(&self, step: usize) -> impl Iterator<Item = (usize, &Channel)> {
        self.channels
            .iter()
            .enumerate()
            .filter(move |(_, c)| c.is_step_lit(step))
    }
}
