//! Channel link groups.
//!
//! Linked channels are driven in parallel as one logical output (or as a
//! bipolar pair) through the lowest-numbered channel, the master. The device
//! does not persist a grouping across experiments, so a group dissolves when
//! the master's run stops and must be requested again.

use crate::error::{InstrumentError, InstrumentResult};
use serde::{Deserialize, Serialize};

/// How the members of a group are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Members share current in parallel
    Parallel,
    /// Two adjacent channels form a bipolar output
    Bipolar,
}

/// A validated link group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkGroup {
    /// Channel that accepts session commands
    pub master: u8,
    /// All members including the master, ascending
    pub members: Vec<u8>,
    /// Combination mode
    pub mode: LinkMode,
}

impl LinkGroup {
    /// Validate `channels` for a `channel_count`-channel device.
    ///
    /// # Errors
    ///
    /// - [`InstrumentError::InvalidParameters`] for fewer than two channels,
    ///   or for a bipolar request that is not one adjacent even/odd pair.
    /// - [`InstrumentError::InvalidChannel`] for out-of-range or repeated
    ///   channels.
    pub fn plan(channels: &[u8], channel_count: u8, mode: LinkMode) -> InstrumentResult<Self> {
        if channels.len() < 2 {
            return Err(InstrumentError::InvalidParameters(
                "a link group needs at least two channels".to_string(),
            ));
        }
        let mut members = Vec::with_capacity(channels.len());
        for &channel in channels {
            if channel >= channel_count || members.contains(&channel) {
                return Err(InstrumentError::InvalidChannel(channel));
            }
            members.push(channel);
        }
        members.sort_unstable();
        let master = members[0];

        if mode == LinkMode::Bipolar {
            let adjacent_pair =
                members.len() == 2 && master % 2 == 0 && members[1] == master + 1;
            if !adjacent_pair {
                return Err(InstrumentError::InvalidParameters(format!(
                    "bipolar mode needs one adjacent channel pair, got {members:?}"
                )));
            }
        }

        Ok(Self {
            master,
            members,
            mode,
        })
    }

    /// Members other than the master.
    pub fn slaves(&self) -> impl Iterator<Item = u8> + '_ {
        self.members.iter().copied().filter(move |&c| c != self.master)
    }
}

/// A channel's role in a link group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    /// This channel drives the group
    Master(LinkGroup),
    /// This channel is driven through `master`
    Slave {
        /// Master channel of the group
        master: u8,
    },
}
