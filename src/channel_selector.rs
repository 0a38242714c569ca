//! Multi-armed channel bandits for the hopping variant.
//!
//! Every unicast transmission to a neighbor is one pull of the arm "channel
//! the neighbor woke up on"; the reward is whether the acknowledgment came
//! back. The selector proposes a mask of channels worth targeting and the
//! synchronizer slides the wake-up sequence until the receiver's predicted
//! wake-up lands on a proposed channel.
//!
//! Two policies:
//!  - D-UCB: rewards and pull counts are discounted by `γ = 1 − 2⁻¹⁰` per
//!    step, so the bandit forgets old interference
//!  - SW-UCB: rewards inside a sliding window of recent pulls
//!
//! Both rank arms by `exploitation + exploration` where exploration is
//! `sqrt(ξ · ln(total pulls) / pulls(arm))` in Q10.22 arithmetic.

use crate::config::CHANNELS_COUNT;
use crate::ufix::{self, Ufix22};

/// Arms proposed at most per schedule.
pub const MAX_PROPOSED_CHANNELS: usize = 4;

/// `γ = 1 − 2⁻¹⁰` in Q10.22.
const DISCOUNT_FACTOR: Ufix22 = ufix::ONE - (ufix::ONE >> 10);

/// `ξ` enters as `ln 2 >> EXPLORATION_TENDENCY_EXP`.
const EXPLORATION_TENDENCY_EXP: u32 = 13;
const LOG_2_E_INV_XI: Ufix22 = ufix::LOG_2_E_INV >> EXPLORATION_TENDENCY_EXP;

pub trait ChannelSelector: Default {
    /// Bitmask of channels worth targeting next.
    fn propose_channels(&self) -> u16;

    /// Accounts the outcome of a transmission on `channel`.
    fn take_feedback(&mut self, successful: bool, channel: usize);

    /// Whether some arm has never been pulled.
    fn is_exploring(&self) -> bool;
}

fn insert_ranked(
    results: &mut [(usize, Ufix22); MAX_PROPOSED_CHANNELS],
    inserted_so_far: usize,
    channel: usize,
    ucb: Ufix22,
) {
    let filled = inserted_so_far.min(MAX_PROPOSED_CHANNELS);
    for j in 0..filled {
        if ucb > results[j].1 {
            results.copy_within(j..MAX_PROPOSED_CHANNELS - 1, j + 1);
            results[j] = (channel, ucb);
            return;
        }
    }
    if filled < MAX_PROPOSED_CHANNELS {
        results[filled] = (channel, ucb);
    }
}

fn rank_to_mask(
    pulls: impl Fn(usize) -> Ufix22,
    rewards: impl Fn(usize) -> Ufix22,
) -> u16 {
    // unpulled arms are proposed unconditionally
    let mut proposed: u16 = 0;
    let mut total_pulls: Ufix22 = 0;
    for channel in 0..CHANNELS_COUNT {
        if pulls(channel) == 0 {
            proposed |= 1 << channel;
        } else {
            total_pulls += pulls(channel);
        }
    }
    if proposed != 0 {
        return proposed;
    }

    let intermediate = ufix::multiply(LOG_2_E_INV_XI, ufix::log2(total_pulls));
    let mut results = [(0usize, 0 as Ufix22); MAX_PROPOSED_CHANNELS];
    for channel in 0..CHANNELS_COUNT {
        let exploitation = ufix::divide(rewards(channel), pulls(channel));
        let exploration = ufix::sqrt(ufix::divide(intermediate, pulls(channel)));
        insert_ranked(&mut results, channel, channel, exploitation + exploration);
    }
    for (channel, _) in results.iter().take(CHANNELS_COUNT) {
        proposed |= 1 << channel;
    }
    proposed
}

/// Discounted UCB state, one per neighbor.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct DUcb {
    discounted_pulls: [Ufix22; CHANNELS_COUNT],
    discounted_rewards: [Ufix22; CHANNELS_COUNT],
}

impl Default for DUcb {
    fn default() -> Self {
        Self {
            discounted_pulls: [0; CHANNELS_COUNT],
            discounted_rewards: [0; CHANNELS_COUNT],
        }
    }
}

impl ChannelSelector for DUcb {
    fn propose_channels(&self) -> u16 {
        rank_to_mask(
            |c| self.discounted_pulls[c],
            |c| self.discounted_rewards[c],
        )
    }

    fn take_feedback(&mut self, successful: bool, channel: usize) {
        for c in 0..CHANNELS_COUNT {
            self.discounted_pulls[c] = ufix::multiply(self.discounted_pulls[c], DISCOUNT_FACTOR);
            self.discounted_rewards[c] =
                ufix::multiply(self.discounted_rewards[c], DISCOUNT_FACTOR);
        }
        self.discounted_pulls[channel] += ufix::ONE;
        self.discounted_rewards[channel] += ufix::from_uint(successful as u32);
    }

    fn is_exploring(&self) -> bool {
        self.discounted_pulls.iter().any(|&pulls| pulls == 0)
    }
}

/// Sliding-window size of the SW-UCB policy.
pub const SW_UCB_WINDOW_SIZE: usize = 16;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
struct WindowEntry {
    arm: u8,
    reward: bool,
}

/// Sliding-window UCB state, one per neighbor.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct SwUcb {
    time_step: u32,
    window: [WindowEntry; SW_UCB_WINDOW_SIZE],
}

impl Default for SwUcb {
    fn default() -> Self {
        Self {
            time_step: 0,
            window: [WindowEntry::default(); SW_UCB_WINDOW_SIZE],
        }
    }
}

impl SwUcb {
    fn entries(&self) -> &[WindowEntry] {
        &self.window[..(self.time_step as usize).min(SW_UCB_WINDOW_SIZE)]
    }

    fn pulls(&self, channel: usize) -> Ufix22 {
        ufix::from_uint(
            self.entries()
                .iter()
                .filter(|e| e.arm as usize == channel)
                .count() as u32,
        )
    }

    fn rewards(&self, channel: usize) -> Ufix22 {
        ufix::from_uint(
            self.entries()
                .iter()
                .filter(|e| e.arm as usize == channel && e.reward)
                .count() as u32,
        )
    }
}

impl ChannelSelector for SwUcb {
    fn propose_channels(&self) -> u16 {
        rank_to_mask(|c| self.pulls(c), |c| self.rewards(c))
    }

    fn take_feedback(&mut self, successful: bool, channel: usize) {
        let slot = (self.time_step as usize) % SW_UCB_WINDOW_SIZE;
        self.window[slot] = WindowEntry {
            arm: channel as u8,
            reward: successful,
        };
        self.time_step = self.time_step.wrapping_add(1);
    }

    fn is_exploring(&self) -> bool {
        (0..CHANNELS_COUNT).any(|c| self.pulls(c) == 0)
    }
}

#[cfg(feature = "sw-ucb")]
pub type DefaultChannelSelector = SwUcb;
#[cfg(not(feature = "sw-ucb"))]
pub type DefaultChannelSelector = DUcb;
