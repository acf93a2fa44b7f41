//! Merging per-rule signals into one trading decision.

use std::fmt;
use std::str::FromStr;

use super::position::Direction;
use super::signal::Signal;

/// One rule's contribution at a single instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vote<'a> {
    pub rule: &'a str,
    pub signal: Signal,
    /// Only read by `CombinationPolicy::Weighted`.
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CombinationPolicy {
    /// Strict plurality among non-HOLD votes; ties HOLD.
    MajorityVote,
    /// BUY when Σ weight × value ≥ threshold, SELL when ≤ −threshold.
    Weighted { threshold: f64 },
    /// Every non-HOLD vote must point the same way.
    Unanimous,
}

impl CombinationPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            CombinationPolicy::MajorityVote => "majority_vote",
            CombinationPolicy::Weighted { .. } => "weighted",
            CombinationPolicy::Unanimous => "unanimous",
        }
    }

    /// Combine `votes` into BUY, SELL or HOLD.
    pub fn combine(&self, votes: &[Vote<'_>]) -> Signal {
        match self {
            CombinationPolicy::MajorityVote => majority(votes),
            CombinationPolicy::Weighted { threshold } => weighted(votes, *threshold),
            CombinationPolicy::Unanimous => unanimous(votes),
        }
    }
}

impl fmt::Display for CombinationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CombinationPolicy::Weighted { threshold } => write!(f, "weighted({threshold})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown combination policy '{0}' (expected majority_vote, weighted or unanimous)")]
pub struct ParsePolicyError(pub String);

/// Parses the policy name; a weighted policy starts with a threshold of 0.5
/// for the caller to override.
impl FromStr for CombinationPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "majority_vote" | "majority" => Ok(CombinationPolicy::MajorityVote),
            "weighted" => Ok(CombinationPolicy::Weighted { threshold: 0.5 }),
            "unanimous" => Ok(CombinationPolicy::Unanimous),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

fn from_direction(direction: Option<Direction>) -> Signal {
    match direction {
        Some(Direction::Long) => Signal::Buy,
        Some(Direction::Short) => Signal::Sell,
        None => Signal::Hold,
    }
}

fn majority(votes: &[Vote<'_>]) -> Signal {
    let (mut long, mut short) = (0usize, 0usize);
    for vote in votes {
        match vote.signal.direction() {
            Some(Direction::Long) => long += 1,
            Some(Direction::Short) => short += 1,
            None => {}
        }
    }
    match long.cmp(&short) {
        std::cmp::Ordering::Greater => Signal::Buy,
        std::cmp::Ordering::Less => Signal::Sell,
        std::cmp::Ordering::Equal => Signal::Hold,
    }
}

fn weighted(votes: &[Vote<'_>], threshold: f64) -> Signal {
    let score: f64 = votes.iter().map(|v| v.weight * v.signal.value()).sum();
    if score >= threshold {
        Signal::Buy
    } else if score <= -threshold {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

fn unanimous(votes: &[Vote<'_>]) -> Signal {
    let mut agreed: Option<Direction> = None;
    for direction in votes.iter().filter_map(|v| v.signal.direction()) {
        match agreed {
            None => agreed = Some(direction),
            Some(d) if d != direction => return Signal::Hold,
            Some(_) => {}
        }
    }
    from_direction(agreed)
}
