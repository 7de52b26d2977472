//! Replicated auction queue state
//!
//! [`AuctionState`] is the per-node mirror of the cluster's shared state:
//! the queue of items not yet started, the currently open item with its
//! bidding fields, and the append-only results ledger. The coordinator's
//! copy is authoritative; followers converge on it through snapshot pushes
//! and periodic pulls, applied with [`AuctionState::apply_snapshot`].

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::item::{default_items, AuctionItem, ItemResult, NO_BIDS_WINNER};

/// Full shared state of the auction queue
#[derive(Debug, Clone, Default)]
pub struct AuctionState {
    /// Items not yet started, in order
    pub queue: VecDeque<AuctionItem>,

    /// The item currently open for bidding, if any
    pub current_item: Option<AuctionItem>,

    /// Highest committed bid on the current item
    ///
    /// Initialised to `starting_price - 1` when an item opens, so the first
    /// acceptable bid is the starting price itself.
    pub current_highest_bid: u64,

    /// Bidder holding the highest bid; empty while nobody has bid
    pub current_winner: String,

    /// Wall-clock second at which the current item closes; zero when none is open
    pub deadline_unix: i64,

    /// False once the queue has drained
    pub active: bool,

    /// Append-only ledger of closed items
    pub results: Vec<ItemResult>,
}

impl AuctionState {
    /// Build a fresh state from the default item seed, first item open
    ///
    /// No deadline is set here; the coordinator assigns one when it starts
    /// the item timer.
    pub fn seeded() -> Self {
        let mut items: VecDeque<AuctionItem> = default_items().into();
        let first = items.pop_front();
        let current_highest_bid = first.as_ref().map(|i| i.starting_price - 1).unwrap_or(0);
        Self {
            queue: items,
            current_item: first,
            current_highest_bid,
            current_winner: String::new(),
            deadline_unix: 0,
            active: true,
            results: Vec::new(),
        }
    }

    /// Whether a bid of `amount` is acceptable right now
    ///
    /// Requires an active auction with an open item, a strictly higher
    /// amount, and a deadline still in the future. A bid arriving exactly
    /// at the deadline second is rejected.
    pub fn can_accept(&self, amount: u64, now: i64) -> bool {
        self.active
            && self.current_item.is_some()
            && amount > self.current_highest_bid
            && now < self.deadline_unix
    }

    /// Record a committed bid if it still beats the local highest
    ///
    /// Returns true when the bid was adopted. A duplicate or lower decision
    /// leaves the state untouched.
    pub fn commit_bid(&mut self, amount: u64, bidder: &str) -> bool {
        if self.active && self.current_item.is_some() && amount > self.current_highest_bid {
            self.current_highest_bid = amount;
            self.current_winner = bidder.to_string();
            true
        } else {
            false
        }
    }

    /// Close the current item and append its result to the ledger
    ///
    /// An item that never saw an acceptable bid is recorded as
    /// `{winner: "No bids", winningBid: 0}`.
    pub fn finalize_current(&mut self) -> Option<ItemResult> {
        let item = self.current_item.take()?;
        let mut result = ItemResult {
            winner: self.current_winner.clone(),
            winning_bid: self.current_highest_bid,
            item,
        };
        if result.winning_bid <= result.item.starting_price.saturating_sub(1) {
            result.winner = NO_BIDS_WINNER.to_string();
            result.winning_bid = 0;
        }
        self.results.push(result.clone());
        Some(result)
    }

    /// Pop the queue head and open it for bidding
    ///
    /// Returns the opened item, or `None` when the queue has drained, in
    /// which case the auction is marked inactive.
    pub fn open_next(&mut self, now: i64) -> Option<AuctionItem> {
        match self.queue.pop_front() {
            Some(next) => {
                self.current_highest_bid = next.starting_price - 1;
                self.current_winner = String::new();
                self.deadline_unix = now + next.duration_sec as i64;
                self.current_item = Some(next.clone());
                Some(next)
            }
            None => {
                self.current_item = None;
                self.active = false;
                self.deadline_unix = 0;
                None
            }
        }
    }

    /// Reset to the default seed with the first item open
    pub fn reset_to_seed(&mut self, now: i64) -> AuctionItem {
        let mut items: VecDeque<AuctionItem> = default_items().into();
        let first = items.pop_front().expect("default seed is never empty");
        self.queue = items;
        self.current_highest_bid = first.starting_price - 1;
        self.current_winner = String::new();
        self.results.clear();
        self.active = true;
        self.deadline_unix = now + first.duration_sec as i64;
        self.current_item = Some(first.clone());
        first
    }

    /// Build a serialisable deep copy for replication and the HTTP surface
    pub fn snapshot(&self, epoch: u64) -> QueueSnapshot {
        QueueSnapshot {
            current_item: self.current_item.clone(),
            current_highest_bid: self.current_highest_bid,
            current_winner: self.current_winner.clone(),
            deadline_unix: self.deadline_unix,
            active: self.active,
            queue_len: self.queue.len(),
            remaining_items: self.queue.iter().cloned().collect(),
            results: self.results.clone(),
            epoch,
        }
    }

    /// Overwrite local fields from a coordinator snapshot
    ///
    /// Every field is replaced except `results`, which is adopted only when
    /// the incoming list is strictly longer. The ledger is append-only, and
    /// a reordered or duplicated delivery must never shrink it.
    pub fn apply_snapshot(&mut self, snap: QueueSnapshot) {
        self.current_item = snap.current_item;
        self.current_highest_bid = snap.current_highest_bid;
        self.current_winner = snap.current_winner;
        self.deadline_unix = snap.deadline_unix;
        self.active = snap.active;
        self.queue = snap.remaining_items.into();
        if snap.results.len() > self.results.len() {
            self.results = snap.results;
        }
    }
}

/// Serialisable copy of [`AuctionState`], pushed by the coordinator and
/// served on `GET /state`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Currently open item, if any
    pub current_item: Option<AuctionItem>,

    /// Highest committed bid on the current item
    pub current_highest_bid: u64,

    /// Bidder holding the highest bid
    pub current_winner: String,

    /// Deadline of the current item, unix seconds
    pub deadline_unix: i64,

    /// Whether the auction is still running
    pub active: bool,

    /// Number of items not yet started
    pub queue_len: usize,

    /// The items not yet started
    pub remaining_items: Vec<AuctionItem>,

    /// Results ledger at snapshot time
    pub results: Vec<ItemResult>,

    /// Coordinator epoch the snapshot was built under
    #[serde(default)]
    pub epoch: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_state(starting_price: u64, deadline_unix: i64) -> AuctionState {
        let mut state = AuctionState::seeded();
        let mut item = state.current_item.clone().unwrap();
        item.starting_price = starting_price;
        state.current_highest_bid = starting_price - 1;
        state.current_item = Some(item);
        state.deadline_unix = deadline_unix;
        state
    }

    #[test]
    fn seeded_state_opens_first_item_at_price_minus_one() {
        let state = AuctionState::seeded();
        let item = state.current_item.as_ref().unwrap();
        assert_eq!(item.id, "item-1");
        assert_eq!(state.current_highest_bid, item.starting_price - 1);
        assert_eq!(state.queue.len(), 5);
        assert!(state.active);
        assert_eq!(state.deadline_unix, 0);
    }

    #[test]
    fn starting_price_is_the_first_acceptable_bid() {
        let state = open_state(500, 10_000);
        assert!(state.can_accept(500, 9_999));
        assert!(!state.can_accept(499, 9_999));
    }

    #[test]
    fn equal_bid_is_rejected() {
        let mut state = open_state(500, 10_000);
        assert!(state.commit_bid(500, "alice"));
        assert!(!state.can_accept(500, 9_999));
        assert!(state.can_accept(501, 9_999));
    }

    #[test]
    fn bid_at_the_deadline_second_is_rejected() {
        let state = open_state(500, 10_000);
        assert!(state.can_accept(600, 9_999));
        assert!(!state.can_accept(600, 10_000));
        assert!(!state.can_accept(600, 10_001));
    }

    #[test]
    fn duplicate_commit_is_a_no_op() {
        let mut state = open_state(500, 10_000);
        assert!(state.commit_bid(700, "alice"));
        assert!(!state.commit_bid(700, "mallory"));
        assert_eq!(state.current_winner, "alice");
        assert_eq!(state.current_highest_bid, 700);
    }

    #[test]
    fn finalize_without_bids_records_no_winner() {
        let mut state = open_state(500, 10_000);
        let result = state.finalize_current().unwrap();
        assert_eq!(result.winner, NO_BIDS_WINNER);
        assert_eq!(result.winning_bid, 0);
        assert!(state.current_item.is_none());
        assert_eq!(state.results.len(), 1);
    }

    #[test]
    fn finalize_with_a_bid_records_the_winner() {
        let mut state = open_state(500, 10_000);
        state.commit_bid(750, "bob");
        let result = state.finalize_current().unwrap();
        assert_eq!(result.winner, "bob");
        assert_eq!(result.winning_bid, 750);
    }

    #[test]
    fn open_next_drains_the_queue_then_deactivates() {
        let mut state = AuctionState::seeded();
        state.finalize_current();
        let mut opened = 0;
        while state.open_next(1_000).is_some() {
            opened += 1;
            state.finalize_current();
        }
        assert_eq!(opened, 5);
        assert!(!state.active);
        assert!(state.current_item.is_none());
        assert_eq!(state.deadline_unix, 0);
        assert_eq!(state.results.len(), 6);
    }

    #[test]
    fn snapshot_apply_is_idempotent() {
        let mut source = open_state(500, 10_000);
        source.commit_bid(600, "carol");
        let snap = source.snapshot(1);

        let mut follower = AuctionState::seeded();
        follower.apply_snapshot(snap.clone());
        let first = follower.snapshot(1);
        follower.apply_snapshot(snap);
        let second = follower.snapshot(1);

        assert_eq!(first.current_highest_bid, second.current_highest_bid);
        assert_eq!(first.results.len(), second.results.len());
        assert_eq!(first.remaining_items, second.remaining_items);
    }

    #[test]
    fn shorter_results_never_overwrite_longer_ones() {
        let mut source = open_state(500, 10_000);
        source.commit_bid(600, "carol");
        source.finalize_current();
        let with_result = source.snapshot(1);

        let mut follower = AuctionState::seeded();
        follower.apply_snapshot(with_result.clone());
        assert_eq!(follower.results.len(), 1);

        // A stale snapshot from before the finalize arrives late.
        let stale = AuctionState::seeded().snapshot(1);
        follower.apply_snapshot(stale);
        assert_eq!(follower.results.len(), 1);
    }

    #[test]
    fn reset_to_seed_clears_results_and_opens_item_one() {
        let mut state = open_state(500, 10_000);
        state.commit_bid(900, "dave");
        state.finalize_current();
        let first = state.reset_to_seed(5_000);
        assert_eq!(first.id, "item-1");
        assert!(state.results.is_empty());
        assert_eq!(state.current_highest_bid, first.starting_price - 1);
        assert_eq!(state.deadline_unix, 5_000 + first.duration_sec as i64);
    }
}
