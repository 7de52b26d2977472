//! Auction item descriptors and results

use serde::{Deserialize, Serialize};

/// Immutable descriptor of a single item put up for auction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionItem {
    /// Stable item id (`item-1`, `item-2`, …)
    pub id: String,

    /// Display name
    pub name: String,

    /// Short description
    pub description: String,

    /// Optional decorative emoji
    #[serde(default)]
    pub emoji: String,

    /// Price the bidding opens at; the first acceptable bid is this value
    pub starting_price: u64,

    /// How long the item stays open once started, in seconds
    pub duration_sec: u64,
}

/// Winner recorded when an item closes
pub const NO_BIDS_WINNER: &str = "No bids";

/// Outcome of a completed auction item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    /// The item that closed
    pub item: AuctionItem,

    /// Winning bidder, or [`NO_BIDS_WINNER`] if nobody bid
    pub winner: String,

    /// Winning amount; zero iff nobody bid
    pub winning_bid: u64,
}

/// The built-in item seed used when no checkpoint exists
pub fn default_items() -> Vec<AuctionItem> {
    fn item(id: &str, name: &str, description: &str, emoji: &str, starting_price: u64) -> AuctionItem {
        AuctionItem {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            emoji: emoji.into(),
            starting_price,
            duration_sec: 120,
        }
    }

    vec![
        item("item-1", "Vintage Rolex Watch", "1962 Submariner, excellent condition", "⌚", 500),
        item("item-2", "Oil Painting", "Original 18th-century landscape on canvas", "🖼️", 300),
        item("item-3", "Limited Sneakers", "Nike Air Jordan 1 OG, DS size 10", "👟", 200),
        item("item-4", "Gaming Laptop", "ASUS ROG, RTX 4090, 32GB RAM", "💻", 1000),
        item("item-5", "Fender Guitar", "1965 Fender Stratocaster, sunburst finish", "🎸", 800),
        item("item-6", "Rare Gold Coin", "1920 St. Gaudens Double Eagle, MS65", "🪙", 1500),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_has_six_items_with_stable_ids() {
        let items = default_items();
        assert_eq!(items.len(), 6);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.id, format!("item-{}", i + 1));
            assert!(item.starting_price > 0);
            assert_eq!(item.duration_sec, 120);
        }
        let prices: Vec<u64> = items.iter().map(|i| i.starting_price).collect();
        assert_eq!(prices, vec![500, 300, 200, 1000, 800, 1500]);
    }
}
