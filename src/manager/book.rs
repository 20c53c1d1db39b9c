//! Per-asset limit order books priced in the base asset.
//!
//! Placing an offer locks the funds it could spend (quote for bids, asset
//! for asks). Crossing offers execute at the resting offer's price; a buyer
//! that crossed below its own limit gets the difference refunded. Whatever
//! is left rests in the book until it is filled or cancelled.

use super::TransactionManager;
use crate::crypto::RollingRoot;
use crate::error::ChainError;
use crate::operation::{Amount, Offer, OfferCancel, OfferSide, Operation, Trade, BASE_ASSET};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferBook {
    pub asset: String,
    /// Highest price first, oldest first within a price.
    pub bids: Vec<Offer>,
    /// Lowest price first, oldest first within a price.
    pub asks: Vec<Offer>,
}

impl OfferBook {
    pub fn new(asset: &str) -> Self {
        Self {
            asset: asset.to_string(),
            ..Default::default()
        }
    }

    pub fn best_bid(&self) -> Option<&Offer> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Offer> {
        self.asks.first()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    fn side_mut(&mut self, side: OfferSide) -> &mut Vec<Offer> {
        match side {
            OfferSide::Buy => &mut self.bids,
            OfferSide::Sell => &mut self.asks,
        }
    }

    fn rest(&mut self, offer: Offer) {
        let side = offer.side;
        let price = offer.price;
        let offers = self.side_mut(side);
        let at = offers
            .iter()
            .position(|resting| match side {
                OfferSide::Buy => resting.price < price,
                OfferSide::Sell => resting.price > price,
            })
            .unwrap_or(offers.len());
        offers.insert(at, offer);
    }

    fn take(&mut self, side: OfferSide, hash: &str) -> Option<Offer> {
        let offers = self.side_mut(side);
        let at = offers.iter().position(|o| o.hash_str() == hash)?;
        Some(offers.remove(at))
    }
}

fn value(price: Amount, quantity: Amount) -> Result<Amount, ChainError> {
    price
        .checked_mul(quantity)
        .ok_or_else(|| ChainError::InvalidOperation(format!("trade value {} x {} out of range", price, quantity)))
}

fn crosses(taker: &Offer, resting: &Offer) -> bool {
    match taker.side {
        OfferSide::Buy => resting.price <= taker.price,
        OfferSide::Sell => resting.price >= taker.price,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookManager {
    books: HashMap<String, OfferBook>,
    /// Resting offer hash → (asset, side).
    resting: HashMap<String, (String, OfferSide)>,
    /// Offers processed in this block, keyed by hash.
    processed: HashMap<String, Offer>,
    trades: Vec<Trade>,
    block_hash: Option<String>,
}

impl BookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Working copy for the next block: books carry over, per-block records do not.
    pub fn next(&self) -> Self {
        Self {
            books: self.books.clone(),
            resting: self.resting.clone(),
            processed: HashMap::new(),
            trades: Vec::new(),
            block_hash: None,
        }
    }

    pub fn block_hash(&self) -> Option<&str> {
        self.block_hash.as_deref()
    }

    pub fn set_block_hash(&mut self, hash: String) {
        self.block_hash = Some(hash);
    }

    pub fn get_book(&self, asset: &str) -> Option<&OfferBook> {
        self.books.get(asset)
    }

    pub fn get_resting(&self, hash: &str) -> Option<&Offer> {
        let (asset, side) = self.resting.get(hash)?;
        let book = self.books.get(asset)?;
        let offers = match side {
            OfferSide::Buy => &book.bids,
            OfferSide::Sell => &book.asks,
        };
        offers.iter().find(|o| o.hash_str() == hash)
    }

    /// Trades executed in this block for `asset`.
    pub fn get_trades(&self, asset: &str) -> Vec<Trade> {
        self.trades.iter().filter(|t| t.asset == asset).cloned().collect()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn get_processed_offer(&self, hash: &str) -> Option<&Offer> {
        self.processed.get(hash)
    }

    /// Offers `wallet` placed in this block, oldest first.
    pub fn get_processed_offers(&self, wallet: &str) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .processed
            .values()
            .filter(|o| o.wallet == wallet)
            .cloned()
            .collect();
        offers.sort_by_key(|o| o.timestamp);
        offers
    }

    /// True if the offer rests in a book or was processed in this block.
    pub fn contains_offer(&self, offer: &Offer) -> bool {
        let hash = offer.hash_str();
        self.processed.contains_key(&hash) || self.resting.contains_key(&hash)
    }

    /// Places `offer`, matching it against the opposite side. Returns the
    /// offer annotated with the trades it produced. On error nothing changes.
    pub fn process_offer(&mut self, transact: &mut TransactionManager, mut offer: Offer) -> Result<Offer, ChainError> {
        offer.clean_trades();
        offer.validate()?;
        if self.contains_offer(&offer) {
            return Err(ChainError::InvalidOperation(format!(
                "offer {} already placed",
                offer.hash_str()
            )));
        }
        let (lock_asset, lock_amount) = offer.locked(offer.quantity)?;
        let lock_asset = lock_asset.to_string();
        let hash = offer.hash_str();
        let opposite = match offer.side {
            OfferSide::Buy => OfferSide::Sell,
            OfferSide::Sell => OfferSide::Buy,
        };

        // Work out every fill and balance change before touching state.
        let mut fills: Vec<(usize, Trade)> = Vec::new();
        let mut credits: Vec<(String, String, Amount)> = Vec::new();
        if let Some(book) = self.books.get(&offer.asset) {
            let makers = match opposite {
                OfferSide::Buy => &book.bids,
                OfferSide::Sell => &book.asks,
            };
            let mut remaining = offer.quantity;
            for (at, resting) in makers.iter().enumerate() {
                if remaining <= Amount::ZERO || !crosses(&offer, resting) {
                    break;
                }
                let quantity = remaining.min(resting.remaining());
                let (buy, sell) = match offer.side {
                    OfferSide::Buy => (&offer, resting),
                    OfferSide::Sell => (resting, &offer),
                };
                let trade = Trade {
                    asset: offer.asset.clone(),
                    buy_offer: buy.hash_str(),
                    sell_offer: sell.hash_str(),
                    buyer_wallet: buy.wallet.clone(),
                    seller_wallet: sell.wallet.clone(),
                    price: resting.price,
                    quantity,
                    timestamp: offer.timestamp,
                };

                credits.push((trade.buyer_wallet.clone(), offer.asset.clone(), quantity));
                credits.push((trade.seller_wallet.clone(), BASE_ASSET.to_string(), value(trade.price, quantity)?));
                if offer.side == OfferSide::Buy && offer.price > trade.price {
                    credits.push((offer.wallet.clone(), BASE_ASSET.to_string(), value(offer.price - trade.price, quantity)?));
                }
                remaining -= quantity;
                fills.push((at, trade));
            }
        }

        let credit_refs: Vec<(&str, &str, Amount)> = credits
            .iter()
            .map(|(wallet, asset, amount)| (wallet.as_str(), asset.as_str(), *amount))
            .collect();
        transact.settle(&[(offer.wallet.as_str(), lock_asset.as_str(), lock_amount)], &credit_refs)?;

        let book = self
            .books
            .entry(offer.asset.clone())
            .or_insert_with(|| OfferBook::new(&offer.asset));
        let makers = book.side_mut(opposite);
        let mut trades = Vec::with_capacity(fills.len());
        for (at, trade) in fills {
            let resting = &mut makers[at];
            resting.trades.push(trade.clone());
            if resting.remaining() <= Amount::ZERO {
                self.resting.remove(&resting.hash_str());
            }
            offer.trades.push(trade.clone());
            trades.push(trade);
        }
        makers.retain(|o| o.remaining() > Amount::ZERO);

        if offer.remaining() > Amount::ZERO {
            book.rest(offer.clone());
            self.resting.insert(hash.clone(), (offer.asset.clone(), offer.side));
        }

        debug!(
            offer = %hash,
            side = %offer.side,
            asset = %offer.asset,
            trades = trades.len(),
            "offer processed"
        );
        self.trades.extend(trades);
        self.processed.insert(hash, offer.clone());
        Ok(offer)
    }

    /// Removes a resting offer owned by the cancelling wallet and unlocks its remainder.
    pub fn process_offer_cancel(
        &mut self,
        transact: &mut TransactionManager,
        cancel: &OfferCancel,
    ) -> Result<(), ChainError> {
        cancel.validate()?;
        let (asset, side) = self
            .resting
            .get(&cancel.offer_hash)
            .cloned()
            .ok_or_else(|| ChainError::OfferNotFound(cancel.offer_hash.clone()))?;
        let owner = self
            .get_resting(&cancel.offer_hash)
            .map(|o| o.wallet.clone())
            .ok_or_else(|| ChainError::OfferNotFound(cancel.offer_hash.clone()))?;
        if owner != cancel.wallet {
            return Err(ChainError::InvalidOperation(format!(
                "offer {} is not owned by {}",
                cancel.offer_hash, cancel.wallet
            )));
        }

        let resting = self
            .get_resting(&cancel.offer_hash)
            .ok_or_else(|| ChainError::OfferNotFound(cancel.offer_hash.clone()))?;
        let (unlock_asset, unlock_amount) = resting.locked(resting.remaining())?;
        transact.credit(&resting.wallet, unlock_asset, unlock_amount)?;

        self.books
            .get_mut(&asset)
            .and_then(|book| book.take(side, &cancel.offer_hash))
            .ok_or_else(|| ChainError::OfferNotFound(cancel.offer_hash.clone()))?;
        self.resting.remove(&cancel.offer_hash);
        Ok(())
    }

    pub fn process_offers(
        &mut self,
        transact: &mut TransactionManager,
        mut root: RollingRoot,
        pending: Vec<Offer>,
    ) -> (Vec<Offer>, RollingRoot) {
        let mut eligible = Vec::with_capacity(pending.len());
        for offer in pending {
            let hash = offer.hash_str();
            match self.process_offer(transact, offer) {
                Ok(processed) => {
                    root.fold(&processed.encode());
                    eligible.push(processed);
                }
                Err(e) => debug!(offer = %hash, error = %e, "skipping offer"),
            }
        }
        (eligible, root)
    }

    pub fn process_offer_cancels(
        &mut self,
        transact: &mut TransactionManager,
        mut root: RollingRoot,
        pending: Vec<OfferCancel>,
    ) -> (Vec<OfferCancel>, RollingRoot) {
        let mut eligible = Vec::with_capacity(pending.len());
        for cancel in pending {
            if let Err(e) = self.process_offer_cancel(transact, &cancel) {
                debug!(cancel = %cancel.hash_str(), error = %e, "skipping offer cancel");
                continue;
            }
            root.fold(&cancel.encode());
            eligible.push(cancel);
        }
        (eligible, root)
    }
}
