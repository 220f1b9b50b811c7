//! Per purchaser/organizer spend aggregates and the superfan flag.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{FanProfile, Ticket};

/// What one confirmed batch adds to one purchaser's profile with one organizer.
#[derive(Debug, Clone, PartialEq)]
pub struct FanSale {
    pub purchaser_id: Uuid,
    pub organizer_id: Uuid,
    pub amount: Decimal,
    pub tickets: i32,
}

/// One sale per distinct purchaser, ordered by purchaser id.
pub fn group_sales<'a, I>(tickets: I, organizer_id: Uuid) -> Vec<FanSale>
where
    I: IntoIterator<Item = &'a Ticket>,
{
    let mut sales: BTreeMap<Uuid, FanSale> = BTreeMap::new();
    for ticket in tickets {
        let sale = sales.entry(ticket.purchaser_id).or_insert_with(|| FanSale {
            purchaser_id: ticket.purchaser_id,
            organizer_id,
            amount: Decimal::ZERO,
            tickets: 0,
        });
        sale.amount += ticket.amount;
        sale.tickets += 1;
    }
    sales.into_values().collect()
}

#[derive(Debug, Clone)]
pub struct FanAggregateUpdater {
    superfan_threshold: Decimal,
}

impl FanAggregateUpdater {
    pub fn new(superfan_threshold: Decimal) -> Self {
        Self { superfan_threshold }
    }

    pub fn superfan_threshold(&self) -> Decimal {
        self.superfan_threshold
    }

    /// Fold `sale` into the existing profile, or start one. The superfan flag
    /// is only ever raised here, never cleared.
    pub fn apply(&self, existing: Option<FanProfile>, sale: &FanSale, at: DateTime<Utc>) -> FanProfile {
        let mut profile = existing.unwrap_or_else(|| FanProfile {
            id: Uuid::new_v4(),
            purchaser_id: sale.purchaser_id,
            organizer_id: sale.organizer_id,
            total_spent: Decimal::ZERO,
            tickets_purchased: 0,
            last_interaction: at,
            is_superfan: false,
            created_at: at,
        });

        profile.total_spent += sale.amount;
        profile.tickets_purchased += sale.tickets;
        profile.last_interaction = at;
        if !profile.is_superfan && profile.total_spent >= self.superfan_threshold {
            profile.is_superfan = true;
            announce_superfan(&profile);
        }
        profile
    }
}

pub(crate) fn announce_superfan(profile: &FanProfile) {
    tracing::info!(
        purchaser_id = %profile.purchaser_id,
        organizer_id = %profile.organizer_id,
        total_spent = %profile.total_spent,
        "Purchaser became a superfan"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentStatus;

    fn ticket(purchaser_id: Uuid, amount: i64) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            tier_id: Uuid::new_v4(),
            purchaser_id,
            phone_number: "254712345678".into(),
            amount: Decimal::from(amount),
            ticket_number: format!("RD{}", Uuid::new_v4().simple()),
            verification_payload: String::new(),
            payment_status: PaymentStatus::Completed,
            correlation_id: Uuid::new_v4(),
            checkout_request_id: None,
            merchant_request_id: None,
            receipt_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sale(purchaser_id: Uuid, organizer_id: Uuid, amount: i64, tickets: i32) -> FanSale {
        FanSale {
            purchaser_id,
            organizer_id,
            amount: Decimal::from(amount),
            tickets,
        }
    }

    #[test]
    fn test_group_sales_one_per_purchaser() {
        let organizer = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let tickets = vec![ticket(alice, 2000), ticket(alice, 2000), ticket(bob, 1500)];

        let sales = group_sales(&tickets, organizer);
        assert_eq!(sales.len(), 2);

        let alice_sale = sales.iter().find(|s| s.purchaser_id == alice).unwrap();
        assert_eq!(alice_sale.amount, Decimal::from(4000));
        assert_eq!(alice_sale.tickets, 2);
        assert_eq!(alice_sale.organizer_id, organizer);
    }

    #[test]
    fn test_first_sale_creates_profile() {
        let updater = FanAggregateUpdater::new(Decimal::from(5000));
        let profile = updater.apply(None, &sale(Uuid::new_v4(), Uuid::new_v4(), 4000, 2), Utc::now());

        assert_eq!(profile.total_spent, Decimal::from(4000));
        assert_eq!(profile.tickets_purchased, 2);
        assert!(!profile.is_superfan);
    }

    #[test]
    fn test_crossing_threshold_sets_flag() {
        let updater = FanAggregateUpdater::new(Decimal::from(5000));
        let purchaser = Uuid::new_v4();
        let organizer = Uuid::new_v4();

        let profile = updater.apply(None, &sale(purchaser, organizer, 4000, 2), Utc::now());
        let profile = updater.apply(Some(profile), &sale(purchaser, organizer, 2000, 1), Utc::now());

        assert_eq!(profile.total_spent, Decimal::from(6000));
        assert_eq!(profile.tickets_purchased, 3);
        assert!(profile.is_superfan);
    }

    #[test]
    fn test_flag_survives_a_decrement() {
        let updater = FanAggregateUpdater::new(Decimal::from(5000));
        let purchaser = Uuid::new_v4();
        let organizer = Uuid::new_v4();

        let profile = updater.apply(None, &sale(purchaser, organizer, 6000, 3), Utc::now());
        assert!(profile.is_superfan);

        let profile = updater.apply(Some(profile), &sale(purchaser, organizer, -3000, 0), Utc::now());
        assert_eq!(profile.total_spent, Decimal::from(3000));
        assert!(profile.is_superfan);
    }

    #[test]
    fn test_single_large_first_sale_is_superfan() {
        let updater = FanAggregateUpdater::new(Decimal::from(5000));
        let profile = updater.apply(None, &sale(Uuid::new_v4(), Uuid::new_v4(), 5000, 1), Utc::now());
        assert!(profile.is_superfan);
    }
}
