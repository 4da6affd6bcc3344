//! Fixed-value revenue split across payee wallets.
//!
//! The gateway rejects a charge whose split shares do not add up to the
//! charged value, so every allocation here is exact to the centavo: shares
//! are floored proportionally and whatever is left goes to the primary payee.

use crate::money::Cents;
use crate::models::{Company, Service};
use serde::{Deserialize, Serialize};

/// One payee share of a charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitEntry {
    pub wallet_id: String,
    pub value: Cents,
}

/// A payee candidate with its relative weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payee {
    pub wallet_id: String,
    pub weight: Cents,
}

impl Payee {
    pub fn new(wallet_id: impl Into<String>, weight: Cents) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            weight,
        }
    }
}

/// Splits `total` across `payees` proportionally to their weights.
///
/// The payee at `primary` absorbs the rounding remainder and, when every
/// weight is zero, the whole amount. Payees sharing a wallet are merged and
/// payees that end up with nothing are dropped. Output keeps input order.
pub fn allocate(total: Cents, payees: &[Payee], primary: usize) -> Vec<SplitEntry> {
    if payees.is_empty() || total.0 <= 0 {
        return Vec::new();
    }
    let primary = primary.min(payees.len() - 1);

    // Merge duplicate wallets; the primary keeps its slot.
    let mut merged: Vec<Payee> = Vec::with_capacity(payees.len());
    let mut primary_slot = 0;
    for (idx, payee) in payees.iter().enumerate() {
        let slot = match merged.iter().position(|p| p.wallet_id == payee.wallet_id) {
            Some(existing) => {
                merged[existing].weight.0 += payee.weight.0.max(0);
                existing
            }
            None => {
                merged.push(Payee::new(payee.wallet_id.clone(), Cents(payee.weight.0.max(0))));
                merged.len() - 1
            }
        };
        if idx == primary {
            primary_slot = slot;
        }
    }

    let weight_sum: i128 = merged.iter().map(|p| p.weight.0 as i128).sum();
    let mut shares: Vec<i64> = if weight_sum == 0 {
        vec![0; merged.len()]
    } else {
        merged
            .iter()
            .map(|p| ((total.0 as i128 * p.weight.0 as i128) / weight_sum) as i64)
            .collect()
    };

    let allocated: i64 = shares.iter().sum();
    shares[primary_slot] += total.0 - allocated;

    merged
        .into_iter()
        .zip(shares)
        .filter(|(_, share)| *share > 0)
        .map(|(payee, share)| SplitEntry {
            wallet_id: payee.wallet_id,
            value: Cents(share),
        })
        .collect()
}

/// Builds the payee list for a service order.
///
/// The platform wallet is the primary payee and carries `base_price`; the
/// company wallet carries `operator_price`; the reseller wallet carries
/// `reseller_price` when the company has one, otherwise that weight stays
/// with the platform. Negative prices count as zero.
pub fn service_payees(
    platform_wallet_id: &str,
    company_wallet_id: &str,
    company: &Company,
    service: &Service,
) -> Vec<Payee> {
    let non_negative = |price: Cents| Cents(price.0.max(0));
    let operator_price = non_negative(service.operator_price);
    let reseller_price = non_negative(service.reseller_price);
    let mut platform_weight = non_negative(service.base_price);
    let mut payees = Vec::with_capacity(3);

    let reseller = company
        .reseller_wallet_id
        .as_deref()
        .map(str::trim)
        .filter(|w| !w.is_empty());

    let mut others = vec![Payee::new(company_wallet_id, operator_price)];
    match reseller {
        Some(wallet) => others.push(Payee::new(wallet, reseller_price)),
        None => platform_weight.0 += reseller_price.0,
    }

    payees.push(Payee::new(platform_wallet_id, platform_weight));
    payees.extend(others);
    payees
}

/// Sum of all shares.
pub fn split_total(entries: &[SplitEntry]) -> Cents {
    Cents(entries.iter().map(|e| e.value.0).sum())
}
