use std::collections::{BTreeMap, HashMap};

use grouptab_protocol::{CustomShare, LineItemInfo, ParticipantId, SplitPolicy};

use crate::error::EngineError;
use crate::participants::Participant;

/// Tolerance when validating that custom fractions sum to 1.0.
pub const FRACTION_EPSILON: f64 = 1e-6;

/// Compute per-participant owed amounts from a frozen item snapshot.
///
/// Pure: no clocks, no I/O, no session state beyond the arguments. Only
/// `Active` participants owe anything; items attributed to departed
/// participants are excluded from the total. In every mode the returned
/// amounts sum exactly to the total; rounding never drifts a cent.
/// Spending limits are checked here so an over-limit share fails before
/// any gateway call is made.
pub fn compute_split(
    items: &[LineItemInfo],
    participants: &[Participant],
    policy: &SplitPolicy,
    limits: &HashMap<ParticipantId, u64>,
) -> Result<BTreeMap<ParticipantId, u64>, EngineError> {
    let active: Vec<&Participant> = participants.iter().filter(|p| p.is_active()).collect();
    let total: u64 = items
        .iter()
        .filter(|i| active.iter().any(|p| p.id == i.added_by))
        .map(LineItemInfo::total_cents)
        .sum();

    if active.is_empty() {
        if total != 0 {
            return Err(EngineError::Internal(
                "non-zero total with no active participants".to_string(),
            ));
        }
        return Ok(BTreeMap::new());
    }

    let owed = match policy {
        SplitPolicy::Equal => split_equal(&active, total),
        SplitPolicy::ByItems => split_by_items(&active, items),
        SplitPolicy::Custom { splits } => split_custom(&active, splits, total)?,
    };

    for (participant_id, &amount) in &owed {
        if let Some(&limit) = limits.get(participant_id) {
            if amount > limit {
                return Err(EngineError::SpendingLimitExceeded {
                    participant_id: participant_id.clone(),
                    requested_cents: amount,
                    spent_cents: 0,
                    limit_cents: limit,
                });
            }
        }
    }

    Ok(owed)
}

/// Total divided evenly; remainder cents go to the earliest joiners so
/// the assignment is deterministic and the sum is exact.
fn split_equal(active: &[&Participant], total: u64) -> BTreeMap<ParticipantId, u64> {
    let n = active.len() as u64;
    let base = total / n;
    let remainder = (total % n) as usize;

    active
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let extra = u64::from(i < remainder);
            (p.id.clone(), base + extra)
        })
        .collect()
}

/// Everyone owes exactly what they personally added.
fn split_by_items(active: &[&Participant], items: &[LineItemInfo]) -> BTreeMap<ParticipantId, u64> {
    let mut owed: BTreeMap<ParticipantId, u64> =
        active.iter().map(|p| (p.id.clone(), 0)).collect();
    for item in items {
        if let Some(amount) = owed.get_mut(&item.added_by) {
            *amount += item.total_cents();
        }
    }
    owed
}

fn split_custom(
    active: &[&Participant],
    splits: &HashMap<ParticipantId, CustomShare>,
    total: u64,
) -> Result<BTreeMap<ParticipantId, u64>, EngineError> {
    let mut shares = Vec::with_capacity(active.len());
    for p in active {
        let share = splits.get(&p.id).ok_or_else(|| {
            EngineError::InvalidSplitConfiguration(format!(
                "no custom split entry for participant {}",
                p.id
            ))
        })?;
        shares.push((p.id.clone(), share));
    }

    let all_fixed = shares
        .iter()
        .all(|(_, s)| matches!(s, CustomShare::Fixed { .. }));
    let all_fractions = shares
        .iter()
        .all(|(_, s)| matches!(s, CustomShare::Fraction { .. }));
    if !all_fixed && !all_fractions {
        return Err(EngineError::InvalidSplitConfiguration(
            "custom splits must be all fixed amounts or all fractions".to_string(),
        ));
    }

    if all_fixed {
        let mut owed = BTreeMap::new();
        let mut sum = 0u64;
        for (id, share) in &shares {
            let CustomShare::Fixed { amount_cents } = share else {
                unreachable!()
            };
            owed.insert(id.clone(), *amount_cents);
            sum += amount_cents;
        }
        if sum != total {
            return Err(EngineError::InvalidSplitConfiguration(format!(
                "fixed amounts sum to {sum} cents but the session total is {total} cents"
            )));
        }
        return Ok(owed);
    }

    let mut fraction_sum = 0.0;
    for (_, share) in &shares {
        let CustomShare::Fraction { fraction } = share else {
            unreachable!()
        };
        if *fraction < 0.0 {
            return Err(EngineError::InvalidSplitConfiguration(
                "fractions must be non-negative".to_string(),
            ));
        }
        fraction_sum += fraction;
    }
    if (fraction_sum - 1.0).abs() > FRACTION_EPSILON {
        return Err(EngineError::InvalidSplitConfiguration(format!(
            "fractions sum to {fraction_sum}, expected 1.0"
        )));
    }

    // Floor each share, then push the leftover cents onto the earliest
    // joiners (or pull them back from the latest) so the sum lands
    // exactly on the total regardless of float rounding.
    let mut owed: Vec<(ParticipantId, u64)> = shares
        .iter()
        .map(|(id, share)| {
            let CustomShare::Fraction { fraction } = share else {
                unreachable!()
            };
            (id.clone(), (total as f64 * fraction).floor() as u64)
        })
        .collect();

    let mut drift = total as i64 - owed.iter().map(|(_, a)| *a as i64).sum::<i64>();
    let mut i = 0;
    let owed_len = owed.len();
    while drift > 0 {
        owed[i % owed_len].1 += 1;
        drift -= 1;
        i += 1;
    }
    let mut j = owed.len();
    while drift < 0 && j > 0 {
        j -= 1;
        let take = (-drift as u64).min(owed[j].1);
        owed[j].1 -= take;
        drift += take as i64;
    }

    Ok(owed.into_iter().collect())
}
