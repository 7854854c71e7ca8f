use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use grouptab_protocol::{ItemId, ItemPatch, LineItemInfo, NewItem, ParticipantId};

use crate::error::EngineError;

/// One ordered menu item, attributed to the participant who added it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub id: ItemId,
    pub menu_item_id: String,
    pub name: String,
    pub unit_price_cents: u64,
    pub quantity: u32,
    pub customizations: Vec<String>,
    pub added_by: ParticipantId,
    pub added_at_ms: u64,
    pub last_modified_by: ParticipantId,
    pub last_modified_at_ms: u64,
    /// Starts at 1, increments on every successful update. Callers echo
    /// it back so a concurrent edit surfaces as a conflict instead of a
    /// silent overwrite.
    pub version: u64,
}

impl LineItem {
    pub fn total_cents(&self) -> u64 {
        self.unit_price_cents * u64::from(self.quantity)
    }

    pub fn to_info(&self) -> LineItemInfo {
        LineItemInfo {
            id: self.id.clone(),
            menu_item_id: self.menu_item_id.clone(),
            name: self.name.clone(),
            unit_price_cents: self.unit_price_cents,
            quantity: self.quantity,
            customizations: self.customizations.clone(),
            added_by: self.added_by.clone(),
            added_at_ms: self.added_at_ms,
            last_modified_by: self.last_modified_by.clone(),
            last_modified_at_ms: self.last_modified_at_ms,
            version: self.version,
        }
    }
}

/// Append-mostly list of line items with optimistic versioning. Owned
/// exclusively by one session; participant-status checks happen at the
/// session's entry points before the ledger is touched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemLedger {
    items: Vec<LineItem>,
}

impl ItemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch of items for one participant, all or nothing. The
    /// spending limit is checked against the combined cost up front so a
    /// partially applied batch never exists.
    pub fn add_items(
        &mut self,
        participant_id: &str,
        new_items: &[NewItem],
        limits: &HashMap<ParticipantId, u64>,
        now_ms: u64,
    ) -> Result<Vec<LineItemInfo>, EngineError> {
        let batch_cents: u64 = new_items
            .iter()
            .map(|n| n.unit_price_cents * u64::from(n.quantity))
            .sum();
        self.check_limit(participant_id, batch_cents, limits)?;

        let mut added = Vec::with_capacity(new_items.len());
        for n in new_items {
            let item = LineItem {
                id: uuid::Uuid::new_v4().to_string(),
                menu_item_id: n.menu_item_id.clone(),
                name: n.name.clone(),
                unit_price_cents: n.unit_price_cents,
                quantity: n.quantity,
                customizations: n.customizations.clone(),
                added_by: participant_id.to_string(),
                added_at_ms: now_ms,
                last_modified_by: participant_id.to_string(),
                last_modified_at_ms: now_ms,
                version: 1,
            };
            added.push(item.to_info());
            self.items.push(item);
        }
        Ok(added)
    }

    /// Optimistic-concurrency write. Fails with `VersionConflict` when
    /// `expected_version` is stale, forcing the caller to re-read and
    /// retry. A quantity increase re-checks the author's spending limit.
    pub fn update_item(
        &mut self,
        item_id: &str,
        expected_version: u64,
        patch: &ItemPatch,
        modified_by: &str,
        limits: &HashMap<ParticipantId, u64>,
        now_ms: u64,
    ) -> Result<LineItemInfo, EngineError> {
        let idx = self
            .items
            .iter()
            .position(|i| i.id == item_id)
            .ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;

        let current = &self.items[idx];
        if current.version != expected_version {
            return Err(EngineError::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }

        if let Some(new_quantity) = patch.quantity {
            if new_quantity > current.quantity {
                let extra =
                    current.unit_price_cents * u64::from(new_quantity - current.quantity);
                let author = current.added_by.clone();
                self.check_limit(&author, extra, limits)?;
            }
        }

        let item = &mut self.items[idx];
        if let Some(quantity) = patch.quantity {
            item.quantity = quantity;
        }
        if let Some(ref customizations) = patch.customizations {
            item.customizations = customizations.clone();
        }
        item.last_modified_by = modified_by.to_string();
        item.last_modified_at_ms = now_ms;
        item.version += 1;
        Ok(item.to_info())
    }

    pub fn remove_item(&mut self, item_id: &str) -> Result<LineItem, EngineError> {
        let idx = self
            .items
            .iter()
            .position(|i| i.id == item_id)
            .ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;
        Ok(self.items.remove(idx))
    }

    pub fn get(&self, item_id: &str) -> Option<&LineItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Running total of everything this participant has added.
    pub fn participant_total(&self, participant_id: &str) -> u64 {
        self.items
            .iter()
            .filter(|i| i.added_by == participant_id)
            .map(LineItem::total_cents)
            .sum()
    }

    /// Session total over items whose author the caller considers active.
    /// Items of departed participants stay in the ledger but drop out of
    /// this sum.
    pub fn total_cents<F>(&self, is_active: F) -> u64
    where
        F: Fn(&str) -> bool,
    {
        self.items
            .iter()
            .filter(|i| is_active(&i.added_by))
            .map(LineItem::total_cents)
            .sum()
    }

    /// Reattribute one participant's items to another. Used by the
    /// items-to-host removal policy.
    pub fn reattribute(&mut self, from: &str, to: &str, now_ms: u64) -> usize {
        let mut moved = 0;
        for item in self.items.iter_mut().filter(|i| i.added_by == from) {
            item.added_by = to.to_string();
            item.last_modified_by = to.to_string();
            item.last_modified_at_ms = now_ms;
            item.version += 1;
            moved += 1;
        }
        moved
    }

    /// Owned, immutable view for callers and the split calculator. Never
    /// hands out a live reference.
    pub fn snapshot(&self) -> Vec<LineItemInfo> {
        self.items.iter().map(LineItem::to_info).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineItem> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn check_limit(
        &self,
        participant_id: &str,
        extra_cents: u64,
        limits: &HashMap<ParticipantId, u64>,
    ) -> Result<(), EngineError> {
        let Some(&limit) = limits.get(participant_id) else {
            return Ok(());
        };
        let spent = self.participant_total(participant_id);
        if spent + extra_cents > limit {
            return Err(EngineError::SpendingLimitExceeded {
                participant_id: participant_id.to_string(),
                requested_cents: extra_cents,
                spent_cents: spent,
                limit_cents: limit,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_item(name: &str, unit_price_cents: u64, quantity: u32) -> NewItem {
        NewItem {
            menu_item_id: format!("menu-{name}"),
            name: name.to_string(),
            unit_price_cents,
            quantity,
            customizations: vec![],
        }
    }

    fn no_limits() -> HashMap<ParticipantId, u64> {
        HashMap::new()
    }

    #[test]
    fn add_items_starts_versions_at_one() {
        let mut ledger = ItemLedger::new();
        let added = ledger
            .add_items("p1", &[new_item("burger", 1000, 1)], &no_limits(), 100)
            .unwrap();

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].version, 1);
        assert_eq!(added[0].added_by, "p1");
        assert_eq!(ledger.participant_total("p1"), 1000);
    }

    #[test]
    fn add_rejected_when_limit_would_be_exceeded() {
        let mut ledger = ItemLedger::new();
        let limits = HashMap::from([("p2".to_string(), 500u64)]);

        let err = ledger
            .add_items("p2", &[new_item("steak", 700, 1)], &limits, 100)
            .unwrap_err();
        match err {
            EngineError::SpendingLimitExceeded {
                participant_id,
                requested_cents,
                limit_cents,
                ..
            } => {
                assert_eq!(participant_id, "p2");
                assert_eq!(requested_cents, 700);
                assert_eq!(limit_cents, 500);
            }
            other => panic!("expected SpendingLimitExceeded, got {other}"),
        }
        // Nothing recorded on failure.
        assert_eq!(ledger.participant_total("p2"), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn batch_add_is_all_or_nothing() {
        let mut ledger = ItemLedger::new();
        let limits = HashMap::from([("p1".to_string(), 1000u64)]);

        // 600 + 600 breaches the limit even though each alone fits.
        let err = ledger
            .add_items(
                "p1",
                &[new_item("soup", 600, 1), new_item("salad", 600, 1)],
                &limits,
                100,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::SpendingLimitExceeded { .. }));
        assert!(ledger.is_empty());
    }

    #[test]
    fn limit_counts_running_total_not_just_the_new_item() {
        let mut ledger = ItemLedger::new();
        let limits = HashMap::from([("p1".to_string(), 1000u64)]);

        ledger
            .add_items("p1", &[new_item("soup", 600, 1)], &limits, 100)
            .unwrap();
        let err = ledger
            .add_items("p1", &[new_item("salad", 600, 1)], &limits, 200)
            .unwrap_err();
        match err {
            EngineError::SpendingLimitExceeded { spent_cents, .. } => {
                assert_eq!(spent_cents, 600)
            }
            other => panic!("expected SpendingLimitExceeded, got {other}"),
        }
    }

    #[test]
    fn update_with_stale_version_conflicts() {
        let mut ledger = ItemLedger::new();
        let added = ledger
            .add_items("p1", &[new_item("burger", 1000, 1)], &no_limits(), 100)
            .unwrap();
        let item_id = added[0].id.clone();

        let patch = ItemPatch {
            quantity: Some(2),
            customizations: None,
        };
        let updated = ledger
            .update_item(&item_id, 1, &patch, "p1", &no_limits(), 200)
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.quantity, 2);

        // Replaying the same expected_version now conflicts.
        let err = ledger
            .update_item(&item_id, 1, &patch, "p1", &no_limits(), 300)
            .unwrap_err();
        match err {
            EngineError::VersionConflict { expected, actual } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected VersionConflict, got {other}"),
        }
    }

    #[test]
    fn quantity_increase_rechecks_author_limit() {
        let mut ledger = ItemLedger::new();
        let limits = HashMap::from([("p1".to_string(), 1500u64)]);
        let added = ledger
            .add_items("p1", &[new_item("burger", 1000, 1)], &limits, 100)
            .unwrap();

        let patch = ItemPatch {
            quantity: Some(2),
            customizations: None,
        };
        let err = ledger
            .update_item(&added[0].id, 1, &patch, "p1", &limits, 200)
            .unwrap_err();
        assert!(matches!(err, EngineError::SpendingLimitExceeded { .. }));
        // Failed update leaves the item untouched.
        assert_eq!(ledger.get(&added[0].id).unwrap().version, 1);
        assert_eq!(ledger.get(&added[0].id).unwrap().quantity, 1);
    }

    #[test]
    fn quantity_decrease_never_trips_the_limit() {
        let mut ledger = ItemLedger::new();
        let limits = HashMap::from([("p1".to_string(), 2000u64)]);
        let added = ledger
            .add_items("p1", &[new_item("burger", 1000, 2)], &limits, 100)
            .unwrap();

        let patch = ItemPatch {
            quantity: Some(1),
            customizations: None,
        };
        let updated = ledger
            .update_item(&added[0].id, 1, &patch, "p1", &limits, 200)
            .unwrap();
        assert_eq!(updated.quantity, 1);
    }

    #[test]
    fn update_records_modifier_and_timestamp() {
        let mut ledger = ItemLedger::new();
        let added = ledger
            .add_items("p1", &[new_item("burger", 1000, 1)], &no_limits(), 100)
            .unwrap();

        let patch = ItemPatch {
            quantity: None,
            customizations: Some(vec!["no onions".to_string()]),
        };
        let updated = ledger
            .update_item(&added[0].id, 1, &patch, "p2", &no_limits(), 999)
            .unwrap();
        assert_eq!(updated.last_modified_by, "p2");
        assert_eq!(updated.last_modified_at_ms, 999);
        assert_eq!(updated.customizations, vec!["no onions".to_string()]);
        // Attribution never changes on update.
        assert_eq!(updated.added_by, "p1");
    }

    #[test]
    fn total_excludes_inactive_authors() {
        let mut ledger = ItemLedger::new();
        ledger
            .add_items("p1", &[new_item("burger", 1000, 1)], &no_limits(), 100)
            .unwrap();
        ledger
            .add_items("p2", &[new_item("fries", 400, 2)], &no_limits(), 100)
            .unwrap();

        assert_eq!(ledger.total_cents(|_| true), 1800);
        assert_eq!(ledger.total_cents(|p| p == "p1"), 1000);
        assert_eq!(ledger.total_cents(|_| false), 0);
    }

    #[test]
    fn remove_unknown_item_is_not_found() {
        let mut ledger = ItemLedger::new();
        let err = ledger.remove_item("nope").unwrap_err();
        assert!(matches!(err, EngineError::ItemNotFound(_)));
    }

    #[test]
    fn reattribute_moves_items_and_bumps_versions() {
        let mut ledger = ItemLedger::new();
        let added = ledger
            .add_items("p2", &[new_item("cake", 800, 1)], &no_limits(), 100)
            .unwrap();

        let moved = ledger.reattribute("p2", "host", 200);
        assert_eq!(moved, 1);
        let item = ledger.get(&added[0].id).unwrap();
        assert_eq!(item.added_by, "host");
        assert_eq!(item.version, 2);
        assert_eq!(ledger.participant_total("p2"), 0);
        assert_eq!(ledger.participant_total("host"), 800);
    }

    #[test]
    fn snapshot_is_detached_from_the_ledger() {
        let mut ledger = ItemLedger::new();
        ledger
            .add_items("p1", &[new_item("burger", 1000, 1)], &no_limits(), 100)
            .unwrap();

        let snap = ledger.snapshot();
        let item_id = snap[0].id.clone();
        ledger.remove_item(&item_id).unwrap();

        // The snapshot still holds the removed item.
        assert_eq!(snap.len(), 1);
        assert!(ledger.is_empty());
    }
}
