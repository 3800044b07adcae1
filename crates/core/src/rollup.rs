//! Hierarchical demand rollup
//!
//! Operates on an in-memory [`DemandSnapshot`] of one (seller, month) scope.
//! Every group row is rebuilt as a full re-sum of its current contributors, so
//! applying the same change twice leaves the snapshot unchanged.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::classification::{ClassificationMap, GroupBy, GroupPath, SkuClassification};
use crate::domain::demand::{
    AggregateRef, AuditStamp, DemandMetrics, DemandScope, GroupDemand, GroupKey, MetricsPatch,
    SkuDemand, SkuKey, ALL_SITES,
};
use crate::errors::{DemandError, DomainError};

/// Working copy of every SKU and group row in a scope, with the loaded state kept
/// aside so the write set can be derived afterwards.
#[derive(Clone, Debug)]
pub struct DemandSnapshot {
    scope: DemandScope,
    skus: BTreeMap<SkuKey, SkuDemand>,
    groups: BTreeMap<GroupKey, GroupDemand>,
    baseline_skus: BTreeMap<SkuKey, SkuDemand>,
    baseline_groups: BTreeMap<GroupKey, GroupDemand>,
}

/// Rows created or modified since the snapshot was loaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotChanges {
    pub skus: Vec<SkuDemand>,
    pub groups: Vec<GroupDemand>,
}

impl SnapshotChanges {
    pub fn is_empty(&self) -> bool {
        self.skus.is_empty() && self.groups.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForecastChange {
    pub parent: AggregateRef,
    pub site_id: i64,
    pub previous: Decimal,
    pub current: Decimal,
}

impl DemandSnapshot {
    pub fn new(scope: DemandScope, skus: Vec<SkuDemand>, groups: Vec<GroupDemand>) -> Self {
        let skus: BTreeMap<SkuKey, SkuDemand> =
            skus.into_iter().map(|row| (row.key(), row)).collect();
        let groups: BTreeMap<GroupKey, GroupDemand> =
            groups.into_iter().map(|row| (row.key(), row)).collect();
        Self {
            scope,
            baseline_skus: skus.clone(),
            baseline_groups: groups.clone(),
            skus,
            groups,
        }
    }

    pub fn empty(scope: DemandScope) -> Self {
        Self::new(scope, Vec::new(), Vec::new())
    }

    pub fn scope(&self) -> DemandScope {
        self.scope
    }

    pub fn sku(&self, sku: &str, site_id: i64) -> Option<&SkuDemand> {
        self.skus.get(&SkuKey { sku: sku.to_owned(), site_id })
    }

    pub fn group(&self, group_by: GroupBy, group_key: &GroupPath, site_id: i64) -> Option<&GroupDemand> {
        self.groups.get(&GroupKey { group_by, group_key: group_key.clone(), site_id })
    }

    pub fn sku_rows(&self) -> impl Iterator<Item = &SkuDemand> {
        self.skus.values()
    }

    pub fn group_rows(&self) -> impl Iterator<Item = &GroupDemand> {
        self.groups.values()
    }

    pub fn changes(&self) -> SnapshotChanges {
        SnapshotChanges {
            skus: self
                .skus
                .iter()
                .filter(|(key, row)| self.baseline_skus.get(*key) != Some(*row))
                .map(|(_, row)| row.clone())
                .collect(),
            groups: self
                .groups
                .iter()
                .filter(|(key, row)| self.baseline_groups.get(*key) != Some(*row))
                .map(|(_, row)| row.clone())
                .collect(),
        }
    }

    /// Aggregates whose monthly forecast moved; their daily rows need redistribution.
    pub fn forecast_changes(&self) -> Vec<ForecastChange> {
        let skus = self.skus.iter().filter_map(|(key, row)| {
            let previous =
                self.baseline_skus.get(key).map_or(Decimal::ZERO, |base| base.metrics.forecast);
            (previous != row.metrics.forecast).then(|| ForecastChange {
                parent: row.aggregate_ref(),
                site_id: row.site_id,
                previous,
                current: row.metrics.forecast,
            })
        });
        let groups = self.groups.iter().filter_map(|(key, row)| {
            let previous =
                self.baseline_groups.get(key).map_or(Decimal::ZERO, |base| base.metrics.forecast);
            (previous != row.metrics.forecast).then(|| ForecastChange {
                parent: row.aggregate_ref(),
                site_id: row.site_id,
                previous,
                current: row.metrics.forecast,
            })
        });
        skus.chain(groups).collect()
    }
}

/// Leaf change for one SKU at one physical site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafUpdate {
    pub sku: String,
    pub site_id: i64,
    pub patch: MetricsPatch,
    pub recompute_all_sites: bool,
}

/// Forecast correction addressed to a classification node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupUpdate {
    pub group_by: GroupBy,
    pub group_key: GroupPath,
    pub site_id: i64,
    pub forecast: Decimal,
    pub recompute_all_sites: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RollupSummary {
    pub skus_written: usize,
    pub groups_recomputed: usize,
}

#[derive(Default)]
struct Touched {
    skus: BTreeSet<String>,
    groups: BTreeSet<(GroupBy, GroupPath)>,
    skus_written: usize,
    groups_recomputed: usize,
}

impl Touched {
    fn summary(&self) -> RollupSummary {
        RollupSummary { skus_written: self.skus_written, groups_recomputed: self.groups_recomputed }
    }
}

#[derive(Clone, Debug)]
pub struct RollupEngine {
    scale: u32,
}

impl Default for RollupEngine {
    fn default() -> Self {
        Self::new(2)
    }
}

impl RollupEngine {
    /// `scale` is the number of decimal places kept when a total is split.
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }

    pub fn apply_leaf_update(
        &self,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        update: &LeafUpdate,
        stamp: &AuditStamp,
    ) -> Result<RollupSummary, DemandError> {
        require_classification(classifications, &update.sku, snapshot.scope)?;
        if update.site_id == ALL_SITES {
            return Err(DemandError::InvalidPayload(
                "leaf updates address a physical site".to_owned(),
            ));
        }

        let mut touched = Touched::default();
        let current = snapshot
            .sku(&update.sku, update.site_id)
            .map(|row| row.metrics.clone())
            .unwrap_or_default();
        self.write_sku(snapshot, &update.sku, update.site_id, update.patch.apply(&current), stamp, &mut touched);
        self.recompute_groups_for(snapshot, classifications, &update.sku, update.site_id, stamp, &mut touched)?;

        if update.recompute_all_sites {
            self.recompute_all_sites(snapshot, classifications, stamp, &mut touched)?;
        }
        Ok(touched.summary())
    }

    /// Sets the seller-wide forecast of a SKU by splitting it over the SKU's sites.
    pub fn apply_all_site_sku_update(
        &self,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        sku: &str,
        forecast: Decimal,
        stamp: &AuditStamp,
    ) -> Result<RollupSummary, DemandError> {
        require_classification(classifications, sku, snapshot.scope)?;

        let sites: Vec<(i64, Decimal)> = snapshot
            .skus
            .values()
            .filter(|row| row.sku == sku && row.site_id != ALL_SITES)
            .map(|row| (row.site_id, row.metrics.forecast))
            .collect();
        if sites.is_empty() {
            return Err(DemandError::AggregateNotFound(format!(
                "no per-site rows for sku {sku} in {}",
                snapshot.scope
            )));
        }

        let weights: Vec<Decimal> = sites.iter().map(|(_, forecast)| *forecast).collect();
        let shares = split_proportional(forecast, &weights, self.scale)?;

        let mut touched = Touched::default();
        for ((site_id, _), share) in sites.iter().zip(shares) {
            let current = snapshot.sku(sku, *site_id).map(|row| row.metrics.clone()).unwrap_or_default();
            let next = MetricsPatch::forecast(share).apply(&current);
            self.write_sku(snapshot, sku, *site_id, next, stamp, &mut touched);
            self.recompute_groups_for(snapshot, classifications, sku, *site_id, stamp, &mut touched)?;
        }
        self.recompute_all_sites(snapshot, classifications, stamp, &mut touched)?;
        Ok(touched.summary())
    }

    /// Sets a group node's forecast at one site by distributing it over the node's
    /// current leaf SKUs in proportion to their forecast.
    pub fn apply_group_update(
        &self,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        update: &GroupUpdate,
        stamp: &AuditStamp,
    ) -> Result<RollupSummary, DemandError> {
        if update.site_id == ALL_SITES {
            return Err(DemandError::InvalidPayload(
                "group updates address a physical site".to_owned(),
            ));
        }
        let mut touched = Touched::default();
        self.distribute_to_leaves(snapshot, classifications, update, stamp, &mut touched)?;
        if update.recompute_all_sites {
            self.recompute_all_sites(snapshot, classifications, stamp, &mut touched)?;
        }
        Ok(touched.summary())
    }

    /// Sets a group node's seller-wide forecast by splitting it over the sites
    /// where the node has leaf SKUs, then over each site's leaves.
    pub fn apply_all_site_group_update(
        &self,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        group_by: GroupBy,
        group_key: &GroupPath,
        forecast: Decimal,
        stamp: &AuditStamp,
    ) -> Result<RollupSummary, DemandError> {
        let mut per_site: BTreeMap<i64, Decimal> = BTreeMap::new();
        for row in snapshot.skus.values().filter(|row| row.site_id != ALL_SITES) {
            if belongs(classifications, &row.sku, group_by, group_key) {
                *per_site.entry(row.site_id).or_default() += row.metrics.forecast;
            }
        }
        if per_site.is_empty() {
            return Err(group_not_found(group_by, group_key, snapshot.scope));
        }

        let weights: Vec<Decimal> = per_site.values().copied().collect();
        let shares = split_proportional(forecast, &weights, self.scale)?;

        let mut touched = Touched::default();
        for (site_id, share) in per_site.keys().copied().zip(shares) {
            let update = GroupUpdate {
                group_by,
                group_key: group_key.clone(),
                site_id,
                forecast: share,
                recompute_all_sites: false,
            };
            self.distribute_to_leaves(snapshot, classifications, &update, stamp, &mut touched)?;
        }
        self.recompute_all_sites(snapshot, classifications, stamp, &mut touched)?;
        Ok(touched.summary())
    }

    /// Re-derives `is_latest_group` for every row of one hierarchy: a row is current
    /// when its key is a valid node or an ancestor of one. Returns the number of
    /// rows whose flag flipped.
    pub fn refresh_latest_groups(
        &self,
        snapshot: &mut DemandSnapshot,
        group_by: GroupBy,
        valid_paths: &[GroupPath],
        stamp: &AuditStamp,
    ) -> usize {
        let current: BTreeSet<GroupPath> =
            valid_paths.iter().flat_map(GroupPath::prefixes).collect();

        let mut flipped = 0;
        for row in snapshot.groups.values_mut().filter(|row| row.group_by == group_by) {
            let is_current = current.contains(&row.group_key);
            if row.is_latest_group != is_current {
                row.is_latest_group = is_current;
                row.updated_by = stamp.actor.clone();
                row.updated_at = stamp.at;
                flipped += 1;
            }
        }
        flipped
    }

    fn distribute_to_leaves(
        &self,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        update: &GroupUpdate,
        stamp: &AuditStamp,
        touched: &mut Touched,
    ) -> Result<(), DemandError> {
        let leaves: Vec<(String, Decimal)> = snapshot
            .skus
            .values()
            .filter(|row| {
                row.site_id == update.site_id
                    && belongs(classifications, &row.sku, update.group_by, &update.group_key)
            })
            .map(|row| (row.sku.clone(), row.metrics.forecast))
            .collect();
        if leaves.is_empty() {
            return Err(group_not_found(update.group_by, &update.group_key, snapshot.scope));
        }

        let weights: Vec<Decimal> = leaves.iter().map(|(_, forecast)| *forecast).collect();
        let shares = split_proportional(update.forecast, &weights, self.scale)?;
        for ((sku, _), share) in leaves.iter().zip(shares) {
            let current =
                snapshot.sku(sku, update.site_id).map(|row| row.metrics.clone()).unwrap_or_default();
            let next = MetricsPatch::forecast(share).apply(&current);
            self.write_sku(snapshot, sku, update.site_id, next, stamp, touched);
        }
        for (sku, _) in &leaves {
            self.recompute_groups_for(snapshot, classifications, sku, update.site_id, stamp, touched)?;
        }
        Ok(())
    }

    fn recompute_groups_for(
        &self,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        sku: &str,
        site_id: i64,
        stamp: &AuditStamp,
        touched: &mut Touched,
    ) -> Result<(), DemandError> {
        let Some(classification) = classifications.get(sku) else {
            return Ok(());
        };
        for group_by in GroupBy::ALL {
            let Some(path) = classification.path(group_by) else {
                continue;
            };
            for prefix in path.prefixes() {
                let key = GroupKey { group_by, group_key: prefix.clone(), site_id };
                self.recompute_group(snapshot, classifications, key, stamp, touched)?;
                touched.groups.insert((group_by, prefix));
            }
        }
        Ok(())
    }

    fn recompute_all_sites(
        &self,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        stamp: &AuditStamp,
        touched: &mut Touched,
    ) -> Result<(), DemandError> {
        let skus: Vec<String> = touched.skus.iter().cloned().collect();
        for sku in &skus {
            let (metrics, present) = {
                let rows: Vec<&DemandMetrics> = snapshot
                    .skus
                    .values()
                    .filter(|row| &row.sku == sku && row.site_id != ALL_SITES)
                    .map(|row| &row.metrics)
                    .collect();
                let present = !rows.is_empty();
                (DemandMetrics::sum(rows)?, present)
            };
            if present {
                self.write_sku(snapshot, sku, ALL_SITES, metrics, stamp, touched);
            }
        }

        let groups: Vec<(GroupBy, GroupPath)> = touched.groups.iter().cloned().collect();
        for (group_by, group_key) in &groups {
            self.recompute_all_site_group(snapshot, classifications, *group_by, group_key, stamp, touched)?;
        }
        Ok(())
    }

    fn recompute_all_site_group(
        &self,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        group_by: GroupBy,
        group_key: &GroupPath,
        stamp: &AuditStamp,
        touched: &mut Touched,
    ) -> Result<(), DemandError> {
        let mut sites: BTreeSet<i64> = snapshot
            .skus
            .values()
            .filter(|row| {
                row.site_id != ALL_SITES && belongs(classifications, &row.sku, group_by, group_key)
            })
            .map(|row| row.site_id)
            .collect();
        sites.extend(
            snapshot
                .groups
                .keys()
                .filter(|key| {
                    key.group_by == group_by && &key.group_key == group_key && key.site_id != ALL_SITES
                })
                .map(|key| key.site_id),
        );

        for site_id in &sites {
            let key = GroupKey { group_by, group_key: group_key.clone(), site_id: *site_id };
            self.recompute_group(snapshot, classifications, key, stamp, touched)?;
        }

        let (metrics, number_of_skus) = {
            let rows: Vec<&GroupDemand> = sites
                .iter()
                .filter_map(|site_id| {
                    snapshot.groups.get(&GroupKey {
                        group_by,
                        group_key: group_key.clone(),
                        site_id: *site_id,
                    })
                })
                .collect();
            let number_of_skus = rows.iter().map(|row| row.number_of_skus).sum::<u32>();
            (DemandMetrics::sum(rows.into_iter().map(|row| &row.metrics))?, number_of_skus)
        };
        let key = GroupKey { group_by, group_key: group_key.clone(), site_id: ALL_SITES };
        self.write_group(snapshot, key, metrics, number_of_skus, stamp, touched);
        Ok(())
    }

    fn recompute_group(
        &self,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        key: GroupKey,
        stamp: &AuditStamp,
        touched: &mut Touched,
    ) -> Result<(), DemandError> {
        let (metrics, number_of_skus) = {
            let contributors: Vec<&DemandMetrics> = snapshot
                .skus
                .values()
                .filter(|row| {
                    row.site_id == key.site_id
                        && belongs(classifications, &row.sku, key.group_by, &key.group_key)
                })
                .map(|row| &row.metrics)
                .collect();
            let number_of_skus = contributors.len() as u32;
            (DemandMetrics::sum(contributors)?, number_of_skus)
        };
        self.write_group(snapshot, key, metrics, number_of_skus, stamp, touched);
        Ok(())
    }

    fn write_sku(
        &self,
        snapshot: &mut DemandSnapshot,
        sku: &str,
        site_id: i64,
        metrics: DemandMetrics,
        stamp: &AuditStamp,
        touched: &mut Touched,
    ) {
        let scope = snapshot.scope;
        let row = snapshot
            .skus
            .entry(SkuKey { sku: sku.to_owned(), site_id })
            .or_insert_with(|| SkuDemand::new(scope, sku, site_id, stamp));
        if row.metrics != metrics {
            row.metrics = metrics;
            row.updated_by = stamp.actor.clone();
            row.updated_at = stamp.at;
        }
        touched.skus.insert(sku.to_owned());
        touched.skus_written += 1;
    }

    fn write_group(
        &self,
        snapshot: &mut DemandSnapshot,
        key: GroupKey,
        metrics: DemandMetrics,
        number_of_skus: u32,
        stamp: &AuditStamp,
        touched: &mut Touched,
    ) {
        let scope = snapshot.scope;
        let row = snapshot
            .groups
            .entry(key)
            .or_insert_with_key(|key| GroupDemand::new(scope, key, stamp));
        if row.metrics != metrics || row.number_of_skus != number_of_skus || !row.is_latest_group {
            row.metrics = metrics;
            row.number_of_skus = number_of_skus;
            row.is_latest_group = true;
            row.updated_by = stamp.actor.clone();
            row.updated_at = stamp.at;
        }
        touched.groups_recomputed += 1;
    }
}

/// Splits `total` in proportion to `weights`, evenly when the weights sum to zero.
/// Shares are truncated at `scale`; the last share absorbs the remainder so the
/// parts add up to `total` exactly.
pub fn split_proportional(
    total: Decimal,
    weights: &[Decimal],
    scale: u32,
) -> Result<Vec<Decimal>, DomainError> {
    let overflow = || DomainError::MetricOverflow("forecast".to_owned());
    let count = weights.len();
    if count == 0 {
        return Ok(Vec::new());
    }
    let weight_sum = weights
        .iter()
        .try_fold(Decimal::ZERO, |sum, weight| sum.checked_add(*weight))
        .ok_or_else(overflow)?;

    let mut shares = Vec::with_capacity(count);
    let mut allocated = Decimal::ZERO;
    for weight in &weights[..count - 1] {
        let raw = if weight_sum.is_zero() {
            total.checked_div(Decimal::from(count))
        } else {
            total.checked_mul(*weight).and_then(|scaled| scaled.checked_div(weight_sum))
        }
        .ok_or_else(overflow)?;
        let share = raw.round_dp_with_strategy(scale, RoundingStrategy::ToZero);
        allocated = allocated.checked_add(share).ok_or_else(overflow)?;
        shares.push(share);
    }
    shares.push(total.checked_sub(allocated).ok_or_else(overflow)?);
    Ok(shares)
}

fn belongs(
    classifications: &ClassificationMap,
    sku: &str,
    group_by: GroupBy,
    group_key: &GroupPath,
) -> bool {
    classifications.get(sku).is_some_and(|class| class.belongs_to(group_by, group_key))
}

fn require_classification<'a>(
    classifications: &'a ClassificationMap,
    sku: &str,
    scope: DemandScope,
) -> Result<&'a SkuClassification, DemandError> {
    classifications
        .get(sku)
        .filter(|class| !class.is_unclassified())
        .ok_or_else(|| DemandError::ClassificationNotFound {
            subject: format!("sku {sku}"),
            month: scope.month,
        })
}

fn group_not_found(group_by: GroupBy, group_key: &GroupPath, scope: DemandScope) -> DemandError {
    DemandError::ClassificationNotFound {
        subject: format!("{group_by} group {group_key} of seller {}", scope.seller_id),
        month: scope.month,
    }
}
