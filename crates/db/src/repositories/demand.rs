use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};

use demandplan_core::domain::classification::{GroupBy, GroupPath};
use demandplan_core::domain::daily::{DailyForecast, DailyForecastId, DailyPlan};
use demandplan_core::domain::demand::{
    AggregateRef, AuditStamp, DemandLevel, DemandMetrics, DemandScope, GroupDemand, GroupDemandId,
    SkuDemand, SkuDemandId,
};
use demandplan_core::rollup::DemandSnapshot;

use super::codec::{
    encode_timestamp, parse_decimal, parse_month, parse_optional_decimal, parse_timestamp,
    parse_u32,
};
use super::schedule_job::insert_job;
use super::{DemandChangeSet, DemandStore, DemandUnitOfWork, RepositoryError};
use crate::DbPool;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const SKU_COLUMNS: &str = "id, seller_id, sku, site_id, month_of_year,
    budget, forecast, actual_sale, previous_month_sale, current_inventory_value,
    forecast_inventory_value, avg_sell_price, avg_purchase_price, handover_qty, pickup_qty,
    created_by, updated_by, created_at, updated_at";

const GROUP_COLUMNS: &str = "id, seller_id, group_by, group_key, site_id, month_of_year,
    budget, forecast, actual_sale, previous_month_sale, current_inventory_value,
    forecast_inventory_value, avg_sell_price, avg_purchase_price, handover_qty, pickup_qty,
    number_of_skus, is_latest_group, created_by, updated_by, created_at, updated_at";

pub struct SqlDemandStore {
    pool: DbPool,
}

impl SqlDemandStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DemandStore for SqlDemandStore {
    async fn begin(&self, scope: DemandScope) -> Result<Box<dyn DemandUnitOfWork>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Writing first takes sqlite's write lock before anything is read, so a
        // second job on any scope waits here instead of working on stale rows.
        sqlx::query(
            "INSERT INTO demand_scope_lock (seller_id, month_of_year, locked_at)
             VALUES (?, ?, ?)
             ON CONFLICT(seller_id, month_of_year) DO UPDATE SET
                locked_at = excluded.locked_at",
        )
        .bind(scope.seller_id)
        .bind(scope.month.to_string())
        .bind(encode_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;

        Ok(Box::new(SqlDemandUnitOfWork { scope, tx }))
    }

    async fn find_sku_demand(&self, id: &SkuDemandId) -> Result<Option<SkuDemand>, RepositoryError> {
        let sql = format!("SELECT {SKU_COLUMNS} FROM sku_demand WHERE id = ?");
        let row = sqlx::query(&sql).bind(&id.0).fetch_optional(&self.pool).await?;
        row.as_ref().map(sku_from_row).transpose()
    }

    async fn find_group_demand(
        &self,
        id: &GroupDemandId,
    ) -> Result<Option<GroupDemand>, RepositoryError> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM group_demand WHERE id = ?");
        let row = sqlx::query(&sql).bind(&id.0).fetch_optional(&self.pool).await?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn list_sku_demands(&self, scope: DemandScope) -> Result<Vec<SkuDemand>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        select_skus(&mut conn, scope).await
    }

    async fn list_group_demands(
        &self,
        scope: DemandScope,
    ) -> Result<Vec<GroupDemand>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        select_groups(&mut conn, scope).await
    }

    async fn list_daily_forecasts(
        &self,
        parent: &AggregateRef,
    ) -> Result<Vec<DailyForecast>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        select_daily(&mut conn, parent).await
    }

    async fn find_daily_forecast(
        &self,
        level: DemandLevel,
        id: &DailyForecastId,
    ) -> Result<Option<DailyForecast>, RepositoryError> {
        let table = DailyTable::for_level(level);
        let sql = format!(
            "SELECT id, {parent} AS parent_id, seller_id, month_of_year, day, forecast,
                    updated_by, created_at, updated_at
             FROM {name}
             WHERE id = ?",
            parent = table.parent_column,
            name = table.name,
        );
        let row = sqlx::query(&sql).bind(&id.0).fetch_optional(&self.pool).await?;
        row.as_ref().map(|row| daily_from_row(row, level)).transpose()
    }
}

pub struct SqlDemandUnitOfWork {
    scope: DemandScope,
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl DemandUnitOfWork for SqlDemandUnitOfWork {
    fn scope(&self) -> DemandScope {
        self.scope
    }

    async fn load_snapshot(&mut self) -> Result<DemandSnapshot, RepositoryError> {
        let skus = select_skus(&mut self.tx, self.scope).await?;
        let groups = select_groups(&mut self.tx, self.scope).await?;
        Ok(DemandSnapshot::new(self.scope, skus, groups))
    }

    async fn daily_forecasts(
        &mut self,
        parent: &AggregateRef,
    ) -> Result<Vec<DailyForecast>, RepositoryError> {
        select_daily(&mut self.tx, parent).await
    }

    async fn commit(self: Box<Self>, changes: DemandChangeSet) -> Result<(), RepositoryError> {
        let SqlDemandUnitOfWork { scope, mut tx } = *self;

        for row in &changes.skus {
            upsert_sku(&mut tx, row).await?;
        }
        for row in &changes.groups {
            upsert_group(&mut tx, row).await?;
        }
        for plan in &changes.daily_plans {
            apply_plan(&mut tx, plan, &changes.stamp).await?;
        }
        for created in &changes.jobs {
            insert_job(&mut tx, created).await?;
        }
        tx.commit().await?;

        tracing::debug!(
            event_name = "demand.scope.committed",
            seller_id = scope.seller_id,
            month_of_year = %scope.month,
            skus = changes.skus.len(),
            groups = changes.groups.len(),
            daily_plans = changes.daily_plans.len(),
            jobs = changes.jobs.len(),
            "scope changes committed"
        );
        Ok(())
    }
}

struct DailyTable {
    name: &'static str,
    parent_column: &'static str,
}

impl DailyTable {
    fn for_level(level: DemandLevel) -> Self {
        match level {
            DemandLevel::Sku => Self { name: "sku_daily_forecast", parent_column: "sku_demand_id" },
            DemandLevel::Group => {
                Self { name: "group_daily_forecast", parent_column: "group_demand_id" }
            }
        }
    }
}

async fn select_skus(
    conn: &mut SqliteConnection,
    scope: DemandScope,
) -> Result<Vec<SkuDemand>, RepositoryError> {
    let sql = format!(
        "SELECT {SKU_COLUMNS} FROM sku_demand
         WHERE seller_id = ? AND month_of_year = ?
         ORDER BY sku ASC, site_id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(scope.seller_id)
        .bind(scope.month.to_string())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(sku_from_row).collect()
}

async fn select_groups(
    conn: &mut SqliteConnection,
    scope: DemandScope,
) -> Result<Vec<GroupDemand>, RepositoryError> {
    let sql = format!(
        "SELECT {GROUP_COLUMNS} FROM group_demand
         WHERE seller_id = ? AND month_of_year = ?
         ORDER BY group_by ASC, group_key ASC, site_id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(scope.seller_id)
        .bind(scope.month.to_string())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(group_from_row).collect()
}

async fn select_daily(
    conn: &mut SqliteConnection,
    parent: &AggregateRef,
) -> Result<Vec<DailyForecast>, RepositoryError> {
    let level = parent.level();
    let table = DailyTable::for_level(level);
    let sql = format!(
        "SELECT id, {parent} AS parent_id, seller_id, month_of_year, day, forecast,
                updated_by, created_at, updated_at
         FROM {name}
         WHERE {parent} = ?
         ORDER BY day ASC",
        parent = table.parent_column,
        name = table.name,
    );
    let rows = sqlx::query(&sql).bind(parent.id()).fetch_all(&mut *conn).await?;
    rows.iter().map(|row| daily_from_row(row, level)).collect()
}

async fn upsert_sku(conn: &mut SqliteConnection, row: &SkuDemand) -> Result<(), RepositoryError> {
    let query = sqlx::query(
        "INSERT INTO sku_demand (
            id, seller_id, sku, site_id, month_of_year,
            budget, forecast, actual_sale, previous_month_sale, current_inventory_value,
            forecast_inventory_value, avg_sell_price, avg_purchase_price, handover_qty, pickup_qty,
            created_by, updated_by, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            budget = excluded.budget,
            forecast = excluded.forecast,
            actual_sale = excluded.actual_sale,
            previous_month_sale = excluded.previous_month_sale,
            current_inventory_value = excluded.current_inventory_value,
            forecast_inventory_value = excluded.forecast_inventory_value,
            avg_sell_price = excluded.avg_sell_price,
            avg_purchase_price = excluded.avg_purchase_price,
            handover_qty = excluded.handover_qty,
            pickup_qty = excluded.pickup_qty,
            updated_by = excluded.updated_by,
            updated_at = excluded.updated_at",
    )
    .bind(row.id.0.clone())
    .bind(row.seller_id)
    .bind(row.sku.clone())
    .bind(row.site_id)
    .bind(row.month.to_string());

    bind_metrics(query, &row.metrics)
        .bind(row.created_by.clone())
        .bind(row.updated_by.clone())
        .bind(encode_timestamp(row.created_at))
        .bind(encode_timestamp(row.updated_at))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn upsert_group(conn: &mut SqliteConnection, row: &GroupDemand) -> Result<(), RepositoryError> {
    let query = sqlx::query(
        "INSERT INTO group_demand (
            id, seller_id, group_by, group_key, site_id, month_of_year,
            budget, forecast, actual_sale, previous_month_sale, current_inventory_value,
            forecast_inventory_value, avg_sell_price, avg_purchase_price, handover_qty, pickup_qty,
            number_of_skus, is_latest_group, created_by, updated_by, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            budget = excluded.budget,
            forecast = excluded.forecast,
            actual_sale = excluded.actual_sale,
            previous_month_sale = excluded.previous_month_sale,
            current_inventory_value = excluded.current_inventory_value,
            forecast_inventory_value = excluded.forecast_inventory_value,
            avg_sell_price = excluded.avg_sell_price,
            avg_purchase_price = excluded.avg_purchase_price,
            handover_qty = excluded.handover_qty,
            pickup_qty = excluded.pickup_qty,
            number_of_skus = excluded.number_of_skus,
            is_latest_group = excluded.is_latest_group,
            updated_by = excluded.updated_by,
            updated_at = excluded.updated_at",
    )
    .bind(row.id.0.clone())
    .bind(row.seller_id)
    .bind(row.group_by.as_str())
    .bind(row.group_key.as_str().to_owned())
    .bind(row.site_id)
    .bind(row.month.to_string());

    bind_metrics(query, &row.metrics)
        .bind(i64::from(row.number_of_skus))
        .bind(row.is_latest_group)
        .bind(row.created_by.clone())
        .bind(row.updated_by.clone())
        .bind(encode_timestamp(row.created_at))
        .bind(encode_timestamp(row.updated_at))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Deletes the plan's cleared tail, then writes its days. Days before
/// `clear_from_day` are never touched.
async fn apply_plan(
    conn: &mut SqliteConnection,
    plan: &DailyPlan,
    stamp: &AuditStamp,
) -> Result<(), RepositoryError> {
    let table = DailyTable::for_level(plan.parent.level());

    if let Some(from_day) = plan.clear_from_day {
        let sql = format!(
            "DELETE FROM {name} WHERE {parent} = ? AND day >= ?",
            name = table.name,
            parent = table.parent_column,
        );
        sqlx::query(&sql)
            .bind(plan.parent.id().to_owned())
            .bind(i64::from(from_day))
            .execute(&mut *conn)
            .await?;
    }

    let sql = format!(
        "INSERT INTO {name} (
            id, {parent}, seller_id, month_of_year, day, forecast, updated_by, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT({parent}, day) DO UPDATE SET
            forecast = excluded.forecast,
            updated_by = excluded.updated_by,
            updated_at = excluded.updated_at",
        name = table.name,
        parent = table.parent_column,
    );
    let at = encode_timestamp(stamp.at);
    for day in &plan.days {
        sqlx::query(&sql)
            .bind(DailyForecastId::generate().0)
            .bind(plan.parent.id().to_owned())
            .bind(plan.seller_id)
            .bind(plan.month.to_string())
            .bind(i64::from(day.day))
            .bind(day.forecast.to_string())
            .bind(stamp.actor.clone())
            .bind(at.clone())
            .bind(at.clone())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn bind_metrics<'q>(query: SqliteQuery<'q>, metrics: &DemandMetrics) -> SqliteQuery<'q> {
    query
        .bind(metrics.budget.to_string())
        .bind(metrics.forecast.to_string())
        .bind(metrics.actual_sale.to_string())
        .bind(metrics.previous_month_sale.to_string())
        .bind(metrics.current_inventory_value.to_string())
        .bind(metrics.forecast_inventory_value.to_string())
        .bind(metrics.avg_sell_price.map(|price| price.to_string()))
        .bind(metrics.avg_purchase_price.map(|price| price.to_string()))
        .bind(metrics.handover_qty.to_string())
        .bind(metrics.pickup_qty.to_string())
}

fn metrics_from_row(row: &SqliteRow) -> Result<DemandMetrics, RepositoryError> {
    Ok(DemandMetrics {
        budget: parse_decimal("budget", row.try_get("budget")?)?,
        forecast: parse_decimal("forecast", row.try_get("forecast")?)?,
        actual_sale: parse_decimal("actual_sale", row.try_get("actual_sale")?)?,
        previous_month_sale: parse_decimal(
            "previous_month_sale",
            row.try_get("previous_month_sale")?,
        )?,
        current_inventory_value: parse_decimal(
            "current_inventory_value",
            row.try_get("current_inventory_value")?,
        )?,
        forecast_inventory_value: parse_decimal(
            "forecast_inventory_value",
            row.try_get("forecast_inventory_value")?,
        )?,
        avg_sell_price: parse_optional_decimal("avg_sell_price", row.try_get("avg_sell_price")?)?,
        avg_purchase_price: parse_optional_decimal(
            "avg_purchase_price",
            row.try_get("avg_purchase_price")?,
        )?,
        handover_qty: parse_decimal("handover_qty", row.try_get("handover_qty")?)?,
        pickup_qty: parse_decimal("pickup_qty", row.try_get("pickup_qty")?)?,
    })
}

fn sku_from_row(row: &SqliteRow) -> Result<SkuDemand, RepositoryError> {
    Ok(SkuDemand {
        id: SkuDemandId(row.try_get("id")?),
        seller_id: row.try_get("seller_id")?,
        sku: row.try_get("sku")?,
        site_id: row.try_get("site_id")?,
        month: parse_month("month_of_year", row.try_get("month_of_year")?)?,
        metrics: metrics_from_row(row)?,
        created_by: row.try_get("created_by")?,
        updated_by: row.try_get("updated_by")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn group_from_row(row: &SqliteRow) -> Result<GroupDemand, RepositoryError> {
    let group_by_raw = row.try_get::<String, _>("group_by")?;
    let group_by = GroupBy::parse(&group_by_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown group_by `{group_by_raw}`")))?;
    let group_key_raw = row.try_get::<String, _>("group_key")?;
    let group_key = GroupPath::parse(&group_key_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid group_key: {error}")))?;

    Ok(GroupDemand {
        id: GroupDemandId(row.try_get("id")?),
        seller_id: row.try_get("seller_id")?,
        group_by,
        group_key,
        site_id: row.try_get("site_id")?,
        month: parse_month("month_of_year", row.try_get("month_of_year")?)?,
        metrics: metrics_from_row(row)?,
        number_of_skus: parse_u32("number_of_skus", row.try_get("number_of_skus")?)?,
        is_latest_group: row.try_get("is_latest_group")?,
        created_by: row.try_get("created_by")?,
        updated_by: row.try_get("updated_by")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn daily_from_row(row: &SqliteRow, level: DemandLevel) -> Result<DailyForecast, RepositoryError> {
    let parent_id = row.try_get::<String, _>("parent_id")?;
    let parent = match level {
        DemandLevel::Sku => AggregateRef::Sku(SkuDemandId(parent_id)),
        DemandLevel::Group => AggregateRef::Group(GroupDemandId(parent_id)),
    };

    Ok(DailyForecast {
        id: DailyForecastId(row.try_get("id")?),
        parent,
        seller_id: row.try_get("seller_id")?,
        month: parse_month("month_of_year", row.try_get("month_of_year")?)?,
        day: parse_u32("day", row.try_get("day")?)?,
        forecast: parse_decimal("forecast", row.try_get("forecast")?)?,
        updated_by: row.try_get("updated_by")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
