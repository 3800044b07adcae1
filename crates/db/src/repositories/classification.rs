use sqlx::{sqlite::SqliteRow, Row};

use demandplan_core::domain::classification::{
    ClassificationMap, GroupBy, GroupPath, SkuClassification,
};
use demandplan_core::domain::demand::DemandScope;

use super::{ClassificationIndex, RepositoryError};
use crate::DbPool;

/// Classification index over the monthly path tables written by ingestion.
pub struct SqlClassificationIndex {
    pool: DbPool,
}

impl SqlClassificationIndex {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Records the path of `sku` in one hierarchy for the month.
    pub async fn record_sku_path(
        &self,
        scope: DemandScope,
        group_by: GroupBy,
        sku: &str,
        path: &GroupPath,
    ) -> Result<(), RepositoryError> {
        let sql = format!(
            "INSERT INTO {table} (seller_id, month_of_year, sku, {column})
             VALUES (?, ?, ?, ?)
             ON CONFLICT(seller_id, month_of_year, sku) DO UPDATE SET
                {column} = excluded.{column}",
            table = sku_path_table(group_by),
            column = sku_path_column(group_by),
        );
        sqlx::query(&sql)
            .bind(scope.seller_id)
            .bind(scope.month.to_string())
            .bind(sku)
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records a node that exists in the month's hierarchy.
    pub async fn record_group_path(
        &self,
        scope: DemandScope,
        group_by: GroupBy,
        path: &GroupPath,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO monthly_group_path (seller_id, month_of_year, group_by, group_path)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(seller_id, month_of_year, group_by, group_path) DO NOTHING",
        )
        .bind(scope.seller_id)
        .bind(scope.month.to_string())
        .bind(group_by.as_str())
        .bind(path.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_path(
        &self,
        scope: DemandScope,
        group_by: GroupBy,
        sku: &str,
    ) -> Result<Option<GroupPath>, RepositoryError> {
        let sql = format!(
            "SELECT {column} AS path FROM {table}
             WHERE seller_id = ? AND month_of_year = ? AND sku = ?",
            table = sku_path_table(group_by),
            column = sku_path_column(group_by),
        );
        let row = sqlx::query(&sql)
            .bind(scope.seller_id)
            .bind(scope.month.to_string())
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|row| path_from_row(row, "path")).transpose()
    }
}

#[async_trait::async_trait]
impl ClassificationIndex for SqlClassificationIndex {
    async fn resolve_category_path(
        &self,
        scope: DemandScope,
        sku: &str,
    ) -> Result<Option<GroupPath>, RepositoryError> {
        self.resolve_path(scope, GroupBy::Category, sku).await
    }

    async fn resolve_segment_path(
        &self,
        scope: DemandScope,
        sku: &str,
    ) -> Result<Option<GroupPath>, RepositoryError> {
        self.resolve_path(scope, GroupBy::Segment, sku).await
    }

    async fn resolve_month(&self, scope: DemandScope) -> Result<ClassificationMap, RepositoryError> {
        let mut map = ClassificationMap::new();

        for group_by in GroupBy::ALL {
            let sql = format!(
                "SELECT sku, {column} AS path FROM {table}
                 WHERE seller_id = ? AND month_of_year = ?",
                table = sku_path_table(group_by),
                column = sku_path_column(group_by),
            );
            let rows = sqlx::query(&sql)
                .bind(scope.seller_id)
                .bind(scope.month.to_string())
                .fetch_all(&self.pool)
                .await?;

            for row in &rows {
                let sku = row.try_get::<String, _>("sku")?;
                let path = path_from_row(row, "path")?;
                let entry = map.entry(sku).or_insert_with(SkuClassification::default);
                match group_by {
                    GroupBy::Category => entry.category = Some(path),
                    GroupBy::Segment => entry.segment = Some(path),
                }
            }
        }

        Ok(map)
    }

    async fn valid_group_paths(
        &self,
        scope: DemandScope,
        group_by: GroupBy,
    ) -> Result<Vec<GroupPath>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT group_path FROM monthly_group_path
             WHERE seller_id = ? AND month_of_year = ? AND group_by = ?
             ORDER BY group_path ASC",
        )
        .bind(scope.seller_id)
        .bind(scope.month.to_string())
        .bind(group_by.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| path_from_row(row, "group_path")).collect()
    }
}

fn sku_path_table(group_by: GroupBy) -> &'static str {
    match group_by {
        GroupBy::Category => "monthly_sku_category_path",
        GroupBy::Segment => "monthly_sku_segment_path",
    }
}

fn sku_path_column(group_by: GroupBy) -> &'static str {
    match group_by {
        GroupBy::Category => "category_path",
        GroupBy::Segment => "segment_path",
    }
}

fn path_from_row(row: &SqliteRow, column: &str) -> Result<GroupPath, RepositoryError> {
    let raw = row.try_get::<String, _>(column)?;
    GroupPath::parse(&raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid path in `{column}`: {error}")))
}

#[cfg(test)]
mod tests {
    use demandplan_core::domain::classification::{GroupBy, GroupPath};
    use demandplan_core::domain::demand::DemandScope;
    use demandplan_core::domain::month::MonthOfYear;

    use super::SqlClassificationIndex;
    use crate::repositories::ClassificationIndex;
    use crate::{connect_with_settings, migrations};

    fn scope(month: u32) -> DemandScope {
        DemandScope { seller_id: 7, month: MonthOfYear::new(2023, month).expect("month") }
    }

    fn path(value: &str) -> GroupPath {
        GroupPath::parse(value).expect("path")
    }

    async fn setup_index() -> SqlClassificationIndex {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlClassificationIndex::new(pool)
    }

    #[tokio::test]
    async fn paths_resolve_per_month() {
        let index = setup_index().await;
        index.record_sku_path(scope(11), GroupBy::Category, "sku1", &path("1/2")).await.expect("record");
        index.record_sku_path(scope(12), GroupBy::Category, "sku1", &path("1/3")).await.expect("record");
        index.record_sku_path(scope(11), GroupBy::Segment, "sku1", &path("A")).await.expect("record");

        assert_eq!(
            index.resolve_category_path(scope(11), "sku1").await.expect("resolve"),
            Some(path("1/2"))
        );
        assert_eq!(
            index.resolve_category_path(scope(12), "sku1").await.expect("resolve"),
            Some(path("1/3"))
        );
        assert_eq!(index.resolve_segment_path(scope(12), "sku1").await.expect("resolve"), None);
        assert_eq!(index.resolve_category_path(scope(11), "sku9").await.expect("resolve"), None);
    }

    #[tokio::test]
    async fn month_map_merges_both_hierarchies() {
        let index = setup_index().await;
        index.record_sku_path(scope(11), GroupBy::Category, "sku1", &path("1/2")).await.expect("record");
        index.record_sku_path(scope(11), GroupBy::Segment, "sku1", &path("A/B")).await.expect("record");
        index.record_sku_path(scope(11), GroupBy::Segment, "sku2", &path("A")).await.expect("record");

        let map = index.resolve_month(scope(11)).await.expect("month");
        assert_eq!(map.len(), 2);
        assert_eq!(map["sku1"].category, Some(path("1/2")));
        assert_eq!(map["sku1"].segment, Some(path("A/B")));
        assert_eq!(map["sku2"].category, None);
    }

    #[tokio::test]
    async fn valid_group_paths_are_sorted_and_deduplicated() {
        let index = setup_index().await;
        for value in ["1/3", "1/2", "1/2"] {
            index.record_group_path(scope(11), GroupBy::Category, &path(value)).await.expect("record");
        }
        index.record_group_path(scope(11), GroupBy::Segment, &path("A")).await.expect("record");

        assert_eq!(
            index.valid_group_paths(scope(11), GroupBy::Category).await.expect("paths"),
            vec![path("1/2"), path("1/3")]
        );
    }
}
