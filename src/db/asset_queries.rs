use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::models::asset::{Asset, AssetType, NewAsset};

const ASSET_COLUMNS: &str = "id, subject_id, photoshoot_id, asset_type, bucket, object_path, \
     original_filename, metadata, created_at, updated_at";

fn asset_from_row(row: &PgRow) -> Result<Asset, sqlx::Error> {
    let asset_type: String = row.try_get("asset_type")?;
    let asset_type = asset_type
        .parse::<AssetType>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Asset {
        id: row.try_get("id")?,
        subject_id: row.try_get("subject_id")?,
        photoshoot_id: row.try_get("photoshoot_id")?,
        asset_type,
        bucket: row.try_get("bucket")?,
        object_path: row.try_get("object_path")?,
        original_filename: row.try_get("original_filename")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert an asset row. Photoshoot assets also get their join row, in the
/// same transaction, positioned after any existing ones.
pub async fn insert_asset(pool: &PgPool, asset: &NewAsset) -> Result<Asset, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let query = format!(
        "INSERT INTO assets (subject_id, photoshoot_id, asset_type, bucket, object_path, \
                             original_filename, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING {ASSET_COLUMNS}"
    );
    let row = sqlx::query(&query)
        .bind(asset.subject_id)
        .bind(asset.photoshoot_id)
        .bind(asset.asset_type.as_ref())
        .bind(&asset.bucket)
        .bind(&asset.object_path)
        .bind(&asset.original_filename)
        .bind(&asset.metadata)
        .fetch_one(&mut *tx)
        .await?;
    let inserted = asset_from_row(&row)?;

    if let Some(photoshoot_id) = asset.photoshoot_id {
        sqlx::query(
            r#"
            INSERT INTO photoshoot_assets (photoshoot_id, asset_id, position)
            SELECT $1, $2, COALESCE(MAX(position) + 1, 0)
            FROM photoshoot_assets
            WHERE photoshoot_id = $1
            "#,
        )
        .bind(photoshoot_id)
        .bind(inserted.id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Fetch assets by id, in the order given
pub async fn get_assets(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<Asset>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let query = format!(
        "SELECT {ASSET_COLUMNS} FROM assets \
         WHERE id = ANY($1) \
         ORDER BY array_position($1, id)"
    );
    let rows = sqlx::query(&query).bind(ids).fetch_all(pool).await?;

    rows.iter().map(asset_from_row).collect()
}
