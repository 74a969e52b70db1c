use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::entity::{EntityStatus, OwnerKind, OwnerRef, OwningEntity};

fn table(kind: OwnerKind) -> &'static str {
    match kind {
        OwnerKind::Subject => "subjects",
        OwnerKind::Photoshoot => "photoshoots",
    }
}

/// Load a subject with its reference locators
pub async fn get_subject(pool: &PgPool, id: Uuid) -> Result<Option<OwningEntity>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, status, prompt, face_refs, body_refs, asset_ids, warnings
        FROM subjects
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(OwningEntity {
            owner: OwnerRef::subject(id),
            subject_id: id,
            status: r.try_get("status")?,
            prompt: r.try_get("prompt")?,
            settings: serde_json::Value::Object(Default::default()),
            face_refs: r.try_get("face_refs")?,
            body_refs: r.try_get("body_refs")?,
            asset_ids: r.try_get("asset_ids")?,
            warnings: r.try_get("warnings")?,
        })
    })
    .transpose()
}

/// Load a photoshoot. Reference locators come from the parent subject.
pub async fn get_photoshoot(pool: &PgPool, id: Uuid) -> Result<Option<OwningEntity>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT p.subject_id, p.status, p.prompt, p.settings, p.asset_ids, p.warnings,
               s.face_refs, s.body_refs
        FROM photoshoots p
        JOIN subjects s ON s.id = p.subject_id
        WHERE p.id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(OwningEntity {
            owner: OwnerRef::photoshoot(id),
            subject_id: r.try_get("subject_id")?,
            status: r.try_get("status")?,
            prompt: r.try_get("prompt")?,
            settings: r.try_get("settings")?,
            face_refs: r.try_get("face_refs")?,
            body_refs: r.try_get("body_refs")?,
            asset_ids: r.try_get("asset_ids")?,
            warnings: r.try_get("warnings")?,
        })
    })
    .transpose()
}

/// Append asset references and advance status in one statement
pub async fn append_assets(
    pool: &PgPool,
    owner: OwnerRef,
    asset_ids: &[Uuid],
    status: EntityStatus,
) -> Result<(), sqlx::Error> {
    let query = format!(
        "UPDATE {} SET asset_ids = asset_ids || $2, status = $3 WHERE id = $1",
        table(owner.kind)
    );
    sqlx::query(&query)
        .bind(owner.id)
        .bind(asset_ids)
        .bind(status.as_ref())
        .execute(pool)
        .await?;

    Ok(())
}

/// Update entity status
pub async fn set_status(
    pool: &PgPool,
    owner: OwnerRef,
    status: EntityStatus,
) -> Result<(), sqlx::Error> {
    let query = format!("UPDATE {} SET status = $2 WHERE id = $1", table(owner.kind));
    sqlx::query(&query)
        .bind(owner.id)
        .bind(status.as_ref())
        .execute(pool)
        .await?;

    Ok(())
}

/// Append non-fatal warnings shown next to the entity
pub async fn add_warnings(
    pool: &PgPool,
    owner: OwnerRef,
    warnings: &[String],
) -> Result<(), sqlx::Error> {
    if warnings.is_empty() {
        return Ok(());
    }
    let query = format!(
        "UPDATE {} SET warnings = warnings || $2 WHERE id = $1",
        table(owner.kind)
    );
    sqlx::query(&query)
        .bind(owner.id)
        .bind(warnings)
        .execute(pool)
        .await?;

    Ok(())
}
