use async_trait::async_trait;
use cadence_core::models::{NewTrack, Track, TrackStatus, UploadStatus};
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::error::{is_unique_violation, DbError, DbResult};
use crate::repository::TrackStore;

const TRACK_COLUMNS: &str = r#"
    id,
    owner_id,
    title,
    artist,
    album,
    genre,
    duration_sec,
    bpm,
    loudness_lufs,
    status,
    audio_128_key,
    audio_320_key,
    waveform_json_key,
    cover_key,
    original_key,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct PgTrackStore {
    pool: PgPool,
}

impl PgTrackStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Plain INSERT: a duplicate id must surface, never overwrite.
async fn insert_track<'e, E>(executor: E, track: &NewTrack) -> DbResult<Track>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        r#"
        INSERT INTO tracks (
            id, owner_id, title, artist, album, genre, duration_sec, bpm, loudness_lufs,
            status, audio_128_key, audio_320_key, waveform_json_key, cover_key, original_key
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING {TRACK_COLUMNS}
        "#
    );

    sqlx::query_as::<Postgres, Track>(&sql)
        .bind(track.id)
        .bind(track.owner_id)
        .bind(&track.title)
        .bind(&track.artist)
        .bind(&track.album)
        .bind(&track.genre)
        .bind(track.duration_sec)
        .bind(track.bpm)
        .bind(track.loudness_lufs)
        .bind(TrackStatus::Ready)
        .bind(&track.audio_128_key)
        .bind(&track.audio_320_key)
        .bind(&track.waveform_json_key)
        .bind(&track.cover_key)
        .bind(&track.original_key)
        .fetch_one(executor)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                tracing::error!(
                    track_id = %track.id,
                    "Track already exists; manual cleanup required"
                );
                DbError::AlreadyMaterialized(track.id)
            } else {
                tracing::error!(error = %e, track_id = %track.id, "Failed to insert track");
                DbError::Database(e)
            }
        })
}

#[async_trait]
impl TrackStore for PgTrackStore {
    #[tracing::instrument(skip(self, track), fields(track_id = %track.id))]
    async fn create(&self, track: NewTrack) -> DbResult<Track> {
        track.check_ready().map_err(DbError::Invalid)?;

        let created = insert_track(&self.pool, &track).await?;

        tracing::info!(
            track_id = %created.id,
            owner_id = %created.owner_id,
            duration_sec = created.duration_sec,
            "Track created"
        );

        Ok(created)
    }

    #[tracing::instrument(skip(self, track), fields(track_id = %track.id))]
    async fn materialize(&self, track: NewTrack, upload_id: Uuid) -> DbResult<Track> {
        track.check_ready().map_err(DbError::Invalid)?;

        let mut tx = self.pool.begin().await?;

        let created = insert_track(&mut *tx, &track).await?;

        let completed = sqlx::query(
            r#"
            UPDATE uploads
            SET status = $2, error = NULL, updated_at = NOW()
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(upload_id)
        .bind(UploadStatus::Completed)
        .bind(UploadStatus::Processing)
        .execute(&mut *tx)
        .await?;

        if completed.rows_affected() == 0 {
            let current = sqlx::query_scalar::<Postgres, UploadStatus>(
                "SELECT status FROM uploads WHERE id = $1",
            )
            .bind(upload_id)
            .fetch_optional(&mut *tx)
            .await?;

            // dropping `tx` rolls the track insert back
            return Err(match current {
                Some(from) => DbError::InvalidTransition {
                    id: upload_id,
                    from,
                    to: UploadStatus::Completed,
                },
                None => DbError::NotFound(upload_id),
            });
        }

        tx.commit().await?;

        tracing::info!(
            track_id = %created.id,
            upload_id = %upload_id,
            duration_sec = created.duration_sec,
            "Track materialized, upload completed"
        );

        Ok(created)
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, id: Uuid) -> DbResult<Option<Track>> {
        let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = $1");
        let track = sqlx::query_as::<Postgres, Track>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(track)
    }

    #[tracing::instrument(skip(self))]
    async fn list_by_owner(&self, owner_id: Uuid) -> DbResult<Vec<Track>> {
        let sql = format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE owner_id = $1 ORDER BY created_at DESC"
        );
        let tracks = sqlx::query_as::<Postgres, Track>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(tracks)
    }
}
