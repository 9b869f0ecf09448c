use crate::database::models::*;
use crate::error::DoozerError;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::{FromRow, Row, SqlitePool};

/// A build handed to an agent by the claim transaction.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub revision: String,
    pub target: String,
    pub project: String,
    pub version: String,
    pub no_output: bool,
    pub jobsecret: String,
}

/// Where the bytes of an artifact live, resolved through its build row.
#[derive(Debug, Clone)]
pub struct ArtifactLocation {
    pub storage: String,
    pub payload: Vec<u8>,
    pub project: String,
    pub name: String,
    pub artifact_type: String,
    pub contenttype: Option<String>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExpiredBuild {
    pub id: i64,
    pub project: String,
    pub revision: String,
    pub agent: Option<String>,
    pub attempts: i64,
}

pub struct Queries;

impl Queries {
    pub async fn insert_build(
        pool: &SqlitePool,
        project: &str,
        revision: &str,
        target: &str,
        reason: &str,
        version: &str,
        no_output: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO build
                (project, revision, target, reason, status, version, no_output, attempts, created)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, 0, ?)
            "#,
        )
        .bind(project)
        .bind(revision)
        .bind(target)
        .bind(reason)
        .bind(version)
        .bind(no_output)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Targets that already have a build row (any status) at a revision.
    pub async fn targets_built_at(
        pool: &SqlitePool,
        revision: &str,
        project: &str,
    ) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT target FROM build WHERE revision = ? AND project = ?
            "#,
        )
        .bind(revision)
        .bind(project)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    /// Claim the oldest pending build among `targets` for `agent`.
    ///
    /// The row moves to `building` with a fresh jobsecret inside one
    /// transaction; a concurrent claimer that wins the race leaves the
    /// conditional UPDATE with zero affected rows, which surfaces as a
    /// transient error so the long-poll retries.
    pub async fn claim_build(
        pool: &SqlitePool,
        targets: &[String],
        agent: &str,
    ) -> Result<ClaimedJob, DoozerError> {
        if targets.is_empty() {
            return Err(DoozerError::BadRequest("No targets".to_string()));
        }

        let placeholders = vec!["?"; targets.len()].join(",");
        let select = format!(
            "SELECT id, revision, target, project, version, no_output \
             FROM build WHERE status = 'pending' AND target IN ({}) \
             ORDER BY created LIMIT 1",
            placeholders
        );

        let mut tx = pool.begin().await.map_err(transient)?;

        let mut q = sqlx::query(&select);
        for t in targets {
            q = q.bind(t);
        }
        let row = q.fetch_optional(&mut *tx).await.map_err(transient)?;

        let row = match row {
            Some(r) => r,
            None => return Err(DoozerError::NoData),
        };

        let id: i64 = row.get(0);
        let jobsecret = format!("{}", rand::thread_rng().gen::<u32>());
        let now = Utc::now();

        let updated = sqlx::query(
            r#"
            UPDATE build
            SET agent = ?, status = 'building', status_change = ?, buildstart = ?,
                attempts = attempts + 1, jobsecret = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(agent)
        .bind(now)
        .bind(now)
        .bind(&jobsecret)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(transient)?;

        if updated.rows_affected() != 1 {
            tx.rollback().await.ok();
            return Err(DoozerError::Transient("Claim raced by another agent".to_string()));
        }

        tx.commit().await.map_err(transient)?;

        Ok(ClaimedJob {
            id,
            revision: row.get(1),
            target: row.get(2),
            project: row.get(3),
            version: row.get(4),
            no_output: row.get::<i64, _>(5) != 0,
            jobsecret,
        })
    }

    pub async fn get_build(pool: &SqlitePool, id: i64) -> Result<Option<Build>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM build WHERE id = ?",
            BUILD_FIELDS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        match row {
            Some(r) => Ok(Some(BuildRow::from_row(&r)?.into())),
            None => Ok(None),
        }
    }

    pub async fn update_progress(
        pool: &SqlitePool,
        msg: &str,
        id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE build SET progress_text = ?, status_change = ? WHERE id = ?
            "#,
        )
        .bind(msg)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Terminal transition; guarded so a finished build never changes again.
    pub async fn finish_build(
        pool: &SqlitePool,
        status: BuildStatus,
        msg: Option<&str>,
        id: i64,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE build
            SET status = ?, progress_text = ?, status_change = ?, buildend = ?
            WHERE id = ? AND status = 'building'
            "#,
        )
        .bind(status.as_str())
        .bind(msg)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Builds stuck in `building` whose last status change predates `cutoff`.
    pub async fn expired_builds(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ExpiredBuild>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, project, revision, agent, attempts
            FROM build
            WHERE status = 'building' AND status_change <= ?
            "#,
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ExpiredBuild {
                id: r.get(0),
                project: r.get(1),
                revision: r.get(2),
                agent: r.get(3),
                attempts: r.get(4),
            })
            .collect())
    }

    /// Move a build out of `building` after its claim expired.
    pub async fn restart_build(
        pool: &SqlitePool,
        status: BuildStatus,
        id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE build SET status = ?, status_change = ?, jobsecret = NULL
            WHERE id = ? AND status = 'building'
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_artifact(
        pool: &SqlitePool,
        build_id: i64,
        artifact_type: &str,
        payload: &[u8],
        storage: Storage,
        name: &str,
        size: i64,
        md5: &str,
        sha1: &str,
        contenttype: Option<&str>,
        encoding: Option<&str>,
        origsize: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO artifact
                (build_id, type, payload, storage, name, size, md5, sha1,
                 contenttype, encoding, origsize, dlcount, patchcount, created)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?)
            "#,
        )
        .bind(build_id)
        .bind(artifact_type)
        .bind(payload)
        .bind(storage.as_str())
        .bind(name)
        .bind(size)
        .bind(md5)
        .bind(sha1)
        .bind(contenttype)
        .bind(encoding)
        .bind(origsize)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Resolve an artifact's bytes by content address. Several rows may share
    /// one sha1; any of them locates the same content.
    pub async fn artifact_by_sha1(
        pool: &SqlitePool,
        sha1: &str,
    ) -> Result<Option<ArtifactLocation>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT artifact.storage, artifact.payload, build.project, artifact.name,
                   artifact.type, artifact.contenttype, artifact.encoding
            FROM artifact, build
            WHERE artifact.sha1 = ? AND build.id = artifact.build_id
            "#,
        )
        .bind(sha1)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|r| ArtifactLocation {
            storage: r.get(0),
            payload: r.get(1),
            project: r.get(2),
            name: r.get(3),
            artifact_type: r.get(4),
            contenttype: r.get(5),
            encoding: r.get(6),
        }))
    }

    pub async fn increase_dlcount(pool: &SqlitePool, sha1: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE artifact SET dlcount = dlcount + 1 WHERE sha1 = ?")
            .bind(sha1)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn increase_patchcount(pool: &SqlitePool, sha1: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE artifact SET patchcount = patchcount + 1 WHERE sha1 = ?")
            .bind(sha1)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn artifacts_for_build(
        pool: &SqlitePool,
        build_id: i64,
    ) -> Result<Vec<Artifact>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM artifact WHERE build_id = ?",
            ARTIFACT_FIELDS
        ))
        .bind(build_id)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|r| ArtifactRow::from_row(r).map(Into::into))
            .collect()
    }

    /// Done builds at one revision, newest row first.
    pub async fn done_builds_at_revision(
        pool: &SqlitePool,
        revision: &str,
        project: &str,
    ) -> Result<Vec<(i64, String, String)>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, target, version
            FROM build
            WHERE revision = ? AND project = ? AND status = 'done'
            ORDER BY id DESC
            "#,
        )
        .bind(revision)
        .bind(project)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get(0), r.get(1), r.get(2)))
            .collect())
    }

    pub async fn list_builds(
        pool: &SqlitePool,
        project: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Build>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM build WHERE project = ? \
             ORDER BY created DESC LIMIT ? OFFSET ?",
            BUILD_FIELDS
        ))
        .bind(project)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|r| BuildRow::from_row(r).map(Into::into))
            .collect()
    }

    pub async fn count_builds(pool: &SqlitePool, project: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT count(*) FROM build WHERE project = ?")
            .bind(project)
            .fetch_one(pool)
            .await
    }

    pub async fn get_build_for_project(
        pool: &SqlitePool,
        id: i64,
        project: &str,
    ) -> Result<Option<Build>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM build WHERE id = ? AND project = ?",
            BUILD_FIELDS
        ))
        .bind(id)
        .bind(project)
        .fetch_optional(pool)
        .await?;

        match row {
            Some(r) => Ok(Some(BuildRow::from_row(&r)?.into())),
            None => Ok(None),
        }
    }

    pub async fn builds_by_revision(
        pool: &SqlitePool,
        revision: &str,
        project: &str,
    ) -> Result<Vec<Build>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM build WHERE revision = ? AND project = ?",
            BUILD_FIELDS
        ))
        .bind(revision)
        .bind(project)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|r| BuildRow::from_row(r).map(Into::into))
            .collect()
    }

    /// Delete builds of a project by status, tombstoning their artifacts so
    /// the reaper can drop the stored bytes. `keep_ids` protects builds that
    /// are still referenced by release manifests.
    pub async fn delete_builds(
        pool: &SqlitePool,
        project: &str,
        status: BuildStatus,
        keep_ids: &[i64],
        dry_run: bool,
    ) -> Result<u64, DoozerError> {
        let mut tx = pool.begin().await?;

        let not_in = if keep_ids.is_empty() {
            String::new()
        } else {
            format!(
                " AND build.id NOT IN ({})",
                keep_ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            )
        };

        sqlx::query(&format!(
            "INSERT INTO deleted_artifact (name, storage, payload, project) \
             SELECT artifact.name, artifact.storage, artifact.payload, build.project \
             FROM artifact, build \
             WHERE build.id = artifact.build_id AND build.project = ? AND build.status = ?{}",
            not_in
        ))
        .bind(project)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "DELETE FROM artifact WHERE build_id IN \
             (SELECT id FROM build WHERE project = ? AND status = ?{})",
            not_in
        ))
        .bind(project)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM build WHERE project = ? AND status = ?{}",
            not_in
        ))
        .bind(project)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        if dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }

        Ok(deleted.rows_affected())
    }

    /// One tombstone the reaper has not failed on yet.
    pub async fn next_deleted_artifact(
        pool: &SqlitePool,
    ) -> Result<Option<DeletedArtifact>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, name, storage, payload, project
            FROM deleted_artifact WHERE error IS NULL LIMIT 1
            "#,
        )
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|r| DeletedArtifact {
            id: r.get(0),
            name: r.get(1),
            storage: r.get(2),
            payload: r.get(3),
            project: r.get(4),
            error: None,
        }))
    }

    pub async fn drop_deleted_artifact(pool: &SqlitePool, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM deleted_artifact WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn fail_deleted_artifact(
        pool: &SqlitePool,
        error: &str,
        id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE deleted_artifact SET error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

fn transient(e: sqlx::Error) -> DoozerError {
    DoozerError::Transient(e.to_string())
}

const BUILD_FIELDS: &str = "id, project, revision, target, version, reason, status, \
     agent, jobsecret, attempts, no_output, created, status_change, buildstart, buildend, \
     progress_text";

const ARTIFACT_FIELDS: &str = "id, build_id, type, name, storage, payload, size, md5, sha1, \
     contenttype, encoding, origsize, dlcount, patchcount, created";

// Helper structs for SQLx FromRow
#[derive(Debug)]
struct BuildRow {
    id: i64,
    project: String,
    revision: String,
    target: String,
    version: String,
    reason: String,
    status: String,
    agent: Option<String>,
    jobsecret: Option<String>,
    attempts: i64,
    no_output: bool,
    created: DateTime<Utc>,
    status_change: Option<DateTime<Utc>>,
    buildstart: Option<DateTime<Utc>>,
    buildend: Option<DateTime<Utc>>,
    progress_text: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for BuildRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(BuildRow {
            id: row.get(0),
            project: row.get(1),
            revision: row.get(2),
            target: row.get(3),
            version: row.get(4),
            reason: row.get(5),
            status: row.get(6),
            agent: row.get(7),
            jobsecret: row.get(8),
            attempts: row.get(9),
            no_output: row.get::<i64, _>(10) != 0,
            created: row.get(11),
            status_change: row.get(12),
            buildstart: row.get(13),
            buildend: row.get(14),
            progress_text: row.get(15),
        })
    }
}

impl From<BuildRow> for Build {
    fn from(row: BuildRow) -> Self {
        Build {
            id: row.id,
            project: row.project,
            revision: row.revision,
            target: row.target,
            version: row.version,
            reason: row.reason,
            status: row.status,
            agent: row.agent,
            jobsecret: row.jobsecret,
            attempts: row.attempts,
            no_output: row.no_output,
            created: row.created,
            status_change: row.status_change,
            buildstart: row.buildstart,
            buildend: row.buildend,
            progress_text: row.progress_text,
        }
    }
}

#[derive(Debug)]
struct ArtifactRow {
    id: i64,
    build_id: i64,
    artifact_type: String,
    name: String,
    storage: String,
    payload: Vec<u8>,
    size: i64,
    md5: String,
    sha1: String,
    contenttype: Option<String>,
    encoding: Option<String>,
    origsize: i64,
    dlcount: i64,
    patchcount: i64,
    created: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for ArtifactRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(ArtifactRow {
            id: row.get(0),
            build_id: row.get(1),
            artifact_type: row.get(2),
            name: row.get(3),
            storage: row.get(4),
            payload: row.get(5),
            size: row.get(6),
            md5: row.get(7),
            sha1: row.get(8),
            contenttype: row.get(9),
            encoding: row.get(10),
            origsize: row.get(11),
            dlcount: row.get(12),
            patchcount: row.get(13),
            created: row.get(14),
        })
    }
}

impl From<ArtifactRow> for Artifact {
    fn from(row: ArtifactRow) -> Self {
        Artifact {
            id: row.id,
            build_id: row.build_id,
            artifact_type: row.artifact_type,
            name: row.name,
            storage: row.storage,
            payload: row.payload,
            size: row.size,
            md5: row.md5,
            sha1: row.sha1,
            contenttype: row.contenttype,
            encoding: row.encoding,
            origsize: row.origsize,
            dlcount: row.dlcount,
            patchcount: row.patchcount,
            created: row.created,
        }
    }
}
