use super::model::{EventRow, EventWrite, ScrobbleRow};
use crate::model::{DateRange, DictionaryKind, Place, ReportedEvent};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const IN_CHUNK: usize = 500;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        // WAL and stricter durability.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(?err, path = %parent.display(), "failed to create database directory");
            }
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Atomic get-or-create of a dictionary entry by name. A known MBID fills a
/// previously empty one but never overwrites it.
#[instrument(skip_all, fields(table = kind.table()))]
pub async fn get_or_create_dictionary(
    pool: &Pool,
    kind: DictionaryKind,
    name: &str,
    mbid: Option<&str>,
) -> Result<i64> {
    let table = kind.table();
    let sql = format!(
        "INSERT INTO {table} (name, mbid) VALUES (?, ?) \
         ON CONFLICT(name) DO UPDATE SET mbid = COALESCE({table}.mbid, excluded.mbid) \
         RETURNING id"
    );
    let id: i64 = sqlx::query_scalar(&sql)
        .bind(name)
        .bind(mbid)
        .fetch_one(pool)
        .await
        .with_context(|| format!("get-or-create {} '{}'", table, name))?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn known_place_ids(pool: &Pool, ids: &[i64]) -> Result<HashSet<i64>> {
    let mut known = HashSet::new();
    for chunk in ids.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT place_id FROM places WHERE place_id IN ({})",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        known.extend(query.fetch_all(pool).await?);
    }
    Ok(known)
}

#[instrument(skip_all)]
pub async fn load_places(pool: &Pool, ids: &[i64]) -> Result<HashMap<i64, Place>> {
    let mut places = HashMap::new();
    for chunk in ids.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT place_id, title, address FROM places WHERE place_id IN ({})",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        for row in query.fetch_all(pool).await? {
            let place = Place {
                id: row.get("place_id"),
                title: row.get("title"),
                address: row.get("address"),
            };
            places.insert(place.id, place);
        }
    }
    Ok(places)
}

fn event_row(row: &SqliteRow) -> EventRow {
    EventRow {
        event_id: row.get("event_id"),
        title: row.get("title"),
        slug: row.get("slug"),
        place_id: row.get("place_id"),
        price: row.get("price"),
        fingerprint: row.get("fingerprint"),
        is_sent: row.get("is_sent"),
        updated: row.get("updated"),
    }
}

#[instrument(skip_all)]
pub async fn find_event(pool: &Pool, event_id: i64) -> Result<Option<EventRow>> {
    let row = sqlx::query(
        "SELECT event_id, title, slug, place_id, price, fingerprint, is_sent, updated \
         FROM events WHERE event_id = ?",
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(event_row))
}

pub async fn event_dates(pool: &Pool, event_id: i64) -> Result<Vec<DateRange>> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT date_start, date_stop FROM event_dates WHERE event_id = ? ORDER BY date_start, date_stop",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(start, end)| DateRange { start, end })
        .collect())
}

/// Persist one cycle's places and events in a single transaction: places
/// first, then each event, then its date rows.
#[instrument(skip_all, fields(places = places.len(), events = events.len()))]
pub async fn persist_events(
    pool: &Pool,
    places: &[Place],
    events: &[EventWrite<'_>],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for place in places {
        upsert_place_tx(&mut tx, place).await?;
    }
    for write in events {
        write_event_tx(&mut tx, write).await?;
    }
    tx.commit().await.context("commit events")?;
    Ok(())
}

async fn upsert_place_tx(tx: &mut Transaction<'_, Sqlite>, place: &Place) -> Result<()> {
    sqlx::query(
        "INSERT INTO places (place_id, title, address) VALUES (?, ?, ?) \
         ON CONFLICT(place_id) DO UPDATE SET title = excluded.title, address = excluded.address",
    )
    .bind(place.id)
    .bind(&place.title)
    .bind(&place.address)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("upsert place {}", place.id))?;
    Ok(())
}

async fn write_event_tx(tx: &mut Transaction<'_, Sqlite>, write: &EventWrite<'_>) -> Result<()> {
    let event = write.candidate;
    if write.replace {
        sqlx::query("DELETE FROM event_dates WHERE event_id = ?")
            .bind(event.id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM events WHERE event_id = ?")
            .bind(event.id)
            .execute(&mut **tx)
            .await?;
    }

    sqlx::query(
        "INSERT INTO events (event_id, title, slug, place_id, price, fingerprint, is_sent, updated) \
         VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(event.id)
    .bind(&event.title)
    .bind(&event.slug)
    .bind(event.place_id())
    .bind(&event.price)
    .bind(write.fingerprint)
    .bind(write.replace)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("insert event {}", event.id))?;

    for date in &event.dates {
        sqlx::query(
            "INSERT INTO event_dates (event_id, date_start, date_stop) VALUES (?, ?, ?) \
             ON CONFLICT(event_id, date_start, date_stop) DO NOTHING",
        )
        .bind(event.id)
        .bind(date.start)
        .bind(date.end)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn scrobble_exists(pool: &Pool, scrobbled_at: i64) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM scrobbles WHERE scrobbled_at = ?")
        .bind(scrobbled_at)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// Bulk insert; rows whose timestamp already exists are skipped. Returns rows written.
#[instrument(skip_all, fields(rows = rows.len()))]
pub async fn insert_scrobbles(pool: &Pool, rows: &[ScrobbleRow]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut written = 0;
    for row in rows {
        let res = sqlx::query(
            "INSERT INTO scrobbles (artist_id, album_id, track_id, scrobbled_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(scrobbled_at) DO NOTHING",
        )
        .bind(row.artist_id)
        .bind(row.album_id)
        .bind(row.track_id)
        .bind(row.scrobbled_at)
        .execute(&mut *tx)
        .await?;
        written += res.rows_affected();
    }
    tx.commit().await.context("commit scrobbles")?;
    Ok(written)
}

/// Events not yet delivered, with place and dates, oldest id first.
#[instrument(skip_all)]
pub async fn unsent_events(pool: &Pool) -> Result<Vec<ReportedEvent>> {
    let rows = sqlx::query(
        "SELECT e.event_id, e.title, e.slug, e.price, e.updated, \
                p.place_id, p.title AS place_title, p.address AS place_address \
         FROM events e LEFT JOIN places p ON p.place_id = e.place_id \
         WHERE e.is_sent = 0 ORDER BY e.event_id",
    )
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let event_id: i64 = row.get("event_id");
        let place = row
            .get::<Option<i64>, _>("place_id")
            .map(|id| Place {
                id,
                title: row.get("place_title"),
                address: row.get("place_address"),
            });
        events.push(ReportedEvent {
            event_id,
            title: row.get("title"),
            slug: row.get("slug"),
            price: row.get("price"),
            place,
            dates: event_dates(pool, event_id).await?,
            updated: row.get("updated"),
        });
    }
    Ok(events)
}

#[instrument(skip_all)]
pub async fn mark_event_sent(pool: &Pool, event_id: i64) -> Result<()> {
    let res = sqlx::query("UPDATE events SET is_sent = 1 WHERE event_id = ?")
        .bind(event_id)
        .execute(pool)
        .await
        .context("failed to mark event sent")?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("event {} not found", event_id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn add_sync_log(pool: &Pool, cycle: &str, level: &str, message: &str) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO sync_log (cycle, level, message) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(cycle)
    .bind(level)
    .bind(message)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}
