//! Module de gestion de la base de données SQLite du cache vidéo
//!
//! Une seule table logique indexée par `asset_id`, avec deux index
//! secondaires : l'empreinte de l'URL source et la date du dernier accès
//! (ce dernier sert à choisir les victimes de l'éviction sans tri complet).
//!
//! Chaque méthode publique correspond à une transaction autonome.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

const TABLE: &str = "entries";

/// Entrée de cache complète, payload compris
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub asset_id: String,
    pub source_url: String,
    pub source_fingerprint: String,
    pub payload: Bytes,
    pub metadata: Option<Value>,
    pub cached_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub schema_version: u32,
}

/// Vue d'une entrée sans son payload (listing, statistiques)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntrySummary {
    pub asset_id: String,
    pub source_url: String,
    pub source_fingerprint: String,
    pub metadata: Option<Value>,
    pub cached_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub schema_version: u32,
}

/// Données d'une nouvelle entrée à écrire
#[derive(Debug)]
pub struct NewEntry<'a> {
    pub asset_id: &'a str,
    pub source_url: &'a str,
    pub source_fingerprint: &'a str,
    pub payload: &'a [u8],
    pub metadata_json: Option<&'a str>,
    pub timestamp: i64,
    pub schema_version: u32,
}

/// Victime d'une éviction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub asset_id: String,
    pub size_bytes: u64,
}

/// Résultat d'une recherche avec contrôle d'empreinte
#[derive(Debug)]
pub enum Lookup<T> {
    /// Aucune entrée pour cet asset
    Absent,
    /// Une entrée existait mais pointait vers une autre source ; elle a été supprimée
    Stale,
    /// Entrée valide
    Found(T),
}

/// Agrégats bruts de la table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawStats {
    pub total_bytes: u64,
    pub entry_count: u64,
    pub oldest_cached_at: Option<i64>,
    pub newest_cached_at: Option<i64>,
}

/// Convertit un horodatage en microsecondes vers un `DateTime<Utc>`
pub fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn parse_metadata(json: Option<String>) -> Option<Value> {
    json.and_then(|s| serde_json::from_str(&s).ok())
}

const SUMMARY_COLUMNS: &str = "asset_id, source_url, source_fingerprint, metadata_json, \
     cached_at, last_accessed_at, size_bytes, schema_version";

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<EntrySummary> {
    Ok(EntrySummary {
        asset_id: row.get(0)?,
        source_url: row.get(1)?,
        source_fingerprint: row.get(2)?,
        metadata: parse_metadata(row.get(3)?),
        cached_at: micros_to_datetime(row.get(4)?),
        last_accessed_at: micros_to_datetime(row.get(5)?),
        size_bytes: row.get::<_, i64>(6)?.max(0) as u64,
        schema_version: row.get(7)?,
    })
}

/// Base de données SQLite du cache vidéo
#[derive(Debug)]
pub struct DB {
    conn: Mutex<Connection>,
}

impl DB {
    /// Ouvre (ou crée) la base de données et son schéma
    ///
    /// # Arguments
    ///
    /// * `path` - Chemin vers le fichier de base de données SQLite
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Base en mémoire, pour les tests
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {TABLE} (
                    asset_id TEXT PRIMARY KEY,
                    source_url TEXT NOT NULL,
                    source_fingerprint TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    metadata_json TEXT,
                    cached_at INTEGER NOT NULL,
                    last_accessed_at INTEGER NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    schema_version INTEGER NOT NULL
                )"
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{TABLE}_fingerprint ON {TABLE} (source_fingerprint)"
            ),
            [],
        )?;

        // Index pour la politique LRU
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{TABLE}_lru ON {TABLE} (last_accessed_at ASC)"
            ),
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Supprime toutes les entrées dont la version de schéma diffère
    ///
    /// # Returns
    ///
    /// Les couples `(asset_id, schema_version)` supprimés
    pub fn purge_schema_mismatch(&self, current: u32) -> rusqlite::Result<Vec<(String, u32)>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let stale = {
            let mut stmt = tx.prepare(&format!(
                "SELECT asset_id, schema_version FROM {TABLE} WHERE schema_version != ?1"
            ))?;
            let rows = stmt
                .query_map([current], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, u32)>>>()?;
            rows
        };

        tx.execute(
            &format!("DELETE FROM {TABLE} WHERE schema_version != ?1"),
            [current],
        )?;
        tx.commit()?;

        Ok(stale)
    }

    /// Évince les entrées les moins récemment utilisées jusqu'à respecter les budgets
    ///
    /// Utilisé à l'initialisation, quand les budgets ont pu baisser entre deux exécutions.
    pub fn trim_to(&self, max_bytes: u64, max_count: u64) -> rusqlite::Result<Vec<Evicted>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let (total, count) = Self::totals(&tx)?;

        let bytes_needed = total.saturating_sub(max_bytes);
        let count_needed = count.saturating_sub(max_count);
        let victims = Self::evict_lru(&tx, bytes_needed, count_needed)?;

        tx.commit()?;
        Ok(victims)
    }

    /// Écrit une entrée après avoir fait la place nécessaire
    ///
    /// L'éviction (LRU strict sur `last_accessed_at`) et l'écriture sont faites
    /// dans la même transaction : les budgets ne sont jamais dépassés, même
    /// transitoirement. Une entrée existante pour le même `asset_id` est
    /// remplacée et sa taille ne compte pas dans le calcul.
    ///
    /// # Returns
    ///
    /// Les entrées évincées pour faire de la place
    pub fn insert_with_eviction(
        &self,
        entry: &NewEntry<'_>,
        max_bytes: u64,
        max_count: u64,
    ) -> rusqlite::Result<Vec<Evicted>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            &format!("DELETE FROM {TABLE} WHERE asset_id = ?1"),
            [entry.asset_id],
        )?;

        let size = entry.payload.len() as u64;
        let (total, count) = Self::totals(&tx)?;
        let bytes_needed = (total + size).saturating_sub(max_bytes);
        let count_needed = (count + 1).saturating_sub(max_count);
        let victims = Self::evict_lru(&tx, bytes_needed, count_needed)?;

        tx.execute(
            &format!(
                "INSERT INTO {TABLE} (asset_id, source_url, source_fingerprint, payload, metadata_json,
                                      cached_at, last_accessed_at, size_bytes, schema_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)"
            ),
            params![
                entry.asset_id,
                entry.source_url,
                entry.source_fingerprint,
                entry.payload,
                entry.metadata_json,
                entry.timestamp,
                size as i64,
                entry.schema_version,
            ],
        )?;

        tx.commit()?;
        Ok(victims)
    }

    fn totals(tx: &Transaction<'_>) -> rusqlite::Result<(u64, u64)> {
        tx.query_row(
            &format!("SELECT COALESCE(SUM(size_bytes), 0), COUNT(*) FROM {TABLE}"),
            [],
            |row| {
                let total: i64 = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((total.max(0) as u64, count.max(0) as u64))
            },
        )
    }

    /// Supprime le plus court préfixe LRU libérant `bytes_needed` octets et `count_needed` entrées
    fn evict_lru(
        tx: &Transaction<'_>,
        bytes_needed: u64,
        count_needed: u64,
    ) -> rusqlite::Result<Vec<Evicted>> {
        if bytes_needed == 0 && count_needed == 0 {
            return Ok(Vec::new());
        }

        let mut victims = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT asset_id, size_bytes FROM {TABLE} ORDER BY last_accessed_at ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut freed = 0u64;

            while let Some(row) = rows.next()? {
                if freed >= bytes_needed && victims.len() as u64 >= count_needed {
                    break;
                }
                let size = row.get::<_, i64>(1)?.max(0) as u64;
                freed += size;
                victims.push(Evicted {
                    asset_id: row.get(0)?,
                    size_bytes: size,
                });
            }
        }

        let sql = format!("DELETE FROM {TABLE} WHERE asset_id = ?1");
        for victim in &victims {
            tx.execute(&sql, [&victim.asset_id])?;
        }

        Ok(victims)
    }

    /// Récupère une entrée et met à jour sa date d'accès
    ///
    /// Si l'empreinte stockée diffère de `fingerprint`, l'entrée est supprimée
    /// et [`Lookup::Stale`] est retourné.
    pub fn fetch_and_touch(
        &self,
        asset_id: &str,
        fingerprint: &str,
        now: i64,
    ) -> rusqlite::Result<Lookup<CacheEntry>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let found = tx
            .query_row(
                &format!(
                    "SELECT asset_id, source_url, source_fingerprint, payload, metadata_json,
                            cached_at, size_bytes, schema_version
                     FROM {TABLE} WHERE asset_id = ?1"
                ),
                [asset_id],
                |row| {
                    Ok(CacheEntry {
                        asset_id: row.get(0)?,
                        source_url: row.get(1)?,
                        source_fingerprint: row.get(2)?,
                        payload: Bytes::from(row.get::<_, Vec<u8>>(3)?),
                        metadata: parse_metadata(row.get(4)?),
                        cached_at: micros_to_datetime(row.get(5)?),
                        last_accessed_at: micros_to_datetime(now),
                        size_bytes: row.get::<_, i64>(6)?.max(0) as u64,
                        schema_version: row.get(7)?,
                    })
                },
            )
            .optional()?;

        let lookup = match found {
            None => Lookup::Absent,
            Some(entry) if entry.source_fingerprint != fingerprint => {
                tx.execute(
                    &format!("DELETE FROM {TABLE} WHERE asset_id = ?1"),
                    [asset_id],
                )?;
                Lookup::Stale
            }
            Some(entry) => {
                tx.execute(
                    &format!("UPDATE {TABLE} SET last_accessed_at = ?1 WHERE asset_id = ?2"),
                    params![now, asset_id],
                )?;
                Lookup::Found(entry)
            }
        };

        tx.commit()?;
        Ok(lookup)
    }

    /// Vérifie la présence d'une entrée valide sans lire son payload
    ///
    /// Une entrée périmée (empreinte différente) est supprimée. Avec
    /// `touch_at`, la date d'accès d'une entrée valide est mise à jour.
    pub fn probe(
        &self,
        asset_id: &str,
        fingerprint: &str,
        touch_at: Option<i64>,
    ) -> rusqlite::Result<Lookup<()>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let stored: Option<String> = tx
            .query_row(
                &format!("SELECT source_fingerprint FROM {TABLE} WHERE asset_id = ?1"),
                [asset_id],
                |row| row.get(0),
            )
            .optional()?;

        let lookup = match stored {
            None => Lookup::Absent,
            Some(fp) if fp != fingerprint => {
                tx.execute(
                    &format!("DELETE FROM {TABLE} WHERE asset_id = ?1"),
                    [asset_id],
                )?;
                Lookup::Stale
            }
            Some(_) => {
                if let Some(now) = touch_at {
                    tx.execute(
                        &format!("UPDATE {TABLE} SET last_accessed_at = ?1 WHERE asset_id = ?2"),
                        params![now, asset_id],
                    )?;
                }
                Lookup::Found(())
            }
        };

        tx.commit()?;
        Ok(lookup)
    }

    /// Supprime une entrée
    ///
    /// # Returns
    ///
    /// `true` si une entrée a effectivement été supprimée
    pub fn delete(&self, asset_id: &str) -> rusqlite::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("DELETE FROM {TABLE} WHERE asset_id = ?1");
        Ok(conn.execute(&sql, [asset_id])? > 0)
    }

    /// Purge toutes les entrées de la base de données
    ///
    /// # Returns
    ///
    /// Le nombre d'entrées supprimées
    pub fn purge(&self) -> rusqlite::Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(&format!("DELETE FROM {TABLE}"), [])
    }

    /// Agrégats : octets totaux, nombre d'entrées, bornes de `cached_at`
    pub fn stats(&self) -> rusqlite::Result<RawStats> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT COALESCE(SUM(size_bytes), 0), COUNT(*), MIN(cached_at), MAX(cached_at)
                 FROM {TABLE}"
            ),
            [],
            |row| {
                let total: i64 = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok(RawStats {
                    total_bytes: total.max(0) as u64,
                    entry_count: count.max(0) as u64,
                    oldest_cached_at: row.get(2)?,
                    newest_cached_at: row.get(3)?,
                })
            },
        )
    }

    /// Liste toutes les entrées (sans payload), de la moins à la plus récemment utilisée
    pub fn list(&self) -> rusqlite::Result<Vec<EntrySummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM {TABLE} ORDER BY last_accessed_at ASC"
        ))?;

        let entries = stmt
            .query_map([], summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Récupère uniquement les métadonnées JSON d'une entrée
    ///
    /// # Returns
    ///
    /// `None` si l'entrée n'existe pas ou n'a pas de métadonnées
    pub fn get_metadata(&self, asset_id: &str) -> rusqlite::Result<Option<Value>> {
        let conn = self.conn.lock().unwrap();
        let json: Option<Option<String>> = conn
            .query_row(
                &format!("SELECT metadata_json FROM {TABLE} WHERE asset_id = ?1"),
                [asset_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(parse_metadata(json.flatten()))
    }

    /// Plus grand horodatage présent en base (pour réamorcer l'horloge du store)
    pub fn max_timestamp(&self) -> rusqlite::Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT MAX(MAX(cached_at), MAX(last_accessed_at)) FROM {TABLE}"),
            [],
            |row| row.get(0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry<'a>(id: &'a str, payload: &'a [u8], ts: i64) -> NewEntry<'a> {
        NewEntry {
            asset_id: id,
            source_url: "https://example.com/a.mp4",
            source_fingerprint: "fp",
            payload,
            metadata_json: None,
            timestamp: ts,
            schema_version: 1,
        }
    }

    #[test]
    fn test_insert_replaces_same_asset() {
        let db = DB::open_in_memory().unwrap();
        db.insert_with_eviction(&entry("a", &[0; 10], 1), 100, 10)
            .unwrap();
        db.insert_with_eviction(&entry("a", &[0; 20], 2), 100, 10)
            .unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_bytes, 20);
    }

    #[test]
    fn test_eviction_deletes_shortest_lru_prefix() {
        let db = DB::open_in_memory().unwrap();
        db.insert_with_eviction(&entry("a", &[0; 30], 1), 100, 10)
            .unwrap();
        db.insert_with_eviction(&entry("b", &[0; 30], 2), 100, 10)
            .unwrap();
        db.insert_with_eviction(&entry("c", &[0; 30], 3), 100, 10)
            .unwrap();

        // 90 + 40 > 100 : il faut libérer 30 octets, "a" suffit
        let evicted = db
            .insert_with_eviction(&entry("d", &[0; 40], 4), 100, 10)
            .unwrap();
        assert_eq!(
            evicted,
            vec![Evicted {
                asset_id: "a".into(),
                size_bytes: 30
            }]
        );
        assert_eq!(db.stats().unwrap().total_bytes, 100);
    }

    #[test]
    fn test_fetch_and_touch_removes_stale() {
        let db = DB::open_in_memory().unwrap();
        db.insert_with_eviction(&entry("a", b"xyz", 1), 100, 10)
            .unwrap();

        assert!(matches!(
            db.fetch_and_touch("a", "other", 2).unwrap(),
            Lookup::Stale
        ));
        assert!(matches!(db.probe("a", "fp", None).unwrap(), Lookup::Absent));
    }

    #[test]
    fn test_probe_touch_updates_access_time_only_when_asked() {
        let db = DB::open_in_memory().unwrap();
        db.insert_with_eviction(&entry("a", b"xyz", 1), 100, 10)
            .unwrap();

        assert!(matches!(db.probe("a", "fp", None).unwrap(), Lookup::Found(())));
        assert_eq!(db.max_timestamp().unwrap(), Some(1));

        assert!(matches!(db.probe("a", "fp", Some(7)).unwrap(), Lookup::Found(())));
        assert_eq!(db.max_timestamp().unwrap(), Some(7));
    }

    #[test]
    fn test_fetch_and_touch_updates_access_time() {
        let db = DB::open_in_memory().unwrap();
        db.insert_with_eviction(&entry("a", b"xyz", 1), 100, 10)
            .unwrap();

        match db.fetch_and_touch("a", "fp", 42).unwrap() {
            Lookup::Found(e) => assert_eq!(&e.payload[..], b"xyz"),
            other => panic!("unexpected lookup {other:?}"),
        }
        let listed = db.list().unwrap();
        assert_eq!(listed[0].last_accessed_at, micros_to_datetime(42));
        assert_eq!(listed[0].cached_at, micros_to_datetime(1));
        assert_eq!(db.max_timestamp().unwrap(), Some(42));
    }

    #[test]
    fn test_purge_schema_mismatch() {
        let db = DB::open_in_memory().unwrap();
        db.insert_with_eviction(&entry("old", b"1", 1), 100, 10)
            .unwrap();
        let mut fresh = entry("new", b"2", 2);
        fresh.schema_version = 2;
        db.insert_with_eviction(&fresh, 100, 10).unwrap();

        let purged = db.purge_schema_mismatch(2).unwrap();
        assert_eq!(purged, vec![("old".to_string(), 1)]);
        assert_eq!(db.stats().unwrap().entry_count, 1);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let db = DB::open_in_memory().unwrap();
        let mut e = entry("a", b"1", 1);
        e.metadata_json = Some(r#"{"quality":"hd"}"#);
        db.insert_with_eviction(&e, 100, 10).unwrap();

        let meta = db.get_metadata("a").unwrap().unwrap();
        assert_eq!(meta["quality"], "hd");
        assert_eq!(db.get_metadata("missing").unwrap(), None);
    }
}
