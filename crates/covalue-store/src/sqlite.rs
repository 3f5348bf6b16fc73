//! SQLite implementation of the Storage trait.
//!
//! This is the persistent storage backend. It uses rusqlite with bundled
//! SQLite; headers and transactions are stored as CBOR blobs.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, Transaction as SqlTransaction};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, trace};

use covalue_core::{
    CoValueHeader, CoValueId, ContentPiece, KnownState, SessionCounts, SessionId, Signature,
    Transaction,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::record::{fit, Fit, StoredCoValue};
use crate::traits::{Storage, StoreOutcome};

/// SQLite-based storage.
///
/// Thread-safe via internal Mutex.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut conn)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_signature(bytes: Vec<u8>) -> Result<Signature> {
    let len = bytes.len();
    <[u8; 64]>::try_from(bytes)
        .map(Signature)
        .map_err(|_| StoreError::InvalidData(format!("signature of {len} bytes")))
}

fn has_header(conn: &Connection, id: &CoValueId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM covalues WHERE covalue_id = ?1",
            params![id.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn session_counts(conn: &Connection, id: &CoValueId) -> Result<SessionCounts> {
    let mut stmt = conn.prepare(
        "SELECT session_id, tx_count FROM sessions
         WHERE covalue_id = ?1 AND tx_count > 0",
    )?;
    let rows = stmt
        .query_map(params![id.as_bytes().as_slice()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(session, count)| -> Result<(SessionId, u32)> {
            Ok((SessionId::parse(&session)?, count as u32))
        })
        .collect()
}

fn read_covalue(conn: &Connection, id: &CoValueId) -> Result<Option<StoredCoValue>> {
    let header: Option<Vec<u8>> = conn
        .query_row(
            "SELECT header FROM covalues WHERE covalue_id = ?1",
            params![id.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(header) = header else {
        return Ok(None);
    };
    let mut stored = StoredCoValue::new(*id, decode::<CoValueHeader>(&header)?);

    let mut stmt = conn.prepare(
        "SELECT session_id, tx FROM transactions
         WHERE covalue_id = ?1
         ORDER BY session_id, idx",
    )?;
    let rows = stmt
        .query_map(params![id.as_bytes().as_slice()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (session, tx) in rows {
        let session = SessionId::parse(&session)?;
        let tx: Transaction = decode(&tx)?;
        stored.sessions.entry(session).or_default().transactions.push(tx);
    }

    let mut stmt = conn.prepare(
        "SELECT session_id, idx, signature FROM signatures WHERE covalue_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![id.as_bytes().as_slice()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (session, idx, signature) in rows {
        let session = SessionId::parse(&session)?;
        let Some(entry) = stored.sessions.get_mut(&session) else {
            return Err(StoreError::InvalidData(format!(
                "signature for {session} without transactions"
            )));
        };
        entry.signatures.insert(idx as u32, decode_signature(signature)?);
    }

    Ok(Some(stored))
}

fn write_piece(tx: &SqlTransaction<'_>, piece: &ContentPiece, mut counts: SessionCounts) -> Result<()> {
    let id = piece.id.as_bytes().as_slice();
    if let Some(header) = &piece.header {
        tx.execute(
            "INSERT OR IGNORE INTO covalues (covalue_id, header, stored_at) VALUES (?1, ?2, ?3)",
            params![id, encode(header)?, now_millis()],
        )?;
    }

    for (session, content) in &piece.new {
        let have = counts.get(session).copied().unwrap_or(0);
        let skip = (have - content.after) as usize;
        if skip >= content.new_transactions.len() {
            continue;
        }
        let session_text = session.to_string();

        for (offset, transaction) in content.new_transactions[skip..].iter().enumerate() {
            tx.execute(
                "INSERT INTO transactions (covalue_id, session_id, idx, tx) VALUES (?1, ?2, ?3, ?4)",
                params![id, session_text, have as i64 + offset as i64, encode(transaction)?],
            )?;
        }
        let new_count = content.end();
        tx.execute(
            "INSERT INTO sessions (covalue_id, session_id, tx_count) VALUES (?1, ?2, ?3)
             ON CONFLICT(covalue_id, session_id) DO UPDATE SET tx_count = excluded.tx_count",
            params![id, session_text, new_count as i64],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO signatures (covalue_id, session_id, idx, signature)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, session_text, new_count as i64 - 1, content.last_signature.0.as_slice()],
        )?;
        counts.insert(*session, new_count);
    }
    Ok(())
}

impl Storage for SqliteStorage {
    fn load(&self, id: &CoValueId, on_chunk: &mut dyn FnMut(ContentPiece)) -> Result<bool> {
        let Some(stored) = self.with_conn(|conn| read_covalue(conn, id))? else {
            return Ok(false);
        };
        for piece in stored.pieces() {
            on_chunk(piece);
        }
        Ok(true)
    }

    fn store(&self, pieces: &[ContentPiece]) -> Result<StoreOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut outcome = StoreOutcome::Stored;

            for piece in pieces {
                let header = has_header(&tx, &piece.id)?;
                let counts = session_counts(&tx, &piece.id)?;
                match fit(piece, header, |s| counts.get(s).copied().unwrap_or(0)) {
                    Fit::Continues => write_piece(&tx, piece, counts)?,
                    Fit::MissingHeader | Fit::Gap => {
                        trace!(id = %piece.id, "stored content does not continue");
                        outcome = StoreOutcome::CorrectionNeeded(KnownState {
                            id: piece.id,
                            header,
                            sessions: counts,
                        });
                        break;
                    }
                }
            }

            tx.commit()?;
            if let StoreOutcome::CorrectionNeeded(known) = &outcome {
                debug!(id = %known.id, "storage requests correction");
            }
            Ok(outcome)
        })
    }

    fn known_state(&self, id: &CoValueId) -> Result<Option<KnownState>> {
        self.with_conn(|conn| {
            if !has_header(conn, id)? {
                return Ok(None);
            }
            Ok(Some(KnownState {
                id: *id,
                header: true,
                sessions: session_counts(conn, id)?,
            }))
        })
    }

    fn ids(&self) -> Result<Vec<CoValueId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT covalue_id FROM covalues ORDER BY covalue_id")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|bytes| {
                    <[u8; 32]>::try_from(bytes)
                        .map(CoValueId::from_bytes)
                        .map_err(|_| StoreError::InvalidData("covalue id is not 32 bytes".into()))
                })
                .collect()
        })
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
