use std::path::Path;
use std::thread;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use shared::types::{AddressRecord, DnsRecord, LookupResult, ServiceMode};
use crate::store::RecordStore;

pub struct RecordDb {
    conn: Connection,
}

impl RecordDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS dns_records (
                hostname        TEXT PRIMARY KEY,
                mode            TEXT NOT NULL,
                origin          TEXT NOT NULL,
                lookup_hostname TEXT NOT NULL,
                port            INTEGER NOT NULL,
                public_key      BLOB NOT NULL,
                peer_address    TEXT NOT NULL,
                lookup          TEXT
            );

            CREATE TABLE IF NOT EXISTS address_records (
                address  TEXT PRIMARY KEY,
                hostname TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    pub fn put_record(&self, record: &DnsRecord) -> Result<()> {
        let mode = match record.mode {
            ServiceMode::Http => "http",
            ServiceMode::Vm => "vm",
        };
        let lookup = record
            .lookup
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize lookup")?;

        self.conn
            .execute(
                r#"
                INSERT INTO dns_records (
                    hostname, mode, origin, lookup_hostname, port, public_key,
                    peer_address, lookup
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(hostname) DO UPDATE SET
                    mode = excluded.mode,
                    origin = excluded.origin,
                    lookup_hostname = excluded.lookup_hostname,
                    port = excluded.port,
                    public_key = excluded.public_key,
                    peer_address = excluded.peer_address,
                    lookup = excluded.lookup
                "#,
                params![
                    &record.hostname,
                    mode,
                    &record.origin,
                    &record.lookup_hostname,
                    record.port,
                    &record.public_key,
                    &record.peer_address,
                    lookup,
                ],
            )
            .context("Failed to upsert dns record")?;
        Ok(())
    }

    pub fn get_record(&self, hostname: &str) -> Result<Option<DnsRecord>> {
        self.conn
            .query_row(
                "SELECT hostname, mode, origin, lookup_hostname, port, public_key,
                        peer_address, lookup
                 FROM dns_records WHERE hostname = ?1",
                params![hostname],
                Self::row_to_record,
            )
            .optional()
            .context("Failed to query dns record")
    }

    pub fn put_address(&self, record: &AddressRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO address_records (address, hostname) VALUES (?1, ?2)
                 ON CONFLICT(address) DO UPDATE SET hostname = excluded.hostname",
                params![&record.address, &record.hostname],
            )
            .context("Failed to upsert address record")?;
        Ok(())
    }

    pub fn get_hostname_by_address(&self, address: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT hostname FROM address_records WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query address record")
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<DnsRecord, rusqlite::Error> {
        let mode_str: String = row.get(1)?;
        let lookup_json: Option<String> = row.get(7)?;

        let mode = mode_str.parse::<ServiceMode>().map_err(|unknown| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown mode {unknown}").into(),
            )
        })?;

        let lookup = lookup_json
            .map(|json| serde_json::from_str::<LookupResult>(&json))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;

        Ok(DnsRecord {
            hostname: row.get(0)?,
            mode,
            origin: row.get(2)?,
            lookup_hostname: row.get(3)?,
            port: row.get::<_, u16>(4)?,
            public_key: row.get(5)?,
            peer_address: row.get(6)?,
            lookup,
        })
    }
}

/// Commands sent to the database thread
enum StoreCommand {
    GetRecord(String, oneshot::Sender<Result<Option<DnsRecord>>>),
    PutRecord(DnsRecord, oneshot::Sender<Result<()>>),
    GetHostname(String, oneshot::Sender<Result<Option<String>>>),
    PutAddress(AddressRecord, oneshot::Sender<Result<()>>),
    Shutdown,
}

/// [`RecordStore`] backed by SQLite. The connection lives on a dedicated
/// thread and is driven through a command channel.
#[derive(Clone)]
pub struct SqliteStore {
    tx: mpsc::Sender<StoreCommand>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = RecordDb::open(path)?;
        Ok(Self::spawn(db))
    }

    /// Spawn the database thread
    pub fn spawn(db: RecordDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::GetRecord(hostname, reply) => {
                        let _ = reply.send(db.get_record(&hostname));
                    }
                    StoreCommand::PutRecord(record, reply) => {
                        let _ = reply.send(db.put_record(&record));
                    }
                    StoreCommand::GetHostname(address, reply) => {
                        let _ = reply.send(db.get_hostname_by_address(&address));
                    }
                    StoreCommand::PutAddress(record, reply) => {
                        let _ = reply.send(db.put_address(&record));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Record store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Stop the database thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get_record(&self, hostname: &str) -> Result<Option<DnsRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::GetRecord(hostname.to_string(), reply))
            .await?;
        rx.await?
    }

    async fn put_record(&self, record: DnsRecord) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::PutRecord(record, reply)).await?;
        rx.await?
    }

    async fn get_hostname_by_address(&self, address: &str) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::GetHostname(address.to_string(), reply))
            .await?;
        rx.await?
    }

    async fn put_address(&self, record: AddressRecord) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::PutAddress(record, reply)).await?;
        rx.await?
    }
}
