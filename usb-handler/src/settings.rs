//! SQLite storage for per-device handler settings

use crate::component::{ComponentName, InvalidComponent};
use crate::device::{DeviceIdentity, UsbDevice};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Stored handler is invalid: {0}")]
    InvalidHandler(#[from] InvalidComponent),
    #[error("Stored {column} {value} is not a valid USB id")]
    InvalidId { column: &'static str, value: i64 },
    #[error("Storage integrity violation: {count} settings stored for device {identity}")]
    MultipleRows { identity: DeviceIdentity, count: usize },
}

/// Handler choice remembered for one physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSetting {
    pub identity: DeviceIdentity,
    pub display_name: String,
    pub handler: ComponentName,
    /// Whether the handler expects the device in accessory mode
    pub aoap: bool,
}

impl HandlerSetting {
    pub fn for_device(device: &UsbDevice, handler: ComponentName, aoap: bool) -> Self {
        Self {
            identity: device.identity(),
            display_name: device.display_name(),
            handler,
            aoap,
        }
    }
}

/// SQLite settings store
pub struct SettingsStore {
    conn: Connection,
}

#[cfg(test)]
impl SettingsStore {
    /// Wrap an existing connection without touching its schema (for testing only)
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl SettingsStore {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS usb_devices (
                serial TEXT,
                vid INTEGER,
                pid INTEGER,
                name TEXT,
                handler TEXT,
                aoap INTEGER,
                PRIMARY KEY (serial, vid, pid)
            );
            "#,
        )?;
        Ok(())
    }

    /// Setting for a device, if one was saved.
    ///
    /// More than one row for an identity means the table was corrupted
    /// upstream; that is reported as `MultipleRows`, never repaired here.
    pub fn get_settings(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Option<HandlerSetting>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT serial, vid, pid, name, handler, aoap
             FROM usb_devices WHERE serial = ?1 AND vid = ?2 AND pid = ?3",
        )?;

        let rows = stmt.query_map(
            params![identity.serial, identity.vendor_id, identity.product_id],
            StoredRow::from_row,
        )?;

        let mut found = Vec::new();
        for row in rows {
            found.push(row?);
        }

        match found.len() {
            0 => Ok(None),
            1 => {
                let setting = found.remove(0).into_setting()?;
                debug!("Found settings for {}: {}", identity, setting.handler);
                Ok(Some(setting))
            }
            count => {
                error!(
                    "Storage integrity violation: {} rows for device {}",
                    count, identity
                );
                Err(StorageError::MultipleRows {
                    identity: identity.clone(),
                    count,
                })
            }
        }
    }

    /// Insert or replace the setting for its device identity
    pub fn save_settings(&self, setting: &HandlerSetting) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO usb_devices (serial, vid, pid, name, handler, aoap)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                setting.identity.serial,
                setting.identity.vendor_id,
                setting.identity.product_id,
                setting.display_name,
                setting.handler.flatten(),
                setting.aoap as i64,
            ],
        )?;
        debug!(
            "Saved settings for {}: {} (aoap: {})",
            setting.identity, setting.handler, setting.aoap
        );
        Ok(())
    }

    /// Delete the setting for a device. Returns whether a row was removed.
    pub fn delete_settings(&self, identity: &DeviceIdentity) -> Result<bool, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM usb_devices WHERE serial = ?1 AND vid = ?2 AND pid = ?3",
            params![identity.serial, identity.vendor_id, identity.product_id],
        )?;
        Ok(removed > 0)
    }

    /// Every saved setting
    pub fn get_all_settings(&self) -> Result<Vec<HandlerSetting>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT serial, vid, pid, name, handler, aoap
             FROM usb_devices ORDER BY serial, vid, pid",
        )?;

        let rows = stmt.query_map([], StoredRow::from_row)?;

        let mut settings = Vec::new();
        for row in rows {
            settings.push(row?.into_setting()?);
        }
        Ok(settings)
    }
}

/// Raw row; the handler column is parsed after the query completes
struct StoredRow {
    serial: Option<String>,
    vid: i64,
    pid: i64,
    name: Option<String>,
    handler: String,
    aoap: i64,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            serial: row.get(0)?,
            vid: row.get(1)?,
            pid: row.get(2)?,
            name: row.get(3)?,
            handler: row.get(4)?,
            aoap: row.get(5)?,
        })
    }

    fn into_setting(self) -> Result<HandlerSetting, StorageError> {
        Ok(HandlerSetting {
            identity: DeviceIdentity {
                serial: self.serial.unwrap_or_default(),
                vendor_id: usb_id("vid", self.vid)?,
                product_id: usb_id("pid", self.pid)?,
            },
            display_name: self.name.unwrap_or_default(),
            handler: ComponentName::unflatten(&self.handler)?,
            aoap: self.aoap != 0,
        })
    }
}

fn usb_id(column: &'static str, value: i64) -> Result<u16, StorageError> {
    u16::try_from(value).map_err(|_| StorageError::InvalidId { column, value })
}
