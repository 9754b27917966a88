//! GeoIP lookups backed by a MaxMind MMDB database.
//!
//! The reader is held behind a read lock so the database can be hot
//! reloaded while connections are being served.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{ProxyError, Result};

#[derive(Deserialize)]
struct CountryRecord {
    country: Option<CountryInfo>,
}

#[derive(Deserialize)]
struct CountryInfo {
    iso_code: Option<String>,
}

/// Process-wide GeoIP database handle: `ip -> ISO country code`.
#[derive(Debug, Default)]
pub struct GeoDb {
    reader: RwLock<Option<Arc<maxminddb::Reader<Vec<u8>>>>>,
}

impl GeoDb {
    /// A handle with no database loaded; every lookup returns `None`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Open an MMDB file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self::empty();
        db.reload(path)?;
        Ok(db)
    }

    /// Replace the database, leaving in-flight lookups on the old snapshot.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<()> {
        let reader = maxminddb::Reader::open_readfile(path.as_ref())
            .map_err(|e| ProxyError::GeoError(format!("failed to open MMDB file: {}", e)))?;
        *self.reader.write() = Some(Arc::new(reader));
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.reader.read().is_some()
    }

    /// Look up the ISO country code for an address, uppercased.
    pub fn country_code(&self, ip: IpAddr) -> Option<String> {
        let reader = self.reader.read().as_ref()?.clone();
        reader
            .lookup(ip)
            .ok()
            .and_then(|result| result.decode::<CountryRecord>().ok()?)
            .and_then(|record| record.country)
            .and_then(|c| c.iso_code)
            .map(|code| code.to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_db_returns_none() {
        let db = GeoDb::empty();
        assert!(!db.is_loaded());
        assert_eq!(db.country_code("8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn test_open_missing_file() {
        let result = GeoDb::open("/nonexistent/geoip.mmdb");
        assert!(result.is_err());
    }
}
