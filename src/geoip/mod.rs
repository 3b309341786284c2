use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

/// Resolved geolocation for a public address.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
    /// Human-readable "City, Region" string (country code if nothing finer).
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Read-only lookup over a local GeoLite2-City database file. The reader is
/// immutable after open and shared freely across sessions.
pub struct GeoIp {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl GeoIp {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path)?;
        Ok(Self { reader })
    }

    /// Lookup an address; `None` for private ranges, lookup misses, or
    /// malformed records. Never an error for the caller.
    pub fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        let record: CityRecord = self.reader.lookup(ip).ok()?;

        let city = record
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en"))
            .cloned();
        let region = record
            .subdivisions
            .as_ref()
            .and_then(|subs| subs.first())
            .and_then(|sub| sub.iso_code.clone());
        let country = record.country.as_ref().and_then(|c| c.iso_code.clone());

        let parts: Vec<String> = [city, region].into_iter().flatten().collect();
        let location = if parts.is_empty() {
            country
        } else {
            Some(parts.join(", "))
        };

        let (latitude, longitude) = record
            .location
            .map(|l| (l.latitude, l.longitude))
            .unwrap_or((None, None));

        Some(GeoInfo {
            location,
            latitude,
            longitude,
        })
    }
}

// GeoLite2-City record shape, limited to the fields this crate reads.
#[derive(Deserialize)]
struct CityRecord {
    city: Option<CityInfo>,
    country: Option<CountryInfo>,
    subdivisions: Option<Vec<SubdivisionInfo>>,
    location: Option<LocationInfo>,
}

#[derive(Deserialize)]
struct CityInfo {
    names: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct CountryInfo {
    iso_code: Option<String>,
}

#[derive(Deserialize)]
struct SubdivisionInfo {
    iso_code: Option<String>,
}

#[derive(Deserialize)]
struct LocationInfo {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_database_fails() {
        assert!(GeoIp::open(Path::new("/nonexistent/GeoLite2-City.mmdb")).is_err());
    }
}
