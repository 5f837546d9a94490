use crate::error::{AppError, Result};
use crate::resolver::CanonicalCountry;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Raw airline row from the reference extract, before resolution and merge.
#[derive(Debug, Clone, Deserialize)]
pub struct AirlineRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub iata: Option<String>,
    #[serde(default)]
    pub icao: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub active: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AirportRecord {
    pub iata: String,
    pub icao: String,
    pub name: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub active: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRecord {
    #[serde(alias = "airline_iata")]
    pub airline: String,
    #[serde(alias = "from_iata")]
    pub from: String,
    #[serde(alias = "to_iata")]
    pub to: String,
    #[serde(default)]
    pub active: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountryRecord {
    code: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct StationRecord {
    iata_code: String,
    icao_code: String,
}

#[derive(Debug, Deserialize)]
struct FleetAgeRecord {
    #[serde(alias = "company")]
    airline: String,
    average_age: f64,
}

/// Everything the dimension stage reads from disk in one run.
#[derive(Debug, Clone, Default)]
pub struct DimensionExtracts {
    pub countries: Vec<CanonicalCountry>,
    pub airlines: Vec<AirlineRecord>,
    pub airports: Vec<AirportRecord>,
    pub routes: Vec<RouteRecord>,
    /// IATA -> ICAO station mapping used to key weather lookups.
    pub stations: HashMap<String, String>,
    /// Average fleet age per airline name.
    pub fleet_ages: HashMap<String, f64>,
}

fn csv_reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(AppError::Csv)
}

fn read_records<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Result<Vec<T>> {
    let mut reader = csv_reader(path)?;
    let mut records = Vec::new();
    let mut skipped = 0usize;

    for result in reader.deserialize() {
        match result {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                warn!("Skipping malformed {} row: {}", what, e);
            }
        }
    }

    if skipped > 0 {
        warn!("Skipped {} malformed rows in {}", skipped, path.display());
    }

    Ok(records)
}

/// Load an optional extract: a missing or unreadable file degrades to an
/// empty snapshot, so the merge carries the previous state forward.
fn read_optional<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Vec<T> {
    if !path.exists() {
        warn!("{} extract not found at {}, treating as empty snapshot", what, path.display());
        return Vec::new();
    }
    match read_records(path, what) {
        Ok(records) => records,
        Err(e) => {
            warn!("Failed to read {} extract: {}, treating as empty snapshot", what, e);
            Vec::new()
        }
    }
}

/// Read all extracts from the configured directory.
///
/// The country catalog and the station mapping are systemic inputs: without
/// them neither resolution nor weather matching can run, so their absence is
/// fatal. The remaining extracts degrade to empty snapshots.
pub fn load_extracts<P: AsRef<Path>>(dir: P) -> Result<DimensionExtracts> {
    let dir = dir.as_ref();
    let path = |name: &str| -> PathBuf { dir.join(name) };

    let country_records: Vec<CountryRecord> = read_records(&path("countries.csv"), "country")?;
    if country_records.is_empty() {
        return Err(AppError::InvalidData(
            "Country catalog is empty; cannot resolve references".to_string(),
        ));
    }
    let countries = country_records
        .into_iter()
        .map(|r| CanonicalCountry {
            code: r.code,
            name: r.name,
        })
        .collect::<Vec<_>>();

    let station_records: Vec<StationRecord> = read_records(&path("iata_icao.csv"), "station")?;
    if station_records.is_empty() {
        return Err(AppError::InvalidData(
            "Station mapping is empty; cannot key weather lookups".to_string(),
        ));
    }
    let stations: HashMap<String, String> = station_records
        .into_iter()
        .filter(|r| !r.iata_code.is_empty() && !r.icao_code.is_empty())
        .map(|r| (r.iata_code.to_uppercase(), r.icao_code.to_uppercase()))
        .collect();

    let airlines: Vec<AirlineRecord> = read_optional(&path("airlines.csv"), "airline");
    let airports: Vec<AirportRecord> = read_optional(&path("airports.csv"), "airport");
    let routes: Vec<RouteRecord> = read_optional(&path("routes.csv"), "route");

    let fleet_records: Vec<FleetAgeRecord> =
        read_optional(&path("fleet_age_by_company.csv"), "fleet age");
    let fleet_ages: HashMap<String, f64> = fleet_records
        .into_iter()
        .map(|r| (r.airline, r.average_age))
        .collect();

    info!(
        "Loaded extracts: {} countries, {} airlines, {} airports, {} routes, {} stations, {} fleet ages",
        countries.len(),
        airlines.len(),
        airports.len(),
        routes.len(),
        stations.len(),
        fleet_ages.len()
    );

    Ok(DimensionExtracts {
        countries,
        airlines,
        airports,
        routes,
        stations,
        fleet_ages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) {
        let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn seed_required(dir: &TempDir) {
        write_file(dir, "countries.csv", "code,name\nFR,France\nUS,United States\n");
        write_file(
            dir,
            "iata_icao.csv",
            "iata_code,icao_code\nCDG,LFPG\nJFK,KJFK\n",
        );
    }

    #[test]
    fn test_load_required_extracts() {
        let dir = TempDir::new().unwrap();
        seed_required(&dir);

        let extracts = load_extracts(dir.path()).unwrap();
        assert_eq!(extracts.countries.len(), 2);
        assert_eq!(extracts.stations.get("CDG").map(String::as_str), Some("LFPG"));
        assert!(extracts.airlines.is_empty());
    }

    #[test]
    fn test_missing_country_catalog_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "iata_icao.csv", "iata_code,icao_code\nCDG,LFPG\n");

        assert!(load_extracts(dir.path()).is_err());
    }

    #[test]
    fn test_empty_station_mapping_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "countries.csv", "code,name\nFR,France\n");
        write_file(&dir, "iata_icao.csv", "iata_code,icao_code\n");

        assert!(load_extracts(dir.path()).is_err());
    }

    #[test]
    fn test_optional_extracts_parse() {
        let dir = TempDir::new().unwrap();
        seed_required(&dir);
        write_file(
            &dir,
            "airlines.csv",
            "id,name,iata,icao,country,active\n137,Air France,AF,AFR,France,Y\n",
        );
        write_file(
            &dir,
            "routes.csv",
            "airline,from,to\nAF,CDG,JFK\n",
        );
        write_file(
            &dir,
            "fleet_age_by_company.csv",
            "airline,average_age\nAir France,11.3\n",
        );

        let extracts = load_extracts(dir.path()).unwrap();
        assert_eq!(extracts.airlines.len(), 1);
        assert_eq!(extracts.airlines[0].iata.as_deref(), Some("AF"));
        assert_eq!(extracts.routes.len(), 1);
        assert_eq!(extracts.fleet_ages.get("Air France"), Some(&11.3));
    }

    #[test]
    fn test_fleet_ages_accept_company_header() {
        let dir = TempDir::new().unwrap();
        seed_required(&dir);
        write_file(
            &dir,
            "fleet_age_by_company.csv",
            "company,average_age\nAir France,11.3\nLufthansa,12.8\n",
        );

        let extracts = load_extracts(dir.path()).unwrap();
        assert_eq!(extracts.fleet_ages.get("Air France"), Some(&11.3));
        assert_eq!(extracts.fleet_ages.get("Lufthansa"), Some(&12.8));
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let dir = TempDir::new().unwrap();
        seed_required(&dir);
        write_file(
            &dir,
            "airlines.csv",
            "id,name,iata,icao,country,active\nnot_a_number,Broken,,,,\n137,Air France,AF,AFR,France,Y\n",
        );

        let extracts = load_extracts(dir.path()).unwrap();
        assert_eq!(extracts.airlines.len(), 1);
        assert_eq!(extracts.airlines[0].name, "Air France");
    }

    #[test]
    fn test_station_codes_uppercased() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "countries.csv", "code,name\nFR,France\n");
        write_file(&dir, "iata_icao.csv", "iata_code,icao_code\ncdg,lfpg\n");

        let extracts = load_extracts(dir.path()).unwrap();
        assert_eq!(extracts.stations.get("CDG").map(String::as_str), Some("LFPG"));
    }
}
