//! # Dataset Module
//!
//! Routes station samples to their append-only training files.
//!
//! Each station owns one comma-separated file under the dataset directory,
//! named `station<index>.csv` where `index = station_id - 7`. Rows are
//! `year,month,day,hour,temperature` with no header. Files are created on
//! the first accepted sample and are only ever appended to.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use log::{debug, info};
use regex::Regex;

use crate::command::StationSample;
use crate::error::RouterError;

/// Hardware addresses start at 8; station 1 lives at address 8.
pub const STATION_ADDRESS_OFFSET: i64 = 7;

static STATION_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^station(\d+)\.csv$").expect("Invalid regex pattern"));

/// Maps a hardware address to a logical station index.
///
/// Addresses `<= 7` have no station and are rejected explicitly.
pub fn station_index(station_id: u32) -> Result<u32, RouterError> {
    let index = i64::from(station_id) - STATION_ADDRESS_OFFSET;
    if index < 1 {
        return Err(RouterError::InvalidStation { station_id, index });
    }
    u32::try_from(index).map_err(|_| RouterError::InvalidStation { station_id, index })
}

/// A persisted station dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationDataset {
    pub index: u32,
    pub path: PathBuf,
}

/// One stored row, in file column order.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    pub year: String,
    pub month: String,
    pub day: String,
    pub hour: String,
    pub temperature: f64,
}

impl DatasetRow {
    fn from_line(line: &str) -> Option<Self> {
        let mut columns = line.split(',');
        let year = columns.next()?.to_string();
        let month = columns.next()?.to_string();
        let day = columns.next()?.to_string();
        let hour = columns.next()?.to_string();
        let temperature = columns.next()?.trim().parse().ok()?;
        Some(Self {
            year,
            month,
            day,
            hour,
            temperature,
        })
    }
}

impl From<&StationSample> for DatasetRow {
    fn from(sample: &StationSample) -> Self {
        Self {
            year: sample.year.clone(),
            month: sample.month.clone(),
            day: sample.day.clone(),
            hour: sample.hour.clone(),
            temperature: sample.temperature,
        }
    }
}

/// Owns the dataset directory. The base station is the only writer.
#[derive(Debug)]
pub struct DatasetRouter {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl DatasetRouter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Dataset directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for a logical station index.
    pub fn dataset_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("station{index}.csv"))
    }

    /// Appends one sample to its station file, creating it if needed.
    ///
    /// The row is written with a single `write_all` and synced before
    /// returning. An invalid station touches nothing on disk.
    pub fn append(&self, sample: &StationSample) -> Result<StationDataset, RouterError> {
        let index = station_index(sample.station_id)?;
        let path = self.dataset_path(index);
        let row = format_row(sample);

        // A poisoned lock only means another writer panicked between rows.
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        fs::create_dir_all(&self.dir).map_err(|e| RouterError::io(&self.dir, e))?;
        let created = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RouterError::io(&path, e))?;
        file.write_all(row.as_bytes())
            .map_err(|e| RouterError::io(&path, e))?;
        file.sync_data().map_err(|e| RouterError::io(&path, e))?;

        if created {
            info!("Created dataset for station {index}: {}", path.display());
        }
        debug!("Station {index} <- {}", row.trim_end());
        Ok(StationDataset { index, path })
    }

    /// Known stations, ordered by index. A missing directory means none.
    pub fn stations(&self) -> Result<Vec<StationDataset>, RouterError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RouterError::io(&self.dir, e)),
        };

        let mut stations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RouterError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(index) = STATION_FILE
                .captures(name)
                .and_then(|caps| caps[1].parse::<u32>().ok())
                .filter(|index| *index >= 1)
            else {
                continue;
            };
            if entry.path().is_file() {
                stations.push(StationDataset {
                    index,
                    path: entry.path(),
                });
            }
        }
        stations.sort_by_key(|station| station.index);
        Ok(stations)
    }

    /// Reads back every row of a station file. Unreadable lines are skipped.
    pub fn read_series(&self, index: u32) -> Result<Vec<DatasetRow>, RouterError> {
        let path = self.dataset_path(index);
        let data = fs::read_to_string(&path).map_err(|e| RouterError::io(&path, e))?;
        Ok(data.lines().filter_map(DatasetRow::from_line).collect())
    }
}

fn format_row(sample: &StationSample) -> String {
    format!(
        "{},{},{},{},{}\n",
        sample.year, sample.month, sample.day, sample.hour, sample.temperature
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(station_id: u32, hour: &str, temperature: f64) -> StationSample {
        StationSample {
            station_id,
            year: "2024".to_string(),
            month: "03".to_string(),
            day: "01".to_string(),
            hour: hour.to_string(),
            temperature,
        }
    }

    #[test]
    fn test_station_index() {
        assert_eq!(station_index(8).unwrap(), 1);
        assert_eq!(station_index(12).unwrap(), 5);
        assert!(matches!(
            station_index(7),
            Err(RouterError::InvalidStation { index: 0, .. })
        ));
        assert!(matches!(
            station_index(0),
            Err(RouterError::InvalidStation { index: -7, .. })
        ));
    }

    #[test]
    fn test_append_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let router = DatasetRouter::new(dir.path().join("training_sets"));
        let a = sample(9, "09", 18.2);
        let b = sample(9, "10", -1.5);

        router.append(&a).unwrap();
        let dataset = router.append(&b).unwrap();

        assert_eq!(dataset.index, 2);
        assert_eq!(
            router.read_series(2).unwrap(),
            vec![DatasetRow::from(&a), DatasetRow::from(&b)]
        );
        let raw = fs::read_to_string(dataset.path).unwrap();
        assert_eq!(raw, "2024,03,01,09,18.2\n2024,03,01,10,-1.5\n");
    }

    #[test]
    fn test_append_invalid_station_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let datasets = dir.path().join("training_sets");
        let router = DatasetRouter::new(&datasets);

        let result = router.append(&sample(5, "09", 18.2));

        assert!(matches!(
            result,
            Err(RouterError::InvalidStation {
                station_id: 5,
                index: -2
            })
        ));
        assert!(!datasets.exists());
    }

    #[test]
    fn test_stations_are_separate_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let router = DatasetRouter::new(dir.path());
        router.append(&sample(18, "01", 1.0)).unwrap();
        router.append(&sample(8, "01", 2.0)).unwrap();
        router.append(&sample(9, "01", 3.0)).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("station0.csv"), "ignored").unwrap();

        let indices: Vec<u32> = router.stations().unwrap().iter().map(|s| s.index).collect();

        assert_eq!(indices, vec![1, 2, 11]);
        assert_eq!(router.read_series(1).unwrap().len(), 1);
        assert_eq!(router.read_series(1).unwrap()[0].temperature, 2.0);
    }

    #[test]
    fn test_stations_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let router = DatasetRouter::new(dir.path().join("absent"));
        assert_eq!(router.dir(), dir.path().join("absent"));
        assert!(router.stations().unwrap().is_empty());
    }

    #[test]
    fn test_append_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let router = DatasetRouter::new(&blocker);

        let result = router.append(&sample(8, "01", 1.0));

        assert!(matches!(result, Err(RouterError::IoFailure { .. })));
    }
}
