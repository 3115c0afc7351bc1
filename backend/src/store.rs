// Trip store - the shared convoy record keyed by join code.
// Leaders write, followers poll. Every mutation persists the whole collection
// before returning; concurrent saves to the same code are last-writer-wins.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use rand::Rng;

use crate::models::{GeoPoint, Trip};

pub const CODE_LEN: usize = 6;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access trip store: {0}")]
    Io(#[from] io::Error),

    #[error("trip store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("no trip with code {0}")]
    NotFound(String),

    #[error("trip {0} has ended")]
    TripEnded(String),
}

enum Backing {
    Memory(Vec<Trip>),
    /// Re-read on every operation so other processes sharing the file see writes.
    File(PathBuf),
}

pub struct TripStore {
    backing: Mutex<Backing>,
}

impl TripStore {
    pub fn in_memory() -> Self {
        Self {
            backing: Mutex::new(Backing::Memory(Vec::new())),
        }
    }

    /// Open a JSON-file backed store. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        // Fail early on an unreadable or corrupt file.
        let existing = read_trips(&path)?;
        tracing::info!(
            "opened trip store at {} with {} trip(s)",
            path.display(),
            existing.len()
        );
        Ok(Self {
            backing: Mutex::new(Backing::File(path)),
        })
    }

    /// All persisted trips in storage order.
    pub fn list_trips(&self) -> Result<Vec<Trip>, StoreError> {
        let backing = self.lock();
        load(&backing)
    }

    /// Upsert by exact code. The record is fully replaced, never merged.
    pub fn save_trip(&self, trip: Trip) -> Result<(), StoreError> {
        let mut backing = self.lock();
        let mut trips = load(&backing)?;
        match trips.iter().position(|t| t.code == trip.code) {
            Some(index) => trips[index] = trip,
            None => trips.push(trip),
        }
        persist(&mut backing, trips)
    }

    /// Case-insensitive lookup by join code.
    pub fn get_trip_by_code(&self, code: &str) -> Result<Trip, StoreError> {
        let backing = self.lock();
        load(&backing)?
            .into_iter()
            .find(|t| t.code.eq_ignore_ascii_case(code))
            .ok_or_else(|| StoreError::NotFound(code.to_string()))
    }

    /// Append a point to the path of the trip with exactly this code and
    /// return the updated record.
    pub fn append_path_point(&self, code: &str, point: GeoPoint) -> Result<Trip, StoreError> {
        let mut backing = self.lock();
        let mut trips = load(&backing)?;
        let trip = trips
            .iter_mut()
            .find(|t| t.code == code)
            .ok_or_else(|| StoreError::NotFound(code.to_string()))?;
        if !trip.is_active {
            return Err(StoreError::TripEnded(code.to_string()));
        }
        trip.path.push(point);
        let updated = trip.clone();
        persist(&mut backing, trips)?;
        Ok(updated)
    }

    /// Draw join codes until one is not used by any stored trip.
    pub fn allocate_code<R: Rng>(&self, rng: &mut R) -> Result<String, StoreError> {
        let trips = self.list_trips()?;
        loop {
            let code = generate_code(rng);
            if !trips.iter().any(|t| t.code.eq_ignore_ascii_case(&code)) {
                return Ok(code);
            }
            tracing::debug!("join code {code} already taken, drawing again");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Backing> {
        self.backing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn generate_code<R: Rng>(rng: &mut R) -> String {
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn load(backing: &Backing) -> Result<Vec<Trip>, StoreError> {
    match backing {
        Backing::Memory(trips) => Ok(trips.clone()),
        Backing::File(path) => read_trips(path),
    }
}

fn persist(backing: &mut Backing, trips: Vec<Trip>) -> Result<(), StoreError> {
    match backing {
        Backing::Memory(stored) => {
            *stored = trips;
            Ok(())
        }
        Backing::File(path) => write_trips(path, &trips),
    }
}

fn read_trips(path: &Path) -> Result<Vec<Trip>, StoreError> {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

fn write_trips(path: &Path, trips: &[Trip]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(trips)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
