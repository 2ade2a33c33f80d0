use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::record::{clean_field, Coordinate, Record, ResolutionStatus, Tier, SENTINEL_TEXT};

const COORDINATE_HEADER: &str = "Coordinates";
const TIER_HEADER: &str = "resolution_tier";
const STATUS_HEADER: &str = "resolution_status";
const DISPERSED_HEADER: &str = "dispersed";

const STATE_ALIASES: &[&str] = &["state", "st", "region", "province"];
const CITY_ALIASES: &[&str] = &["city", "town"];
const BUSINESS_ALIASES: &[&str] = &["business", "business name", "company", "organization"];
const NAME_ALIASES: &[&str] = &["name", "full name", "contact name"];
const COORDINATE_ALIASES: &[&str] = &["coordinates", "coordinate", "coords", "latlng"];

#[derive(Debug, Clone)]
struct ColumnMap {
    name: Option<usize>,
    business: Option<usize>,
    city: Option<usize>,
    state: usize,
    coordinate: usize,
    tier: usize,
    status: usize,
    dispersed: usize,
}

/// In-memory view of one tabular file. Rows keep every original cell so a
/// rewrite only touches the coordinate and bookkeeping columns.
pub struct RecordStore {
    target: PathBuf,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    columns: ColumnMap,
    records: Vec<Record>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSummary {
    pub total: usize,
    pub resolved: usize,
    pub failed: usize,
    pub unresolved: usize,
    pub dispersed: usize,
    pub by_tier: BTreeMap<&'static str, usize>,
}

impl RecordStore {
    pub fn load(path: &Path) -> AppResult<Self> {
        let file = File::open(path).map_err(|err| AppError::storage(path, err))?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let mut headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|header| header.trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for result in reader.records() {
            let row = result?;
            let mut cells: Vec<String> = row.iter().map(str::to_string).collect();
            if cells.len() < headers.len() {
                cells.resize(headers.len(), String::new());
            }
            rows.push(cells);
        }

        let columns = resolve_columns(&mut headers, &mut rows)?;
        let records = rows
            .iter()
            .enumerate()
            .map(|(index, row)| record_from_row(index, row, &columns))
            .collect::<Vec<_>>();

        let store = Self {
            target: path.to_path_buf(),
            headers,
            rows,
            columns,
            records,
        };
        let summary = store.summary();
        info!(
            path = %path.display(),
            total = summary.total,
            resolved = summary.resolved,
            "loaded record store"
        );
        Ok(store)
    }

    /// Redirects persistence to another file; the input stays untouched.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.target = path.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn record(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn record_mut(&mut self, index: usize) -> Option<&mut Record> {
        self.records.get_mut(index)
    }

    /// Rewrites the whole file from in-memory state. The content goes to a
    /// sibling temp file first and replaces the target with a rename.
    pub fn persist(&self) -> AppResult<()> {
        if let Some(parent) = self.target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| AppError::storage(parent, err))?;
        }
        let tmp_path = temp_path_for(&self.target);
        self.write_to(&tmp_path)?;
        fs::rename(&tmp_path, &self.target).map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            AppError::storage(&self.target, err)
        })?;
        debug!(path = %self.target.display(), rows = self.rows.len(), "record store persisted");
        Ok(())
    }

    pub fn summary(&self) -> StoreSummary {
        let mut summary = StoreSummary {
            total: self.records.len(),
            ..StoreSummary::default()
        };
        for record in &self.records {
            match record.status {
                ResolutionStatus::Resolved => summary.resolved += 1,
                ResolutionStatus::Failed => summary.failed += 1,
                ResolutionStatus::Unresolved => summary.unresolved += 1,
            }
            if record.dispersed {
                summary.dispersed += 1;
            }
            if let Some(tier) = record.tier.filter(|_| record.is_resolved()) {
                *summary.by_tier.entry(tier.as_tag()).or_default() += 1;
            }
        }
        summary
    }

    fn write_to(&self, path: &Path) -> AppResult<()> {
        let file = File::create(path).map_err(|err| AppError::storage(path, err))?;
        let mut writer = WriterBuilder::new().flexible(true).from_writer(file);
        writer.write_record(&self.headers)?;
        for (row, record) in self.rows.iter().zip(&self.records) {
            writer.write_record(self.render_row(row, record))?;
        }
        let file = writer.into_inner().map_err(|err| {
            AppError::storage(path, io::Error::new(err.error().kind(), err.to_string()))
        })?;
        file.sync_all().map_err(|err| AppError::storage(path, err))?;
        Ok(())
    }

    fn render_row(&self, row: &[String], record: &Record) -> Vec<String> {
        let mut cells = row.to_vec();
        let resolved = record.is_resolved();
        let coordinate = self.columns.coordinate;
        if let Some(text) = coordinate_cell(&row[coordinate], record) {
            cells[coordinate] = text;
        }
        cells[self.columns.tier] = record
            .tier
            .filter(|_| resolved)
            .map(|tier| tier.as_tag().to_string())
            .unwrap_or_default();
        cells[self.columns.status] = record.status.as_tag().to_string();
        cells[self.columns.dispersed] = if resolved && record.dispersed {
            "true".to_string()
        } else {
            String::new()
        };
        cells
    }
}

/// Replacement text for a coordinate cell, or `None` to keep the stored text.
/// A cell is only rewritten when the record holds a coordinate the cell does
/// not already encode, or when the cell is blank.
fn coordinate_cell(original: &str, record: &Record) -> Option<String> {
    match record.coordinate {
        Some(coordinate) if Coordinate::parse(original) == Some(coordinate) => None,
        Some(_) => Some(record.coordinate_text()),
        None if original.trim().is_empty() => Some(SENTINEL_TEXT.to_string()),
        None => None,
    }
}

fn resolve_columns(headers: &mut Vec<String>, rows: &mut [Vec<String>]) -> AppResult<ColumnMap> {
    let mut claimed = vec![false; headers.len()];

    let tier = locate(headers, &mut claimed, &[TIER_HEADER], None);
    let status = locate(headers, &mut claimed, &[STATUS_HEADER], None);
    let dispersed = locate(headers, &mut claimed, &[DISPERSED_HEADER], None);
    let coordinate = locate(headers, &mut claimed, COORDINATE_ALIASES, Some("coord"));
    let state = locate(headers, &mut claimed, STATE_ALIASES, Some("state"))
        .ok_or(AppError::MissingColumn("state"))?;
    let city = locate(headers, &mut claimed, CITY_ALIASES, Some("city"));
    let business = locate(headers, &mut claimed, BUSINESS_ALIASES, None);
    let name = locate(headers, &mut claimed, NAME_ALIASES, None);

    let coordinate =
        coordinate.unwrap_or_else(|| append_column(headers, rows, COORDINATE_HEADER, SENTINEL_TEXT));
    let tier = tier.unwrap_or_else(|| append_column(headers, rows, TIER_HEADER, ""));
    let status = status.unwrap_or_else(|| append_column(headers, rows, STATUS_HEADER, ""));
    let dispersed = dispersed.unwrap_or_else(|| append_column(headers, rows, DISPERSED_HEADER, ""));

    debug!(?headers, "resolved storage columns");
    Ok(ColumnMap {
        name,
        business,
        city,
        state,
        coordinate,
        tier,
        status,
        dispersed,
    })
}

/// Exact case-insensitive alias match first, then an optional substring match.
fn locate(
    headers: &[String],
    claimed: &mut [bool],
    aliases: &[&str],
    fragment: Option<&str>,
) -> Option<usize> {
    let exact = headers.iter().enumerate().position(|(idx, header)| {
        !claimed[idx] && aliases.iter().any(|alias| header.eq_ignore_ascii_case(alias))
    });
    let found = exact.or_else(|| {
        let fragment = fragment?;
        headers.iter().enumerate().position(|(idx, header)| {
            !claimed[idx] && header.to_ascii_lowercase().contains(fragment)
        })
    })?;
    claimed[found] = true;
    Some(found)
}

fn append_column(
    headers: &mut Vec<String>,
    rows: &mut [Vec<String>],
    header: &str,
    fill: &str,
) -> usize {
    let index = headers.len();
    headers.push(header.to_string());
    for row in rows.iter_mut() {
        if row.len() <= index {
            row.resize(index, String::new());
            row.push(fill.to_string());
        } else {
            row.insert(index, fill.to_string());
        }
    }
    index
}

fn record_from_row(index: usize, row: &[String], columns: &ColumnMap) -> Record {
    let cell = |column: Option<usize>| -> Option<String> {
        column
            .and_then(|idx| row.get(idx))
            .and_then(|value| clean_field(value))
    };

    let mut record = Record::new(index);
    record.name = cell(columns.name);
    record.business = cell(columns.business);
    record.city = cell(columns.city);
    record.state = cell(Some(columns.state));

    if let Some(coordinate) = cell(Some(columns.coordinate)).and_then(|v| Coordinate::parse(&v)) {
        record.coordinate = Some(coordinate);
        record.status = ResolutionStatus::Resolved;
        record.tier = cell(Some(columns.tier)).and_then(|v| Tier::parse(&v).ok());
        record.dispersed = cell(Some(columns.dispersed))
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
    } else if cell(Some(columns.status))
        .is_some_and(|v| v.eq_ignore_ascii_case(ResolutionStatus::Failed.as_tag()))
    {
        record.status = ResolutionStatus::Failed;
    }
    record
}

fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "records.csv".into());
    target.with_file_name(format!(".{file_name}.tmp"))
}

/// Picks the largest CSV in `dir` that is not a previous `geocoded` output.
pub fn discover_input(dir: &Path) -> AppResult<PathBuf> {
    let mut candidates = fs::read_dir(dir)
        .map_err(|err| AppError::storage(dir, err))?
        .filter_map(|entry| {
            entry.ok().and_then(|dir_entry| {
                let name = dir_entry.file_name();
                let name = name.to_string_lossy().to_ascii_lowercase();
                if name.ends_with(".csv") && !name.contains("geocoded") && !name.starts_with('.') {
                    Some((dir_entry.path(), dir_entry.metadata().ok()?.len()))
                } else {
                    None
                }
            })
        })
        .collect::<Vec<_>>();

    candidates.sort_by(|(a_path, a_len), (b_path, b_len)| {
        b_len.cmp(a_len).then_with(|| a_path.cmp(b_path))
    });
    candidates
        .into_iter()
        .next()
        .map(|(path, _)| path)
        .ok_or_else(|| AppError::Path(format!("no CSV input found in {}", dir.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn tolerates_header_whitespace_case_and_substrings() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "pilots.csv",
            " NAME ,Business, Home City ,State/Province,Phone\n\
             Jane,Eagle Eye Drones,Austin,TX,555-0100\n",
        );

        let store = RecordStore::load(&path).unwrap();
        let record = store.record(0).unwrap();
        assert_eq!(record.name.as_deref(), Some("Jane"));
        assert_eq!(record.business.as_deref(), Some("Eagle Eye Drones"));
        assert_eq!(record.city.as_deref(), Some("Austin"));
        assert_eq!(record.state.as_deref(), Some("TX"));
        assert_eq!(record.status, ResolutionStatus::Unresolved);
        assert_eq!(store.headers()[0], "NAME");
        assert!(store.headers().iter().any(|h| h == COORDINATE_HEADER));
    }

    #[test]
    fn existing_coordinates_load_as_resolved() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "pilots.csv",
            "Name,City,State,Coordinates,resolution_tier,dispersed\n\
             A,Austin,TX,\"30.26, -97.74\",city,\n\
             B,,TX,\"0,0\",,\n\
             C,,TX,garbage,,\n\
             D,,TX,\"31.1, -97.9\",state,true\n",
        );

        let store = RecordStore::load(&path).unwrap();
        let statuses: Vec<_> = store.records().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ResolutionStatus::Resolved,
                ResolutionStatus::Unresolved,
                ResolutionStatus::Unresolved,
                ResolutionStatus::Resolved,
            ]
        );
        assert_eq!(store.record(0).unwrap().tier, Some(Tier::City));
        assert!(store.record(3).unwrap().dispersed);
        assert_eq!(store.summary().by_tier.get("state"), Some(&1));
    }

    #[test]
    fn missing_optional_fields_still_load() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "pilots.csv", "Name,State\nJane,\nnan,CA\n");

        let store = RecordStore::load(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.record(0).unwrap().state.is_none());
        assert!(store.record(1).unwrap().name.is_none());
    }

    #[test]
    fn missing_state_column_is_fatal() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "pilots.csv", "Name,City\nJane,Austin\n");
        assert!(matches!(
            RecordStore::load(&path),
            Err(AppError::MissingColumn("state"))
        ));
    }

    #[test]
    fn unreadable_input_is_a_storage_fault() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.csv");
        assert!(matches!(
            RecordStore::load(&missing),
            Err(AppError::Storage { .. })
        ));
    }

    #[test]
    fn persist_rewrites_atomically_and_keeps_other_columns() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "pilots.csv",
            "Name,City,State,Phone\nJane,Austin,TX,555-0100\nBob,,,555-0199\n",
        );

        let mut store = RecordStore::load(&path).unwrap();
        store
            .record_mut(0)
            .unwrap()
            .mark_resolved(Coordinate::new(30.26, -97.74), Tier::City);
        store.persist().unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Name,City,State,Phone,Coordinates"));
        assert!(text.contains("555-0199"));
        assert!(text.contains("\"30.26, -97.74\""));

        let reloaded = RecordStore::load(&path).unwrap();
        assert!(reloaded.record(0).unwrap().is_resolved());
        assert_eq!(reloaded.record(0).unwrap().tier, Some(Tier::City));
        assert_eq!(reloaded.record(1).unwrap().coordinate_text(), SENTINEL_TEXT);
        assert_eq!(reloaded.headers(), store.headers());
    }

    #[test]
    fn location_text_column_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "pilots.csv", "Name,Location,State\nJane,Austin,TX\n");

        let store = RecordStore::load(&path).unwrap();
        assert_eq!(store.record(0).unwrap().status, ResolutionStatus::Unresolved);
        store.persist().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("Name,Location,State,Coordinates"));
        assert!(lines.next().unwrap().starts_with("Jane,Austin,TX,\"0,0\""));
    }

    #[test]
    fn unparsable_coordinate_cells_survive_until_resolved() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "pilots.csv",
            "Name,State,Coordinates\nA,TX,see notes\nB,TX,see notes\nC,TX,\n",
        );

        let mut store = RecordStore::load(&path).unwrap();
        store
            .record_mut(1)
            .unwrap()
            .mark_resolved(Coordinate::new(31.0, -97.5), Tier::State);
        store.persist().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        assert!(rows[0].starts_with("A,TX,see notes,"));
        assert!(rows[1].starts_with("B,TX,\"31, -97.5\","));
        assert!(rows[2].starts_with("C,TX,\"0,0\","));
    }

    #[test]
    fn skipped_coordinates_keep_their_original_text() {
        let dir = tempdir().unwrap();
        let body = "Name,State,Coordinates,resolution_tier,resolution_status,dispersed\n\
                    A,TX,\"30.2600,-97.74\",city,resolved,\n";
        let path = write(dir.path(), "pilots.csv", body);

        let store = RecordStore::load(&path).unwrap();
        assert!(store.record(0).unwrap().is_resolved());
        store.persist().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), body);
    }

    #[test]
    fn failed_status_survives_reload() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "pilots.csv",
            "Name,City,State\nJane,Toronto,ON\nBob,Austin,TX\n",
        );

        let mut store = RecordStore::load(&path).unwrap();
        store.record_mut(0).unwrap().mark_failed();
        store.persist().unwrap();

        let reloaded = RecordStore::load(&path).unwrap();
        let jane = reloaded.record(0).unwrap();
        assert_eq!(jane.status, ResolutionStatus::Failed);
        assert!(!jane.is_resolved());
        let summary = reloaded.summary();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.resolved, 0);
    }

    #[test]
    fn output_redirect_leaves_input_untouched() {
        let dir = tempdir().unwrap();
        let body = "Name,City,State\nJane,Austin,TX\n";
        let path = write(dir.path(), "pilots.csv", body);
        let output = dir.path().join("out").join("pilots_geocoded.csv");

        let store = RecordStore::load(&path).unwrap().with_output(&output);
        store.persist().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), body);
        assert!(output.exists());
    }

    #[test]
    fn discovers_largest_non_output_csv() {
        let dir = tempdir().unwrap();
        write(dir.path(), "small.csv", "State\nTX\n");
        write(dir.path(), "pilots.csv", "Name,State\nJane,TX\nBob,CA\nAmy,NY\n");
        write(
            dir.path(),
            "pilots_geocoded.csv",
            "Name,State,Coordinates\nJane,TX,\"1, 2\"\nBob,CA,\"1, 2\"\nAmy,NY,\"1, 2\"\n",
        );
        write(dir.path(), "notes.txt", "not a csv at all, but longer than the others");

        let found = discover_input(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "pilots.csv");

        let empty = tempdir().unwrap();
        assert!(matches!(discover_input(empty.path()), Err(AppError::Path(_))));
    }
}
