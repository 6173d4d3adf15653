//! Measurement table storage.
//!
//! A measurement file is a flat, append-only table:
//!
//! | time_seconds | voltage_sensor1 | voltage_sensor2 | height_sensor1 | height_sensor2 |
//! |---|---|---|---|---|
//!
//! Height cells are blank when the sensor was not calibrated. Older files
//! without the height columns still load; their heights come back as `None`.
//!
//! Two sinks implement [`TabularSink`]:
//!
//! - [`XlsxSink`]: spreadsheet output; each flush rewrites the workbook with
//!   every row accepted so far
//! - `CsvSink` (feature `storage_csv`, on by default): buffered appends

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use calamine::{open_workbook, Data, Reader, Xlsx};
use rust_xlsxwriter::{Workbook, XlsxError};
use tracing::{debug, info};

use crate::error::{DaqError, Result};

/// Column names in file order.
pub const COLUMNS: [&str; 5] = [
    "time_seconds",
    "voltage_sensor1",
    "voltage_sensor2",
    "height_sensor1",
    "height_sensor2",
];

/// Columns a file must contain to be loaded.
const REQUIRED_COLUMNS: usize = 3;

/// One logged row. Never mutated after it is appended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementRow {
    /// Elapsed time derived from the row index (s)
    pub elapsed_s: f64,
    /// Sensor 1 mean voltage (V)
    pub voltage1: f64,
    /// Sensor 2 mean voltage (V)
    pub voltage2: f64,
    /// Sensor 1 height (cm)
    pub height1: Option<f64>,
    /// Sensor 2 height (cm)
    pub height2: Option<f64>,
}

impl MeasurementRow {
    /// All five columns; missing heights become NaN.
    pub fn to_array(&self) -> [f64; 5] {
        [
            self.elapsed_s,
            self.voltage1,
            self.voltage2,
            self.height1.unwrap_or(f64::NAN),
            self.height2.unwrap_or(f64::NAN),
        ]
    }

    fn cells(&self) -> [Option<f64>; 5] {
        [
            Some(self.elapsed_s),
            Some(self.voltage1),
            Some(self.voltage2),
            self.height1,
            self.height2,
        ]
    }
}

/// Append-only destination for measurement rows.
pub trait TabularSink: Send {
    /// Create (or truncate) the file at `path` and write the header.
    fn create(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Accept rows. They reach the file on the next flush.
    fn append(&mut self, rows: &[MeasurementRow]) -> Result<()>;

    /// Persist every accepted row.
    fn flush(&mut self) -> Result<()>;

    /// Final flush; further appends fail.
    fn close(&mut self) -> Result<()>;

    /// Rows persisted by the last successful flush.
    fn rows_written(&self) -> u64;

    /// Destination file.
    fn path(&self) -> &Path;
}

/// Data rows that fit in one worksheet below the header row.
pub const XLSX_MAX_ROWS: usize = 1_048_575;

/// Spreadsheet sink.
///
/// Accepted rows stay in memory for the whole run and every flush rewrites
/// the workbook, so memory and flush time grow with the run. A sheet holds at
/// most [`XLSX_MAX_ROWS`] rows (about 17 minutes at a 1 ms period); appends
/// past that fail. Long or fast runs should use the CSV sink.
#[derive(Debug)]
pub struct XlsxSink {
    path: PathBuf,
    rows: Vec<MeasurementRow>,
    written: u64,
    closed: bool,
    max_rows: usize,
}

impl XlsxSink {
    #[cfg(test)]
    fn with_row_limit(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    fn save(&self) -> Result<()> {
        write_workbook(&self.path, &self.rows).map_err(|e| DaqError::persistence(&self.path, e))
    }
}

fn write_workbook(path: &Path, rows: &[MeasurementRow]) -> std::result::Result<(), XlsxError> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Measurements")?;

    for (col, name) in COLUMNS.iter().enumerate() {
        sheet.write_string(0, col as u16, *name)?;
    }
    for (i, row) in rows.iter().enumerate() {
        let r = i as u32 + 1;
        for (col, cell) in row.cells().iter().enumerate() {
            if let Some(value) = cell.filter(|v| v.is_finite()) {
                sheet.write_number(r, col as u16, value)?;
            }
        }
    }

    workbook.save(path)
}

impl TabularSink for XlsxSink {
    fn create(path: &Path) -> Result<Self> {
        let sink = Self {
            path: path.to_path_buf(),
            rows: Vec::new(),
            written: 0,
            closed: false,
            max_rows: XLSX_MAX_ROWS,
        };
        sink.save()?;
        info!(path = %path.display(), "Created measurement workbook");
        Ok(sink)
    }

    fn append(&mut self, rows: &[MeasurementRow]) -> Result<()> {
        if self.closed {
            return Err(DaqError::persistence(&self.path, "sink is closed"));
        }
        if self.rows.len() + rows.len() > self.max_rows {
            return Err(DaqError::persistence(
                &self.path,
                format!("worksheet full at {} rows; record to .csv for longer runs", self.max_rows),
            ));
        }
        self.rows.extend_from_slice(rows);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.rows.len() as u64 == self.written {
            return Ok(());
        }
        self.save()?;
        self.written = self.rows.len() as u64;
        debug!(path = %self.path.display(), rows = self.written, "Flushed measurement workbook");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let outcome = self.flush();
        self.closed = true;
        outcome
    }

    fn rows_written(&self) -> u64 {
        self.written
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_sink::CsvSink;

#[cfg(feature = "storage_csv")]
mod csv_sink {
    use std::fs::File;
    use std::path::{Path, PathBuf};

    use tracing::{debug, info};

    use super::{MeasurementRow, TabularSink, COLUMNS};
    use crate::error::{DaqError, Result};

    /// Comma-separated sink.
    #[derive(Debug)]
    pub struct CsvSink {
        path: PathBuf,
        writer: Option<csv::Writer<File>>,
        appended: u64,
        written: u64,
    }

    impl TabularSink for CsvSink {
        fn create(path: &Path) -> Result<Self> {
            let file = File::create(path).map_err(|e| DaqError::persistence(path, e))?;
            let mut writer = csv::Writer::from_writer(file);
            writer
                .write_record(COLUMNS)
                .and_then(|()| writer.flush().map_err(csv::Error::from))
                .map_err(|e| DaqError::persistence(path, e))?;
            info!(path = %path.display(), "Created measurement CSV");
            Ok(Self {
                path: path.to_path_buf(),
                writer: Some(writer),
                appended: 0,
                written: 0,
            })
        }

        fn append(&mut self, rows: &[MeasurementRow]) -> Result<()> {
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| DaqError::persistence(&self.path, "sink is closed"))?;
            for row in rows {
                let record: Vec<String> = row
                    .cells()
                    .iter()
                    .map(|c| c.map_or(String::new(), |v| v.to_string()))
                    .collect();
                writer
                    .write_record(&record)
                    .map_err(|e| DaqError::persistence(&self.path, e))?;
                self.appended += 1;
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            if let Some(writer) = self.writer.as_mut() {
                writer
                    .flush()
                    .map_err(|e| DaqError::persistence(&self.path, e))?;
                self.written = self.appended;
                debug!(path = %self.path.display(), rows = self.written, "Flushed measurement CSV");
            }
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            let outcome = self.flush();
            self.writer = None;
            outcome
        }

        fn rows_written(&self) -> u64 {
            self.written
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

/// Open the sink matching the file extension.
pub fn sink_for_path(path: &Path) -> Result<Box<dyn TabularSink>> {
    match extension(path).as_str() {
        "xlsx" => Ok(Box::new(XlsxSink::create(path)?)),
        #[cfg(feature = "storage_csv")]
        "csv" => Ok(Box::new(CsvSink::create(path)?)),
        #[cfg(not(feature = "storage_csv"))]
        "csv" => Err(DaqError::Validation(
            "CSV support is not enabled. Rebuild with --features storage_csv".to_string(),
        )),
        other => Err(DaqError::Validation(format!(
            "Unsupported measurement file extension '.{other}'"
        ))),
    }
}

/// Load a measurement file written by one of the sinks (or by hand).
///
/// The time and both voltage columns are required; height columns are
/// optional and blank cells load as `None`.
pub fn load_measurements(path: &Path) -> Result<Vec<MeasurementRow>> {
    let table = match extension(path).as_str() {
        "xlsx" => read_xlsx(path)?,
        #[cfg(feature = "storage_csv")]
        "csv" => read_csv(path)?,
        other => {
            return Err(DaqError::Validation(format!(
                "Unsupported measurement file extension '.{other}'"
            )))
        }
    };
    let rows = rows_from_table(path, table)?;
    info!(path = %path.display(), rows = rows.len(), "Loaded measurements");
    Ok(rows)
}

/// Header names plus raw cells, one `Option<f64>` per column.
struct RawTable {
    header: Vec<String>,
    rows: Vec<Vec<Option<f64>>>,
}

fn read_xlsx(path: &Path) -> Result<RawTable> {
    let mut workbook: Xlsx<_> = open_workbook(path).map_err(|e| DaqError::persistence(path, e))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| DaqError::persistence(path, "workbook has no worksheet"))?
        .map_err(|e| DaqError::persistence(path, e))?;

    let mut rows = range.rows();
    let header = rows
        .next()
        .map(|cells| cells.iter().map(|c| c.to_string().trim().to_string()).collect())
        .unwrap_or_default();
    let rows = rows
        .map(|cells| cells.iter().map(cell_value).collect())
        .collect();
    Ok(RawTable { header, rows })
}

fn cell_value(cell: &Data) -> Option<f64> {
    match cell {
        Data::Float(f) => Some(*f),
        Data::Int(i) => Some(*i as f64),
        Data::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(feature = "storage_csv")]
fn read_csv(path: &Path) -> Result<RawTable> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| DaqError::persistence(path, e))?;
    let header = reader
        .headers()
        .map_err(|e| DaqError::persistence(path, e))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| DaqError::persistence(path, e))?;
        rows.push(record.iter().map(|f| f.trim().parse().ok()).collect());
    }
    Ok(RawTable { header, rows })
}

fn rows_from_table(path: &Path, table: RawTable) -> Result<Vec<MeasurementRow>> {
    let index: HashMap<&str, usize> = table
        .header
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let missing: Vec<&str> = COLUMNS[..REQUIRED_COLUMNS]
        .iter()
        .copied()
        .filter(|c| !index.contains_key(c))
        .collect();
    if !missing.is_empty() {
        return Err(DaqError::persistence(
            path,
            format!(
                "file must contain the columns {:?}; missing {:?}",
                &COLUMNS[..REQUIRED_COLUMNS],
                missing
            ),
        ));
    }

    let columns: Vec<Option<usize>> = COLUMNS.iter().map(|c| index.get(c).copied()).collect();
    let cell = |row: &[Option<f64>], col: usize| -> Option<f64> {
        columns[col].and_then(|i| row.get(i).copied().flatten())
    };

    table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row.iter().any(Option::is_some))
        .map(|(i, row)| {
            let required = |col: usize| {
                cell(row, col).ok_or_else(|| {
                    DaqError::persistence(
                        path,
                        format!("row {}: missing value for '{}'", i + 2, COLUMNS[col]),
                    )
                })
            };
            Ok(MeasurementRow {
                elapsed_s: required(0)?,
                voltage1: required(1)?,
                voltage2: required(2)?,
                height1: cell(row, 3),
                height2: cell(row, 4),
            })
        })
        .collect()
}
