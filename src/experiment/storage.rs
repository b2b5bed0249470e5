use chrono::{DateTime, Local};
use csv::WriterBuilder;
use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::data::{format_sig, format_timestamp, Layout, Reading, ResultTable, ERROR_MARKER};
use super::{Result, SessionError};

/// How a finished table is written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Comma-separated rows appended to one growing file.
    Csv,
    /// A new `.xlsx` file per campaign.
    #[default]
    Workbook,
}

fn fs_error(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError + '_ {
    move |source| SessionError::Filesystem {
        path: path.to_path_buf(),
        source,
    }
}

/// Appends the table's rows to the CSV file at `path`.
///
/// The header goes in only when the file is empty, so repeated campaigns
/// accumulate under a single header.
pub fn append_csv(table: &ResultTable, path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(fs_error(parent))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(fs_error(path))?;
    let is_empty = file.metadata().map_err(fs_error(path))?.len() == 0;

    if !is_empty {
        check_existing_header(path, table.layout());
    }

    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
    if is_empty {
        writer.write_record(table.header())?;
    }
    for row in table.rows() {
        writer.write_record(&row)?;
    }
    writer.flush().map_err(fs_error(path))?;

    info!("Appended {} rows to {}", table.len(), path.display());
    Ok(path.to_path_buf())
}

fn check_existing_header(path: &Path, layout: Layout) {
    let mut first_line = String::new();
    let read = File::open(path).and_then(|f| BufReader::new(f).read_line(&mut first_line));
    if read.is_ok() && first_line.trim_end() != layout.header().join(",") {
        warn!(
            "{} starts with a different header; appending {:?} rows anyway",
            path.display(),
            layout
        );
    }
}

pub fn workbook_file_name(started_at: DateTime<Local>) -> String {
    started_at
        .format("measurement_%Y%m%d_%H%M%S.xlsx")
        .to_string()
}

/// Writes the table to a fresh workbook inside `folder`, creating the folder
/// if needed. Always uses the derived column set.
pub fn write_workbook(table: &ResultTable, folder: &Path) -> Result<PathBuf> {
    fs::create_dir_all(folder).map_err(fs_error(folder))?;
    let path = folder.join(workbook_file_name(table.started_at()));

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Measurements")?;

    for (col, title) in Layout::Derived.header().iter().enumerate() {
        sheet.write_string(0, col as u16, *title)?;
    }

    for (i, sample) in table.samples().iter().enumerate() {
        let row = i as u32 + 1;
        write_reading(sheet, row, 0, sample.rms(), |v| v)?;
        write_reading(sheet, row, 1, sample.pkpk(), |v| v)?;
        write_reading(sheet, row, 2, sample.frequency(), |v| {
            format_sig(v, 4).parse().unwrap_or(v)
        })?;
        if let Some(d) = sample.derived() {
            for (col, value) in [d.current_rms, d.current_pkpk, d.power_rms, d.power_pkpk]
                .into_iter()
                .enumerate()
            {
                sheet.write_number(row, col as u16 + 3, value)?;
            }
        }
        sheet.write_string(row, 7, format_timestamp(sample.timestamp()))?;
    }

    workbook.save(&path)?;
    info!("Results saved to {}", path.display());
    Ok(path)
}

fn write_reading(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    reading: &Reading,
    display: impl Fn(f64) -> f64,
) -> std::result::Result<(), XlsxError> {
    match reading.value() {
        Some(v) => sheet.write_number(row, col, display(v))?,
        None => sheet.write_string(row, col, ERROR_MARKER)?,
    };
    Ok(())
}
