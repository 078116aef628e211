// Sheet module - locating and writing metric cells in the spreadsheet
//
// The spreadsheet is a grid with one row per metric (labelled by the
// metric's sheet label) and one column per day (labelled MM/DD/YYYY).
// Writing a metric means finding both labels and updating the cell where
// they cross.
//
// The remote worksheet sits behind the `Worksheet` trait. `google` holds
// the Google Sheets implementation and `auth` its service account login.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub mod auth;
pub mod google;

pub use google::GoogleWorksheet;

/// Errors that can occur while reading or writing the worksheet
#[derive(Error, Debug)]
pub enum SheetError {
    #[error("Metric label '{0}' not found in worksheet")]
    LabelNotFound(String),

    #[error("Date '{0}' not found in worksheet")]
    DateNotFound(String),

    #[error("Worksheet '{0}' does not exist in the spreadsheet")]
    WorksheetNotFound(String),

    #[error("Spreadsheet request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Spreadsheet API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Malformed spreadsheet response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid service account key: {0}")]
    Credentials(String),

    #[error("Spreadsheet credentials rejected: {0}")]
    Auth(String),
}

impl SheetError {
    /// Whether this error should stop the process instead of skipping a metric
    ///
    /// Rejected or unusable credentials will fail every later write too.
    /// Non-2xx answers from the Sheets API itself (`Status`) are not fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SheetError::Credentials(_) | SheetError::Auth(_) | SheetError::WorksheetNotFound(_)
        )
    }
}

/// Longest response body quoted in an error
const MAX_ERROR_BODY: usize = 512;

/// Cuts an error body down to `MAX_ERROR_BODY` bytes on a char boundary
pub(crate) fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// 1-based cell coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(row: u32, col: u32) -> Self {
        CellRef { row, col }
    }

    /// A1 notation, e.g. `(3, 28)` -> `AB3`
    pub fn to_a1(self) -> String {
        format!("{}{}", column_letters(self.col), self.row)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

/// Converts a 1-based column index to its letter form (1 -> A, 27 -> AA)
fn column_letters(mut col: u32) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.push(b'A' + rem as u8);
        col = (col - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Text used for a day's column header
pub fn date_label(date: NaiveDate) -> String {
    date.format("%m/%d/%Y").to_string()
}

/// A remote worksheet supporting text search and single-cell updates
#[async_trait]
pub trait Worksheet: Send + Sync {
    /// Finds the first cell whose text exactly equals `text`, row by row
    async fn find(&self, text: &str) -> Result<Option<CellRef>, SheetError>;

    /// Overwrites one cell with a numeric value
    async fn update_value(&self, cell: CellRef, value: f64) -> Result<(), SheetError>;
}

/// Writes metric values at the crossing of their label row and date column
pub struct SheetWriter {
    worksheet: Arc<dyn Worksheet>,
}

impl SheetWriter {
    pub fn new(worksheet: Arc<dyn Worksheet>) -> Self {
        SheetWriter { worksheet }
    }

    /// Writes `value` into the row labelled `sheet_label` and the column labelled `date`
    ///
    /// # Returns
    /// * `Ok(CellRef)` - the cell that was written
    /// * `Err(SheetError::LabelNotFound | DateNotFound)` - nothing was written
    /// * `Err(SheetError)` - the lookup or update request itself failed
    pub async fn write_metric(
        &self,
        sheet_label: &str,
        date: &str,
        value: f64,
    ) -> Result<CellRef, SheetError> {
        let row = self
            .worksheet
            .find(sheet_label)
            .await?
            .ok_or_else(|| SheetError::LabelNotFound(sheet_label.to_string()))?
            .row;

        let col = self
            .worksheet
            .find(date)
            .await?
            .ok_or_else(|| SheetError::DateNotFound(date.to_string()))?
            .col;

        let cell = CellRef::new(row, col);
        self.worksheet.update_value(cell, value).await?;

        debug!("Wrote {} to {} ('{}' / {})", value, cell, sheet_label, date);
        Ok(cell)
    }
}
