// Google Sheets v4 worksheet
//
// Searches read the worksheet's formatted values in one request and scan
// them locally; updates write a single A1 cell with USER_ENTERED input so
// the sheet applies its own number formatting.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::auth::{ServiceAccountKey, TokenProvider};
use super::{truncate_body, CellRef, SheetError, Worksheet};

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets/";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

/// Finds the first cell equal to `text`, scanning rows top to bottom
pub(crate) fn find_in_grid(grid: &[Vec<String>], text: &str) -> Option<CellRef> {
    grid.iter().enumerate().find_map(|(row, cells)| {
        cells
            .iter()
            .position(|cell| cell == text)
            .map(|col| CellRef::new(row as u32 + 1, col as u32 + 1))
    })
}

/// Range expression addressing a whole worksheet or one of its cells
///
/// Titles are always quoted so names with spaces or punctuation work.
fn sheet_range(worksheet: &str, cell: Option<CellRef>) -> String {
    let quoted = format!("'{}'", worksheet.replace('\'', "''"));
    match cell {
        Some(cell) => format!("{}!{}", quoted, cell.to_a1()),
        None => quoted,
    }
}

/// Turns a non-2xx Sheets API response into a `SheetError::Status`
///
/// A 401/403 from the Sheets API is a per-request refusal (protected range,
/// missing share) and only skips the metric being written. Credential
/// problems surface from the token endpoint instead, see `auth`.
async fn check_status(response: Response) -> Result<Response, SheetError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    // The body carries the API's reason, e.g. "You are trying to edit a protected cell"
    let body = response.text().await.unwrap_or_default();
    Err(SheetError::Status {
        status,
        body: truncate_body(body),
    })
}

/// One worksheet (tab) of a Google spreadsheet
pub struct GoogleWorksheet {
    client: Client,
    tokens: TokenProvider,
    spreadsheet_url: Url,
    worksheet: String,
}

impl GoogleWorksheet {
    /// Authorizes with the service account key and opens the worksheet
    ///
    /// This performs a token exchange and a metadata request, so wrong
    /// credentials, an unknown sheet key or a missing worksheet title all
    /// fail here rather than at the first scheduled run.
    ///
    /// # Arguments
    /// * `key_file` - service account JSON key
    /// * `sheet_key` - spreadsheet id
    /// * `worksheet` - worksheet title
    /// * `timeout` - per-request timeout
    pub async fn open(
        key_file: &std::path::Path,
        sheet_key: &str,
        worksheet: &str,
        timeout: Duration,
    ) -> Result<Self, SheetError> {
        let key = ServiceAccountKey::load(key_file)?;
        let client = Client::builder().timeout(timeout).build()?;

        let mut spreadsheet_url = Url::parse(SHEETS_API)
            .map_err(|e| SheetError::Credentials(format!("invalid API url: {}", e)))?;
        spreadsheet_url
            .path_segments_mut()
            .map_err(|_| SheetError::Credentials("API url cannot be a base".to_string()))?
            .pop_if_empty()
            .push(sheet_key);

        let sheet = GoogleWorksheet {
            tokens: TokenProvider::new(key, client.clone()),
            client,
            spreadsheet_url,
            worksheet: worksheet.to_string(),
        };

        info!("Authorizing spreadsheet access as {}", sheet.tokens.client_email());
        sheet.ensure_worksheet().await?;
        info!("Opened worksheet '{}' of spreadsheet {}", worksheet, sheet_key);

        Ok(sheet)
    }

    /// Checks that the configured worksheet tab exists
    ///
    /// Only the tab titles are requested, not the cell data.
    ///
    /// # Returns
    /// * `Ok(())` - the tab is present
    /// * `Err(SheetError::WorksheetNotFound)` - the spreadsheet opened but has no such tab
    async fn ensure_worksheet(&self) -> Result<(), SheetError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .get(self.spreadsheet_url.clone())
            .query(&[("fields", "sheets.properties.title")])
            .bearer_auth(token)
            .send()
            .await?;

        let meta: SpreadsheetMeta = check_status(response).await?.json().await?;
        if meta
            .sheets
            .iter()
            .any(|sheet| sheet.properties.title == self.worksheet)
        {
            Ok(())
        } else {
            Err(SheetError::WorksheetNotFound(self.worksheet.clone()))
        }
    }

    /// `.../spreadsheets/{id}/values/{range}`
    fn values_url(&self, cell: Option<CellRef>) -> Url {
        let mut url = self.spreadsheet_url.clone();
        // Pushed as a segment so the quoted range gets percent-encoded
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("values").push(&sheet_range(&self.worksheet, cell));
        }
        url
    }
}

#[async_trait]
impl Worksheet for GoogleWorksheet {
    /// Reads the whole worksheet and scans it locally
    ///
    /// The API has no server-side cell search. Trailing empty rows and cells
    /// are omitted from the response, which does not affect the scan.
    async fn find(&self, text: &str) -> Result<Option<CellRef>, SheetError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .get(self.values_url(None))
            .query(&[("majorDimension", "ROWS")])
            .bearer_auth(token)
            .send()
            .await?;

        let range: ValueRange = check_status(response).await?.json().await?;
        let found = find_in_grid(&range.values, text);
        debug!("Lookup '{}' in '{}': {:?}", text, self.worksheet, found);
        Ok(found)
    }

    /// Writes one cell through the `values.update` endpoint
    ///
    /// `USER_ENTERED` makes the sheet store a number, as if typed in.
    async fn update_value(&self, cell: CellRef, value: f64) -> Result<(), SheetError> {
        let token = self.tokens.access_token().await?;
        let range = sheet_range(&self.worksheet, Some(cell));
        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": [[value]],
        });

        let response = self
            .client
            .put(self.values_url(Some(cell)))
            .query(&[("valueInputOption", "USER_ENTERED")])
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}
