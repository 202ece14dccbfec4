//! Importer Service - Loads project spreadsheet rows into the relational schema
//!
//! Responsibilities:
//! - Read one spreadsheet (XLS/XLSX) or CSV export with a header row
//! - Normalize inconsistent cell types (serial dates, delimited lists, money)
//! - Upsert projects, dimension rows and junction links idempotently
//! - Skip malformed rows without losing the rest of the batch
//! - Keep the batch atomic: one transaction, commit or full rollback
//!
//! Usage:
//!   cargo run --bin importer -- --file data/projects.xlsx
//!   cargo run --bin importer -- --file data/projects.csv --replace-links
//!   cargo run --bin importer -- --file data/projects.xlsx --dry-run

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use clap::Parser;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Acquire, PgConnection, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Imports project spreadsheet rows into Postgres")]
struct Args {
    /// Spreadsheet to import (.xls/.xlsx/.ods; anything else is read as CSV)
    #[arg(long)]
    file: PathBuf,

    /// Replace the dimension links of re-imported projects instead of merging
    #[arg(long, default_value = "false")]
    replace_links: bool,

    /// Dry run - map and validate rows without touching the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Print the import report as JSON
    #[arg(long, default_value = "false")]
    json: bool,
}

// =============================================================================
// RAW INPUT
// =============================================================================

/// Spreadsheet column labels, exactly as they appear in the header row.
const COL_PROJECT_ID: &str = "ProjectID";
const COL_TITLE: &str = "Project Title";
const COL_PAAS_CODE: &str = "PAAS Code";
const COL_APPROVAL_STATUS: &str = "Approval Status";
const COL_FUND: &str = "Fund";
const COL_PAG_VALUE: &str = "PAG Value";
const COL_START_DATE: &str = "Start Date";
const COL_END_DATE: &str = "End Date";
const COL_LEAD_ORG_UNIT: &str = "Lead Org Unit";
const COL_TOTAL_EXPENDITURE: &str = "Total Expenditure";
const COL_TOTAL_CONTRIBUTION: &str = "Total Contribution";
const COL_TOTAL_PSC: &str = "Total PSC";
const COL_COUNTRIES: &str = "Country(ies)";
const COL_THEMES: &str = "Theme(s)";
const COL_DONORS: &str = "Donor(s)";

/// One cell as it comes out of the sheet, before any normalization.
#[derive(Debug, Clone, PartialEq)]
enum RawValue {
    Text(String),
    Number(f64),
    Empty,
}

/// One input row: column label -> raw cell value. Absent and empty cells are
/// equivalent.
type RawRecord = HashMap<String, RawValue>;

static EMPTY_VALUE: RawValue = RawValue::Empty;

fn field<'a>(record: &'a RawRecord, name: &str) -> &'a RawValue {
    record.get(name).unwrap_or(&EMPTY_VALUE)
}

/// Formats a numeric cell the way the sheet displayed it: integers without a
/// trailing `.0`.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn text_field(raw: &RawValue) -> Option<String> {
    match raw {
        RawValue::Text(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        RawValue::Number(value) => Some(format_number(*value)),
        RawValue::Empty => None,
    }
}

// =============================================================================
// FIELD NORMALIZER - pure, never fails
// =============================================================================

/// Day zero of the legacy spreadsheet date system.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d-%b-%y",
    "%d-%b-%Y",
    "%d %b %Y",
    "%m/%d/%y",
    "%m/%d/%Y",
    "%Y/%m/%d",
];

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() {
        return None;
    }
    let (year, month, day) = SERIAL_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(year, month, day)?;
    // Whole days only; the time-of-day fraction is discarded.
    let days = Duration::try_days(serial.trunc() as i64)?;
    epoch.checked_add_signed(days)
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(stamp.date());
        }
    }
    // A serial date that arrived as text (common in CSV exports).
    trimmed.parse::<f64>().ok().and_then(serial_to_date)
}

/// Normalizes a cell to a calendar date. Numeric cells are serial day counts
/// from the 1899-12-30 epoch; text cells are tried against the known formats.
/// Anything unparseable is `None`, never an error.
fn normalize_date(raw: &RawValue) -> Option<NaiveDate> {
    match raw {
        RawValue::Number(serial) => serial_to_date(*serial),
        RawValue::Text(text) => parse_date_text(text),
        RawValue::Empty => None,
    }
}

const MULTI_VALUE_DELIMITER: char = ';';

/// Splits a delimited cell into trimmed, non-empty parts. Order is preserved
/// and duplicates are kept; the idempotent link insert downstream absorbs
/// repeats.
fn split_multi_value(raw: &RawValue, delimiter: char) -> Vec<String> {
    match raw {
        RawValue::Text(text) => text
            .split(delimiter)
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        RawValue::Number(value) => vec![format_number(*value)],
        RawValue::Empty => Vec::new(),
    }
}

/// Best-effort coercion to a non-negative amount. The source data is known to
/// be inconsistently typed, so thousands separators and currency marks are
/// stripped and anything negative or unparseable collapses to 0.
fn to_decimal(raw: &RawValue) -> f64 {
    match raw {
        RawValue::Number(value) if value.is_finite() && *value >= 0.0 => *value,
        RawValue::Text(text) => {
            let cleaned: String = text
                .chars()
                .filter(|c| !matches!(c, ',' | '$' | ' '))
                .collect();
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite() && *value >= 0.0)
                .unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

// =============================================================================
// RECORD MAPPER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum ApprovalStatus {
    Approved,
    PendingApproval,
    /// Anything outside the two known labels is carried through as-is.
    Other(String),
}

impl ApprovalStatus {
    fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("approved") {
            ApprovalStatus::Approved
        } else if trimmed.eq_ignore_ascii_case("pending approval") {
            ApprovalStatus::PendingApproval
        } else {
            ApprovalStatus::Other(trimmed.to_string())
        }
    }

    fn as_str(&self) -> &str {
        match self {
            ApprovalStatus::Approved => "Approved",
            ApprovalStatus::PendingApproval => "Pending Approval",
            ApprovalStatus::Other(text) => text,
        }
    }
}

/// A canonical project row plus its three dimension-name lists, ready for
/// persistence.
#[derive(Debug, Clone, PartialEq)]
struct ProjectRecord {
    project_id: String,
    title: Option<String>,
    paas_code: Option<String>,
    approval_status: Option<ApprovalStatus>,
    fund: Option<String>,
    pag_value: f64,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    lead_org_unit: Option<String>,
    total_expenditure: f64,
    total_contribution: f64,
    total_psc: f64,
    countries: Vec<String>,
    themes: Vec<String>,
    donors: Vec<String>,
}

#[derive(Debug, Error)]
enum RowError {
    #[error("missing required field ProjectID")]
    MissingProjectId,
    #[error("database rejected row: {0}")]
    Persistence(#[from] sqlx::Error),
}

/// Maps one raw row onto the canonical record. `ProjectID` is the only
/// mandatory field; everything else defaults per the normalizer rules.
fn map_record(record: &RawRecord) -> Result<ProjectRecord, RowError> {
    let project_id =
        text_field(field(record, COL_PROJECT_ID)).ok_or(RowError::MissingProjectId)?;

    Ok(ProjectRecord {
        project_id,
        title: text_field(field(record, COL_TITLE)),
        paas_code: text_field(field(record, COL_PAAS_CODE)),
        approval_status: text_field(field(record, COL_APPROVAL_STATUS))
            .map(|text| ApprovalStatus::parse(&text)),
        fund: text_field(field(record, COL_FUND)),
        pag_value: to_decimal(field(record, COL_PAG_VALUE)),
        start_date: normalize_date(field(record, COL_START_DATE)),
        end_date: normalize_date(field(record, COL_END_DATE)),
        lead_org_unit: text_field(field(record, COL_LEAD_ORG_UNIT)),
        total_expenditure: to_decimal(field(record, COL_TOTAL_EXPENDITURE)),
        total_contribution: to_decimal(field(record, COL_TOTAL_CONTRIBUTION)),
        total_psc: to_decimal(field(record, COL_TOTAL_PSC)),
        countries: split_multi_value(field(record, COL_COUNTRIES), MULTI_VALUE_DELIMITER),
        themes: split_multi_value(field(record, COL_THEMES), MULTI_VALUE_DELIMITER),
        donors: split_multi_value(field(record, COL_DONORS), MULTI_VALUE_DELIMITER),
    })
}

/// Identifier for error reporting: the row's ProjectID when it has one,
/// otherwise its 1-based position in the batch.
fn row_label(record: &RawRecord, index: usize) -> String {
    text_field(field(record, COL_PROJECT_ID)).unwrap_or_else(|| format!("row {}", index + 1))
}

// =============================================================================
// SCHEMA WRITER - idempotent upserts inside the caller's transaction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkMode {
    /// Keep links from earlier imports; only add the ones on this row.
    Additive,
    /// Drop the project's existing links before inserting the new set.
    Replace,
}

struct DimensionTables {
    table: &'static str,
    name_column: &'static str,
    junction: &'static str,
}

const DIMENSIONS: [DimensionTables; 3] = [
    DimensionTables {
        table: "countries",
        name_column: "country_name",
        junction: "project_countries",
    },
    DimensionTables {
        table: "themes",
        name_column: "theme_name",
        junction: "project_themes",
    },
    DimensionTables {
        table: "donors",
        name_column: "donor_name",
        junction: "project_donors",
    },
];

/// Last-write-wins on re-import: every scalar column is overwritten.
const UPSERT_PROJECT_SQL: &str = r#"
    INSERT INTO projects (
        project_id, project_title, paas_code, approval_status, fund, pag_value,
        start_date, end_date, lead_org_unit,
        total_expenditure, total_contribution, total_psc
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (project_id) DO UPDATE SET
        project_title = EXCLUDED.project_title,
        paas_code = EXCLUDED.paas_code,
        approval_status = EXCLUDED.approval_status,
        fund = EXCLUDED.fund,
        pag_value = EXCLUDED.pag_value,
        start_date = EXCLUDED.start_date,
        end_date = EXCLUDED.end_date,
        lead_org_unit = EXCLUDED.lead_org_unit,
        total_expenditure = EXCLUDED.total_expenditure,
        total_contribution = EXCLUDED.total_contribution,
        total_psc = EXCLUDED.total_psc
"#;

/// Persists one canonical record: project upsert, then insert-if-absent for
/// every referenced dimension name and its junction link. Runs inside a
/// transaction owned by the caller; never commits or rolls back itself.
async fn upsert_project(
    conn: &mut PgConnection,
    record: &ProjectRecord,
    mode: LinkMode,
) -> Result<(), sqlx::Error> {
    sqlx::query(UPSERT_PROJECT_SQL)
        .bind(&record.project_id)
        .bind(record.title.as_deref())
        .bind(record.paas_code.as_deref())
        .bind(record.approval_status.as_ref().map(ApprovalStatus::as_str))
        .bind(record.fund.as_deref())
        .bind(record.pag_value)
        .bind(record.start_date)
        .bind(record.end_date)
        .bind(record.lead_org_unit.as_deref())
        .bind(record.total_expenditure)
        .bind(record.total_contribution)
        .bind(record.total_psc)
        .execute(&mut *conn)
        .await?;

    if mode == LinkMode::Replace {
        for dimension in &DIMENSIONS {
            let delete = format!("DELETE FROM {} WHERE project_id = $1", dimension.junction);
            sqlx::query(&delete)
                .bind(&record.project_id)
                .execute(&mut *conn)
                .await?;
        }
    }

    let name_sets = [&record.countries, &record.themes, &record.donors];
    for (dimension, names) in DIMENSIONS.iter().zip(name_sets) {
        for name in names {
            let insert_dimension = format!(
                "INSERT INTO {} ({}) VALUES ($1) ON CONFLICT DO NOTHING",
                dimension.table, dimension.name_column
            );
            sqlx::query(&insert_dimension)
                .bind(name)
                .execute(&mut *conn)
                .await?;

            let insert_link = format!(
                "INSERT INTO {} (project_id, {}) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                dimension.junction, dimension.name_column
            );
            sqlx::query(&insert_link)
                .bind(&record.project_id)
                .bind(name)
                .execute(&mut *conn)
                .await?;
        }
    }

    Ok(())
}

/// SQLSTATE classes 22 (data exception) and 23 (integrity constraint
/// violation) are scoped to the statement that raised them. Anything else
/// means the transaction itself can no longer be trusted.
fn is_row_scoped(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("22") || code.starts_with("23"))
            .unwrap_or(false),
        _ => false,
    }
}

// =============================================================================
// BATCH COORDINATOR
// =============================================================================

#[derive(Debug, Serialize)]
struct RowFailure {
    id: String,
    message: String,
}

#[derive(Debug, Default, Serialize)]
struct ImportReport {
    committed: bool,
    imported: usize,
    skipped: usize,
    errors: Vec<RowFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fatal: Option<String>,
}

impl ImportReport {
    fn record_failure(&mut self, id: String, message: String) {
        self.skipped += 1;
        self.errors.push(RowFailure { id, message });
    }
}

/// Writes one row inside its own savepoint so a rejected statement cannot
/// poison the enclosing batch transaction.
async fn write_row(
    tx: &mut Transaction<'_, Postgres>,
    project: &ProjectRecord,
    mode: LinkMode,
) -> Result<(), sqlx::Error> {
    let mut savepoint = tx.begin().await?;
    match upsert_project(&mut savepoint, project, mode).await {
        Ok(()) => savepoint.commit().await,
        Err(error) => {
            savepoint.rollback().await?;
            Err(error)
        }
    }
}

struct BatchImporter {
    pool: PgPool,
    mode: LinkMode,
}

impl BatchImporter {
    fn new(pool: PgPool, mode: LinkMode) -> Self {
        Self { pool, mode }
    }

    /// Runs one batch to completion. Malformed or rejected rows are recorded
    /// in the report and the batch keeps going; a batch-fatal error (lost
    /// connection, broken transaction) rolls everything back and the report
    /// comes back with `committed: false` and the root cause.
    async fn run(&self, records: &[RawRecord]) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open the import transaction")?;

        for (index, record) in records.iter().enumerate() {
            let label = row_label(record, index);

            let project = match map_record(record) {
                Ok(project) => project,
                Err(error) => {
                    eprintln!("Warning: skipping {}: {}", label, error);
                    report.record_failure(label, error.to_string());
                    continue;
                }
            };

            match write_row(&mut tx, &project, self.mode).await {
                Ok(()) => report.imported += 1,
                Err(error) if is_row_scoped(&error) => {
                    let error = RowError::Persistence(error);
                    eprintln!("Warning: skipping {}: {}", label, error);
                    report.record_failure(label, error.to_string());
                }
                Err(error) => {
                    // Dropping the transaction would also roll back, but be
                    // explicit about discarding the batch.
                    tx.rollback().await.ok();
                    report.fatal = Some(error.to_string());
                    return Ok(report);
                }
            }
        }

        match tx.commit().await {
            Ok(()) => {
                report.committed = true;
                Ok(report)
            }
            Err(error) => {
                report.fatal = Some(error.to_string());
                Ok(report)
            }
        }
    }
}

// =============================================================================
// INPUT READERS - XLS/XLSX via calamine, CSV via csv
// =============================================================================

fn cell_to_raw(cell: &Data) -> RawValue {
    match cell {
        Data::String(text) => {
            if text.trim().is_empty() {
                RawValue::Empty
            } else {
                RawValue::Text(text.clone())
            }
        }
        Data::Float(value) => RawValue::Number(*value),
        Data::Int(value) => RawValue::Number(*value as f64),
        // Date-typed cells surface as the underlying serial number.
        Data::DateTime(stamp) => RawValue::Number(stamp.as_f64()),
        Data::DateTimeIso(text) => RawValue::Text(text.clone()),
        Data::DurationIso(text) => RawValue::Text(text.clone()),
        Data::Bool(flag) => RawValue::Text(flag.to_string()),
        Data::Error(_) | Data::Empty => RawValue::Empty,
    }
}

fn read_workbook(path: &Path) -> Result<Vec<RawRecord>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.display()))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = sheet_names.first().context("workbook has no sheets")?.clone();

    let range = workbook
        .worksheet_range(&sheet_name)
        .context("failed to read the first worksheet")?;

    let mut rows = range.rows();
    let headers: Vec<String> = rows
        .next()
        .context("worksheet has no header row")?
        .iter()
        .map(|cell| match cell {
            Data::String(text) => text.trim().to_string(),
            Data::Empty => String::new(),
            other => format!("{}", other),
        })
        .collect();

    let mut records = Vec::new();
    for row in rows {
        let mut record = RawRecord::new();
        for (header, cell) in headers.iter().zip(row) {
            if header.is_empty() {
                continue;
            }
            let value = cell_to_raw(cell);
            if value != RawValue::Empty {
                record.insert(header.clone(), value);
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }

    Ok(records)
}

fn parse_csv_records(content: &str) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("failed to read CSV headers")?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();

    let mut records = Vec::new();
    for (line_index, result) in reader.records().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(error) => {
                eprintln!(
                    "Warning: skipping line {} due to error: {}",
                    line_index + 2,
                    error
                );
                continue;
            }
        };
        let mut record = RawRecord::new();
        for (header, value) in headers.iter().zip(row.iter()) {
            if header.is_empty() || value.is_empty() {
                continue;
            }
            record.insert(header.clone(), RawValue::Text(value.to_string()));
        }
        if !record.is_empty() {
            records.push(record);
        }
    }

    Ok(records)
}

fn read_records(path: &Path) -> Result<Vec<RawRecord>> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "xls" | "xlsx" | "xlsm" | "xlsb" | "ods" => read_workbook(path),
        _ => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
            parse_csv_records(content)
        }
    }
}

// =============================================================================
// MAIN
// =============================================================================

fn print_report(report: &ImportReport) {
    println!("\n=== Import Report ===");
    println!("Committed: {}", report.committed);
    println!("Imported:  {}", report.imported);
    println!("Skipped:   {}", report.skipped);
    if !report.errors.is_empty() {
        println!("Row errors ({}):", report.errors.len());
        for (i, failure) in report.errors.iter().take(10).enumerate() {
            println!("  [{}] {}: {}", i + 1, failure.id, failure.message);
        }
        if report.errors.len() > 10 {
            println!("  ... and {} more", report.errors.len() - 10);
        }
    }
    if let Some(fatal) = &report.fatal {
        println!("Fatal: {}", fatal);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Project Importer ===");
    println!("File: {}", args.file.display());
    println!(
        "Link mode: {}",
        if args.replace_links { "replace" } else { "additive" }
    );
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let records = read_records(&args.file)?;
    println!("Found {} data rows", records.len());

    if args.dry_run {
        let mut importable = 0usize;
        let mut rejected = 0usize;
        for (index, record) in records.iter().enumerate() {
            match map_record(record) {
                Ok(_) => importable += 1,
                Err(error) => {
                    eprintln!("Warning: would skip {}: {}", row_label(record, index), error);
                    rejected += 1;
                }
            }
        }
        println!("\nDry run - no rows written");
        println!("Importable: {}", importable);
        println!("Rejected:   {}", rejected);
        return Ok(());
    }

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let mode = if args.replace_links {
        LinkMode::Replace
    } else {
        LinkMode::Additive
    };
    let report = BatchImporter::new(pool, mode).run(&records).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.committed {
        anyhow::bail!(
            "import rolled back: {}",
            report.fatal.as_deref().unwrap_or("batch did not commit")
        );
    }

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
