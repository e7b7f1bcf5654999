//! Table extraction and schema-driven row normalization.
//!
//! Archive pages carry their statistics in plain HTML tables. Each endpoint
//! has a declared column layout; rows are mapped onto it positionally. Rows
//! that cannot describe an entity (headers, footers, totals) are dropped
//! under a named rule. Cells that should be numeric but are not fail the
//! whole table instead of being coerced.

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use shared::{Candidate, EndpointKind, Period};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseFailure {
    #[error("{field}: '{value}' is not an integer (table {table_index}, row {row_index})")]
    Integer {
        field: &'static str,
        value: String,
        table_index: usize,
        row_index: usize,
    },

    #[error("{field}: '{value}' is not a decimal (table {table_index}, row {row_index})")]
    Decimal {
        field: &'static str,
        value: String,
        table_index: usize,
        row_index: usize,
    },

    #[error("unknown endpoint kind: {0}")]
    UnknownEndpoint(String),

    #[error("{endpoint} page has no table of the expected layout: widest row has {widest_row} cells, {required} required")]
    UnrecognisedLayout {
        endpoint: EndpointKind,
        widest_row: usize,
        required: usize,
    },

    #[error("invalid selector: {0}")]
    Selector(String),
}

/// Where a row came from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Provenance {
    pub period: Period,
    pub candidate_id: i64,
    pub endpoint: EndpointKind,
    pub table_index: usize,
    pub row_index: usize,
}

/// Cells of one `tr`, trimmed and whitespace-collapsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCells {
    pub cells: Vec<String>,
    /// Every cell of the row is a `th`
    pub header: bool,
}

/// One table's rows, as found in the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCells {
    pub rows: Vec<RowCells>,
}

/// A parsed table row before semantic mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub cells: Vec<String>,
    pub header: bool,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub index: usize,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    pub fn new(candidate: Candidate, endpoint: EndpointKind, index: usize, table: TableCells) -> Self {
        let rows = table
            .rows
            .into_iter()
            .enumerate()
            .map(|(row_index, row)| RawRow {
                cells: row.cells,
                header: row.header,
                provenance: Provenance {
                    period: candidate.period,
                    candidate_id: candidate.candidate_id,
                    endpoint,
                    table_index: index,
                    row_index,
                },
            })
            .collect();
        Self { index, rows }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Decimal,
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn col(name: &'static str, ty: FieldType) -> ColumnSpec {
    ColumnSpec { name, ty }
}

/// Positional column layout of one endpoint's table
#[derive(Debug, Clone, Copy)]
pub struct ColumnSchema {
    pub endpoint: EndpointKind,
    pub columns: &'static [ColumnSpec],
    /// Rows with fewer cells are not entities
    pub required: usize,
    pub rank_column: usize,
    /// Column that must hold a non-numeric name
    pub name_column: usize,
    pub first_name_column: Option<usize>,
    pub surname_column: Option<usize>,
    pub team_column: usize,
}

const STANDINGS_COLUMNS: &[ColumnSpec] = &[
    col("rank", FieldType::Integer),
    col("team_name", FieldType::Text),
    col("games", FieldType::Integer),
    col("wins", FieldType::Integer),
    col("losses", FieldType::Integer),
    col("points", FieldType::Integer),
    col("baskets", FieldType::Text),
    col("basket_diff", FieldType::Integer),
];

const TOP_SCORER_COLUMNS: &[ColumnSpec] = &[
    col("scoring_rank", FieldType::Integer),
    col("surname", FieldType::Text),
    col("first_name", FieldType::Text),
    col("team_name", FieldType::Text),
    col("total_points", FieldType::Integer),
    col("games", FieldType::Integer),
    col("points_per_game", FieldType::Decimal),
];

const FREE_THROW_COLUMNS: &[ColumnSpec] = &[
    col("ft_rank", FieldType::Integer),
    col("surname", FieldType::Text),
    col("first_name", FieldType::Text),
    col("team_name", FieldType::Text),
    col("ft_attempted", FieldType::Integer),
    col("ft_made", FieldType::Integer),
    col("ft_percentage", FieldType::Decimal),
];

const THREE_POINTER_COLUMNS: &[ColumnSpec] = &[
    col("threes_rank", FieldType::Integer),
    col("surname", FieldType::Text),
    col("first_name", FieldType::Text),
    col("team_name", FieldType::Text),
    col("threes_made", FieldType::Integer),
    col("games", FieldType::Integer),
    col("threes_per_game", FieldType::Decimal),
];

impl ColumnSchema {
    pub fn for_endpoint(endpoint: EndpointKind) -> Self {
        match endpoint {
            EndpointKind::Standings => Self {
                endpoint,
                columns: STANDINGS_COLUMNS,
                required: 8,
                rank_column: 0,
                name_column: 1,
                first_name_column: None,
                surname_column: None,
                team_column: 1,
            },
            EndpointKind::TopScorers => Self::player(endpoint, TOP_SCORER_COLUMNS),
            EndpointKind::FreeThrows => Self::player(endpoint, FREE_THROW_COLUMNS),
            EndpointKind::ThreePointers => Self::player(endpoint, THREE_POINTER_COLUMNS),
        }
    }

    /// Look a schema up by endpoint name
    pub fn by_name(name: &str) -> Result<Self, ParseFailure> {
        name.parse::<EndpointKind>()
            .map(Self::for_endpoint)
            .map_err(|_| ParseFailure::UnknownEndpoint(name.to_string()))
    }

    fn player(endpoint: EndpointKind, columns: &'static [ColumnSpec]) -> Self {
        Self {
            endpoint,
            columns,
            required: 7,
            rank_column: 0,
            name_column: 1,
            first_name_column: Some(2),
            surname_column: Some(1),
            team_column: 3,
        }
    }
}

/// Why a row was not turned into a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    TooFewColumns,
    HeaderRow,
    NameMissing,
    NameNumeric,
    NotRanked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Decimal(f64),
    Text(String),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Decimal(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

/// A row mapped through its endpoint schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub identity_key: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: Vec<NormalizedRecord>,
    pub dropped: Vec<(Provenance, DropReason)>,
}

impl Normalized {
    pub fn dropped_by(&self, reason: DropReason) -> usize {
        self.dropped.iter().filter(|(_, r)| *r == reason).count()
    }
}

/// Case-folded, whitespace-collapsed `first|surname|team`
pub fn identity_key(first_name: &str, surname: &str, team_name: &str) -> String {
    [first_name, surname, team_name]
        .iter()
        .map(|part| collapse_whitespace(&part.to_lowercase()))
        .collect::<Vec<_>>()
        .join("|")
}

fn collapse_whitespace(s: &str) -> String {
    s.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn selector(css: &str) -> Result<Selector, ParseFailure> {
    Selector::parse(css).map_err(|e| ParseFailure::Selector(e.to_string()))
}

/// Extract every table of a document, outer tables first.
///
/// Rows belong to their nearest enclosing table, so layout tables wrapping a
/// statistics table do not swallow its rows.
pub fn extract_tables(html: &str) -> Result<Vec<TableCells>, ParseFailure> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;

    let mut tables = Vec::new();
    for table in document.select(&table_sel) {
        let mut rows = Vec::new();
        for row in table.select(&row_sel) {
            let owner = row.ancestors().find(|n| {
                n.value()
                    .as_element()
                    .map(|e| e.name() == "table")
                    .unwrap_or(false)
            });
            if owner.map(|n| n.id()) != Some(table.id()) {
                continue;
            }

            let cells: Vec<ElementRef<'_>> = row
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|c| matches!(c.value().name(), "td" | "th"))
                .collect();
            if cells.is_empty() {
                continue;
            }

            let header = cells.iter().all(|c| c.value().name() == "th");
            let cells = cells
                .iter()
                .map(|c| collapse_whitespace(&c.text().collect::<Vec<_>>().join(" ")))
                .collect();
            rows.push(RowCells { cells, header });
        }
        tables.push(TableCells { rows });
    }

    Ok(tables)
}

/// Page heading used as the display name of a league
pub fn extract_caption(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    ["h1", "h2", "title"].iter().find_map(|css| {
        let sel = Selector::parse(css).ok()?;
        document
            .select(&sel)
            .map(|e| collapse_whitespace(&e.text().collect::<Vec<_>>().join(" ")))
            .find(|text| !text.is_empty())
    })
}

fn is_rank(cell: &str) -> bool {
    let digits = cell.strip_suffix('.').unwrap_or(cell);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_numeric(cell: &str) -> bool {
    cell.chars().any(|c| c.is_ascii_digit())
        && cell
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '+' | '-' | '%' | ' ' | ':'))
}

/// Placeholder cells carry no value
fn is_blank(cell: &str) -> bool {
    cell.is_empty() || cell == "-" || cell == "--"
}

fn parse_integer(cell: &str) -> Option<i64> {
    let cell = cell.strip_suffix('.').unwrap_or(cell);
    let digits = cell.strip_prefix(['+', '-']).unwrap_or(cell);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    cell.strip_prefix('+').unwrap_or(cell).parse().ok()
}

fn parse_decimal(cell: &str) -> Option<f64> {
    let cell = cell.strip_suffix('%').unwrap_or(cell).trim_end();
    let normalized = cell.replace(',', ".");
    let digits = normalized.strip_prefix(['+', '-']).unwrap_or(&normalized);
    let valid = !digits.is_empty()
        && digits.chars().any(|c| c.is_ascii_digit())
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.matches('.').count() <= 1;
    if !valid {
        return None;
    }
    normalized.parse().ok()
}

/// Decide whether a row describes an entity
pub fn drop_reason(row: &RawRow, schema: &ColumnSchema) -> Option<DropReason> {
    if row.cells.len() < schema.required {
        return Some(DropReason::TooFewColumns);
    }
    if row.header {
        return Some(DropReason::HeaderRow);
    }
    let rank = &row.cells[schema.rank_column];
    if !rank.is_empty() && !is_rank(rank) {
        return Some(DropReason::NotRanked);
    }
    let name = &row.cells[schema.name_column];
    if is_blank(name) {
        return Some(DropReason::NameMissing);
    }
    if is_numeric(name) {
        return Some(DropReason::NameNumeric);
    }
    None
}

/// Map the rows of one table through the endpoint's schema
pub fn normalize(table: &RawTable, endpoint: EndpointKind) -> Result<Normalized, ParseFailure> {
    let schema = ColumnSchema::for_endpoint(endpoint);
    let mut out = Normalized::default();

    for row in &table.rows {
        if let Some(reason) = drop_reason(row, &schema) {
            out.dropped.push((row.provenance.clone(), reason));
            continue;
        }

        let mut fields = BTreeMap::new();
        for (spec, cell) in schema.columns.iter().zip(&row.cells) {
            if is_blank(cell) {
                continue;
            }
            let value = match spec.ty {
                FieldType::Text => FieldValue::Text(cell.clone()),
                FieldType::Integer => {
                    FieldValue::Int(parse_integer(cell).ok_or_else(|| ParseFailure::Integer {
                        field: spec.name,
                        value: cell.clone(),
                        table_index: row.provenance.table_index,
                        row_index: row.provenance.row_index,
                    })?)
                }
                FieldType::Decimal => {
                    FieldValue::Decimal(parse_decimal(cell).ok_or_else(|| ParseFailure::Decimal {
                        field: spec.name,
                        value: cell.clone(),
                        table_index: row.provenance.table_index,
                        row_index: row.provenance.row_index,
                    })?)
                }
            };
            fields.insert(spec.name.to_string(), value);
        }

        let cell = |idx: Option<usize>| idx.map(|i| row.cells[i].as_str()).unwrap_or("");
        let identity_key = identity_key(
            cell(schema.first_name_column),
            cell(schema.surname_column),
            cell(Some(schema.team_column)),
        );

        out.records.push(NormalizedRecord {
            identity_key,
            fields,
            provenance: row.provenance.clone(),
        });
    }

    Ok(out)
}

/// Rows narrower than this are layout wrappers or footers, not data
const MIN_TABULAR_CELLS: usize = 3;

/// Extract and normalize every table of one endpoint response.
///
/// A page without tabular rows is an empty result. A page whose tabular rows
/// are all narrower than the endpoint's schema fails with
/// `UnrecognisedLayout`.
pub fn normalize_document(
    html: &str,
    candidate: Candidate,
    endpoint: EndpointKind,
) -> Result<Normalized, ParseFailure> {
    let tables = extract_tables(html)?;

    let required = ColumnSchema::for_endpoint(endpoint).required;
    let widest_row = tables
        .iter()
        .flat_map(|t| t.rows.iter())
        .map(|r| r.cells.len())
        .max()
        .unwrap_or(0);
    if widest_row >= MIN_TABULAR_CELLS && widest_row < required {
        return Err(ParseFailure::UnrecognisedLayout {
            endpoint,
            widest_row,
            required,
        });
    }

    let mut out = Normalized::default();
    for (index, cells) in tables.into_iter().enumerate() {
        let table = RawTable::new(candidate, endpoint, index, cells);
        let normalized = normalize(&table, endpoint)?;
        out.records.extend(normalized.records);
        out.dropped.extend(normalized.dropped);
    }
    Ok(out)
}
