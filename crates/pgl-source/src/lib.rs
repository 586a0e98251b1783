//! COEUS source side: windowed query construction, row decoding, gateways and funder lookup.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use pgl_core::{
    AwardStatus, FunderId, PersonDetail, PersonId, PersonRole, RawRow, SyncError, SyncWindow,
    WINDOW_DATE_FORMAT,
};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pgl-source";

/// Proposal view (alias `A`) columns, in the order rows are decoded against.
/// `TITLE` appears twice and `SPOSNOR_CODE` is spelled as the view spells it.
pub const PROP_VIEW_FIELDS: [&str; 16] = [
    "TITLE",
    "GRANT_NUMBER",
    "AWARD_DATE",
    "AWARD_END",
    "AWARD_NUMBER",
    "AWARD_START",
    "AWARD_STATUS",
    "PRIME_SPONSOR_CODE",
    "SPONSOR",
    "SPOSNOR_CODE",
    "DEPARTMENT",
    "DIVISION",
    "TITLE",
    "UNIT_NAME",
    "UNIT_NUMBER",
    "UPDATE_TIMESTAMP",
];

/// Person detail view (alias `C`) columns.
pub const PERSON_DETAIL_VIEW_FIELDS: [&str; 4] =
    ["JHED_ID", "FIRST_NAME", "LAST_NAME", "EMAIL_ADDRESS"];

/// Sponsor view (alias `D`) columns.
pub const SPONSOR_VIEW_FIELDS: [&str; 1] = ["SPONSOR_NAME"];

/// Optional role indicator column; not selected by the windowed query but honoured when present.
pub const ROLE_COLUMN: &str = "ROLE";

/// Builds the COEUS query for a closed window over `UPDATE_TIMESTAMP`.
///
/// The person view (alias `B`) only carries join keys between the proposal
/// and person detail views. Dates are stored as strings in the views, hence
/// the `TO_DATE` conversions.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowedQueryBuilder;

impl WindowedQueryBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Resolves the optional `mm/dd/yyyy` bounds against the local date and builds the query.
    pub fn build(&self, start: Option<&str>, end: Option<&str>) -> Result<String, SyncError> {
        self.build_as_of(start, end, Local::now().date_naive())
    }

    pub fn build_as_of(
        &self,
        start: Option<&str>,
        end: Option<&str>,
        today: NaiveDate,
    ) -> Result<String, SyncError> {
        let window = SyncWindow::from_inputs(start, end, today)?;
        Ok(self.query_for(&window))
    }

    pub fn query_for(&self, window: &SyncWindow) -> String {
        let prop_fields = qualified_fields("A", &PROP_VIEW_FIELDS);
        let person_fields = qualified_fields("C", &PERSON_DETAIL_VIEW_FIELDS);
        let sponsor_fields = qualified_fields("D", &SPONSOR_VIEW_FIELDS);

        let query = format!(
            "SELECT {prop_fields}, {person_fields}, {sponsor_fields} \
             FROM COEUS.JHU_FACULTY_FORCE_PROP A \
             INNER JOIN COEUS.JHU_FACULTY_FORCE_PRSN B ON A.INST_PROPOSAL = B.INST_PROPOSAL \
             INNER JOIN COEUS.JHU_FACULTY_FORCE_PRSN_DETAIL C ON B.JHED_ID = C.JHED_ID \
             INNER JOIN COEUS.SWIFT_SPONSOR D ON A.SPOSNOR_CODE = D.SPONSOR_CODE \
             WHERE (TRUNC(A.UPDATE_TIMESTAMP) BETWEEN TO_DATE('{start}', 'mm/dd/yyyy') \
             AND TO_DATE('{end}', 'mm/dd/yyyy')) \
             AND (A.PROPOSAL_STATUS = 'Funded') \
             AND (A.AWARD_STATUS = 'Active' OR A.AWARD_STATUS = 'Terminated')",
            start = window.start().format(WINDOW_DATE_FORMAT),
            end = window.end().format(WINDOW_DATE_FORMAT),
        );
        debug!(query = %query, "built COEUS query");
        query
    }
}

fn qualified_fields(alias: &str, fields: &[&str]) -> String {
    fields
        .iter()
        .map(|field| format!("{alias}.{field}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A row the gateway could not decode, with the grant it belongs to when that column was readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub index: usize,
    pub grant_number: Option<String>,
    pub error: SyncError,
}

/// Decoded rows of one query plus the rows that failed to decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub rows: Vec<RawRow>,
    pub rejected: Vec<RejectedRow>,
}

impl ResultSet {
    pub fn from_rows(rows: Vec<RawRow>) -> Self {
        Self {
            rows,
            rejected: Vec::new(),
        }
    }

    /// Decodes every record; a bad record is set aside instead of failing the whole set.
    pub fn decode(records: &[JsonMap<String, JsonValue>]) -> Self {
        let mut set = Self::default();
        for (index, record) in records.iter().enumerate() {
            match decode_row(record) {
                Ok(row) => set.rows.push(row),
                Err(error) => {
                    let grant_number = column_text(record, "GRANT_NUMBER");
                    warn!(index, grant_number = ?grant_number, error = %error, "rejected source row");
                    set.rejected.push(RejectedRow {
                        index,
                        grant_number,
                        error,
                    });
                }
            }
        }
        set
    }

    /// Rows returned by the source, decoded or not.
    pub fn len(&self) -> usize {
        self.rows.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.rejected.is_empty()
    }
}

/// Executes a query against the external store.
///
/// `Err` means the query as a whole failed; undecodable rows come back in [`ResultSet::rejected`].
#[async_trait]
pub trait SourceGateway: Send + Sync {
    async fn execute(&self, query: &str) -> Result<ResultSet, SyncError>;
}

/// Gateway over a JSON export of COEUS result rows (an array of column-name keyed objects).
///
/// The export is assumed to already be restricted to the window; the query is logged, not evaluated.
#[derive(Debug, Clone)]
pub struct FixtureSourceGateway {
    path: PathBuf,
}

impl FixtureSourceGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceGateway for FixtureSourceGateway {
    async fn execute(&self, query: &str) -> Result<ResultSet, SyncError> {
        debug!(query, path = %self.path.display(), "executing query against row export");
        let text = fs::read_to_string(&self.path).map_err(|err| {
            SyncError::SourceUnavailable(format!("reading {}: {err}", self.path.display()))
        })?;
        let records: Vec<JsonMap<String, JsonValue>> = serde_json::from_str(&text)
            .map_err(|err| SyncError::QueryError(format!("parsing {}: {err}", self.path.display())))?;
        let set = ResultSet::decode(&records);
        info!(
            rows = set.rows.len(),
            rejected = set.rejected.len(),
            "retrieved result set from COEUS export"
        );
        Ok(set)
    }
}

/// Gateway returning a fixed row set; records every query it is asked to run.
#[derive(Debug, Default)]
pub struct InMemorySourceGateway {
    rows: Vec<RawRow>,
    queries: Mutex<Vec<String>>,
}

impl InMemorySourceGateway {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self {
            rows,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn executed_queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .map(|queries| queries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceGateway for InMemorySourceGateway {
    async fn execute(&self, query: &str) -> Result<ResultSet, SyncError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(query.to_string());
        }
        Ok(ResultSet::from_rows(self.rows.clone()))
    }
}

/// Decodes one result row keyed by column name.
pub fn decode_row(columns: &JsonMap<String, JsonValue>) -> Result<RawRow, SyncError> {
    let grant_number = column_text(columns, "GRANT_NUMBER")
        .ok_or_else(|| SyncError::InvalidRow("row has no GRANT_NUMBER".to_string()))?;
    let jhed_id = column_text(columns, "JHED_ID").ok_or_else(|| {
        SyncError::InvalidRow(format!("row for grant {grant_number} has no JHED_ID"))
    })?;

    let award_status = column_text(columns, "AWARD_STATUS").and_then(|text| {
        let parsed = AwardStatus::parse(&text);
        if parsed.is_none() {
            warn!(grant_number = %grant_number, status = %text, "unrecognized award status");
        }
        parsed
    });
    let role = column_text(columns, ROLE_COLUMN).and_then(|text| PersonRole::parse(&text));

    Ok(RawRow {
        title: column_text(columns, "TITLE"),
        award_number: column_text(columns, "AWARD_NUMBER"),
        award_status,
        award_date: column_date(columns, "AWARD_DATE", &grant_number),
        award_start: column_date(columns, "AWARD_START", &grant_number),
        award_end: column_date(columns, "AWARD_END", &grant_number),
        prime_sponsor_code: column_text(columns, "PRIME_SPONSOR_CODE"),
        sponsor: column_text(columns, "SPONSOR"),
        sponsor_code: column_text(columns, "SPOSNOR_CODE"),
        department: column_text(columns, "DEPARTMENT"),
        division: column_text(columns, "DIVISION"),
        unit_name: column_text(columns, "UNIT_NAME"),
        unit_number: column_text(columns, "UNIT_NUMBER"),
        update_timestamp: column_text(columns, "UPDATE_TIMESTAMP")
            .and_then(|text| parse_source_timestamp(&text)),
        person: PersonDetail {
            jhed_id: PersonId::new(jhed_id),
            first_name: column_text(columns, "FIRST_NAME"),
            last_name: column_text(columns, "LAST_NAME"),
            email: column_text(columns, "EMAIL_ADDRESS"),
        },
        sponsor_name: column_text(columns, "SPONSOR_NAME"),
        role,
        grant_number,
    })
}

fn column_text(columns: &JsonMap<String, JsonValue>, name: &str) -> Option<String> {
    match columns.get(name)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn column_date(
    columns: &JsonMap<String, JsonValue>,
    name: &str,
    grant_number: &str,
) -> Option<NaiveDate> {
    let text = column_text(columns, name)?;
    let parsed = parse_source_date(&text);
    if parsed.is_none() {
        warn!(grant_number, column = name, value = %text, "unparseable date treated as absent");
    }
    parsed
}

const SOURCE_DATE_FORMATS: [&str; 2] = [WINDOW_DATE_FORMAT, "%Y-%m-%d"];
const SOURCE_TIMESTAMP_FORMATS: [&str; 3] =
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%m/%d/%Y %H:%M:%S"];

/// Parses the date spellings found in the views; timestamps are truncated to their date.
pub fn parse_source_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    SOURCE_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .or_else(|| parse_source_timestamp(text).map(|ts| ts.date()))
}

pub fn parse_source_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    SOURCE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

/// How a funder is looked up in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunderKey<'a> {
    Code(&'a str),
    Name(&'a str),
}

impl std::fmt::Display for FunderKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "sponsor code {code}"),
            Self::Name(name) => write!(f, "sponsor name {name:?}"),
        }
    }
}

pub trait FunderDirectory: Send + Sync {
    fn resolve(&self, key: FunderKey<'_>) -> Result<FunderId, SyncError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunderEntry {
    pub id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// `funders.yaml` is either a bare list of entries or a mapping with a `funders:` key.
/// Other top-level keys such as `version` are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FundersFile {
    List(Vec<FunderEntry>),
    Keyed {
        #[serde(default)]
        funders: Vec<FunderEntry>,
    },
}

impl FundersFile {
    fn into_entries(self) -> Vec<FunderEntry> {
        match self {
            Self::List(entries) | Self::Keyed { funders: entries } => entries,
        }
    }
}

/// Funder directory loaded from `funders.yaml`; names match case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct YamlFunderDirectory {
    by_code: HashMap<String, FunderId>,
    by_name: HashMap<String, FunderId>,
}

impl YamlFunderDirectory {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: FundersFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_entries(file.into_entries()))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = FunderEntry>) -> Self {
        let mut directory = Self::default();
        for entry in entries {
            let id = FunderId::new(entry.id);
            if let Some(code) = entry.code {
                directory.by_code.insert(code.trim().to_string(), id.clone());
            }
            if let Some(name) = entry.name {
                directory.by_name.insert(normalize_name(&name), id);
            }
        }
        directory
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty() && self.by_name.is_empty()
    }
}

impl FunderDirectory for YamlFunderDirectory {
    fn resolve(&self, key: FunderKey<'_>) -> Result<FunderId, SyncError> {
        let found = match key {
            FunderKey::Code(code) => self.by_code.get(code.trim()),
            FunderKey::Name(name) => self.by_name.get(&normalize_name(name)),
        };
        found
            .cloned()
            .ok_or_else(|| SyncError::UnknownFunder(key.to_string()))
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const JAN_QUERY: &str = "SELECT A.TITLE, A.GRANT_NUMBER, A.AWARD_DATE, A.AWARD_END, A.AWARD_NUMBER, \
A.AWARD_START, A.AWARD_STATUS, A.PRIME_SPONSOR_CODE, A.SPONSOR, A.SPOSNOR_CODE, A.DEPARTMENT, \
A.DIVISION, A.TITLE, A.UNIT_NAME, A.UNIT_NUMBER, A.UPDATE_TIMESTAMP, C.JHED_ID, C.FIRST_NAME, \
C.LAST_NAME, C.EMAIL_ADDRESS, D.SPONSOR_NAME FROM COEUS.JHU_FACULTY_FORCE_PROP A \
INNER JOIN COEUS.JHU_FACULTY_FORCE_PRSN B ON A.INST_PROPOSAL = B.INST_PROPOSAL \
INNER JOIN COEUS.JHU_FACULTY_FORCE_PRSN_DETAIL C ON B.JHED_ID = C.JHED_ID \
INNER JOIN COEUS.SWIFT_SPONSOR D ON A.SPOSNOR_CODE = D.SPONSOR_CODE \
WHERE (TRUNC(A.UPDATE_TIMESTAMP) BETWEEN TO_DATE('01/01/2018', 'mm/dd/yyyy') \
AND TO_DATE('01/02/2018', 'mm/dd/yyyy')) AND (A.PROPOSAL_STATUS = 'Funded') \
AND (A.AWARD_STATUS = 'Active' OR A.AWARD_STATUS = 'Terminated')";

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn columns(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn query_matches_source_contract_verbatim() {
        let query = WindowedQueryBuilder::new()
            .build_as_of(Some("01/01/2018"), Some("01/02/2018"), date(2018, 6, 1))
            .expect("query");
        assert_eq!(query, JAN_QUERY);
    }

    #[test]
    fn query_defaults_to_yesterday() {
        let query = WindowedQueryBuilder::new()
            .build_as_of(None, None, date(2018, 1, 3))
            .expect("query");
        assert!(query.contains(
            "BETWEEN TO_DATE('01/02/2018', 'mm/dd/yyyy') AND TO_DATE('01/02/2018', 'mm/dd/yyyy')"
        ));

        let start_only = WindowedQueryBuilder::new()
            .build_as_of(Some("12/20/2017"), None, date(2018, 1, 3))
            .expect("query");
        assert!(start_only.contains(
            "BETWEEN TO_DATE('12/20/2017', 'mm/dd/yyyy') AND TO_DATE('01/02/2018', 'mm/dd/yyyy')"
        ));
    }

    #[test]
    fn query_rejects_end_without_start() {
        let err = WindowedQueryBuilder::new()
            .build_as_of(None, Some("01/02/2018"), date(2018, 1, 3))
            .expect_err("invalid window");
        assert!(matches!(err, SyncError::InvalidWindow(_)));
    }

    #[test]
    fn decode_row_reads_named_columns() {
        let row = decode_row(&columns(json!({
            "TITLE": "Cell Signaling in Yeast",
            "GRANT_NUMBER": "120001",
            "AWARD_DATE": "03/01/2018",
            "AWARD_START": "2018-04-01",
            "AWARD_END": "2021-03-31 00:00:00.0",
            "AWARD_NUMBER": "R01GM123456",
            "AWARD_STATUS": "Active",
            "PRIME_SPONSOR_CODE": "",
            "SPOSNOR_CODE": "NIH01",
            "UPDATE_TIMESTAMP": "2018-01-01 10:15:00.0",
            "JHED_ID": "jdoe1",
            "FIRST_NAME": "Jane",
            "LAST_NAME": "Doe",
            "EMAIL_ADDRESS": "jdoe1@example.edu",
            "SPONSOR_NAME": "National Institutes of Health",
            "ROLE": "PI"
        })))
        .expect("row");

        assert_eq!(row.grant_number, "120001");
        assert_eq!(row.award_status, Some(AwardStatus::Active));
        assert_eq!(row.award_date, Some(date(2018, 3, 1)));
        assert_eq!(row.award_start, Some(date(2018, 4, 1)));
        assert_eq!(row.award_end, Some(date(2021, 3, 31)));
        assert_eq!(row.prime_sponsor_code, None);
        assert_eq!(row.sponsor_code.as_deref(), Some("NIH01"));
        assert_eq!(row.person.jhed_id, PersonId::new("jdoe1"));
        assert_eq!(row.role, Some(PersonRole::PrincipalInvestigator));
        assert!(row.update_timestamp.is_some());
    }

    #[test]
    fn decode_row_tolerates_numeric_keys_and_bad_dates() {
        let row = decode_row(&columns(json!({
            "GRANT_NUMBER": 120002,
            "JHED_ID": "asmith2",
            "AWARD_DATE": "not a date",
            "AWARD_STATUS": "Suspended"
        })))
        .expect("row");
        assert_eq!(row.grant_number, "120002");
        assert_eq!(row.award_date, None);
        assert_eq!(row.award_status, None);
        assert_eq!(row.role, None);
    }

    #[test]
    fn decode_row_requires_grant_number_and_person() {
        let missing_grant = decode_row(&columns(json!({ "JHED_ID": "x" })));
        assert!(matches!(missing_grant, Err(SyncError::InvalidRow(_))));

        let missing_person = decode_row(&columns(json!({ "GRANT_NUMBER": "1" })));
        assert!(matches!(missing_person, Err(SyncError::InvalidRow(_))));
    }

    #[test]
    fn funder_directory_resolves_codes_and_names() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("funders.yaml");
        fs::write(
            &path,
            "version: 1\nfunders:\n  - id: funder-nih\n    code: NIH01\n    name: National Institutes of Health\n",
        )
        .expect("write");

        let directory = YamlFunderDirectory::from_path(&path).expect("directory");
        assert_eq!(
            directory.resolve(FunderKey::Code("NIH01")).expect("code"),
            FunderId::new("funder-nih")
        );
        assert_eq!(
            directory
                .resolve(FunderKey::Name("national  institutes of HEALTH"))
                .expect("name"),
            FunderId::new("funder-nih")
        );
        let err = directory.resolve(FunderKey::Code("NSF01")).expect_err("unknown");
        assert!(matches!(err, SyncError::UnknownFunder(_)));
    }

    #[test]
    fn funder_file_may_be_a_bare_list() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("funders.yaml");
        fs::write(&path, "- id: funder-nsf\n  code: NSF01\n- id: funder-dod\n  name: Department of Defense\n")
            .expect("write");

        let directory = YamlFunderDirectory::from_path(&path).expect("directory");
        assert_eq!(
            directory.resolve(FunderKey::Code("NSF01")).expect("code"),
            FunderId::new("funder-nsf")
        );
        assert_eq!(
            directory
                .resolve(FunderKey::Name("department of defense"))
                .expect("name"),
            FunderId::new("funder-dod")
        );
    }

    #[test]
    fn workspace_funders_fixture_loads() {
        let directory = YamlFunderDirectory::from_path(workspace_root().join("fixtures/funders.yaml"))
            .expect("fixture directory");
        assert!(!directory.is_empty());
        assert!(directory.resolve(FunderKey::Code("NIH01")).is_ok());
    }

    #[tokio::test]
    async fn fixture_gateway_decodes_sample_export() {
        let gateway = FixtureSourceGateway::new(workspace_root().join("fixtures/coeus/sample_rows.json"));
        let set = gateway.execute(JAN_QUERY).await.expect("rows");
        assert_eq!(set.len(), 7);
        assert!(set.rejected.is_empty());
        assert!(set.rows.iter().all(|row| !row.grant_number.is_empty()));
    }

    #[tokio::test]
    async fn fixture_gateway_sets_aside_undecodable_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("rows.json");
        fs::write(
            &path,
            r#"[
                {"GRANT_NUMBER": "1", "JHED_ID": "p1"},
                {"GRANT_NUMBER": "2", "JHED_ID": "p2"},
                {"GRANT_NUMBER": "3"},
                {"JHED_ID": "p4"}
            ]"#,
        )
        .expect("write");

        let set = FixtureSourceGateway::new(&path)
            .execute(JAN_QUERY)
            .await
            .expect("query still succeeds");
        assert_eq!(set.rows.len(), 2);
        assert_eq!(set.len(), 4);
        assert_eq!(set.rejected[0].index, 2);
        assert_eq!(set.rejected[0].grant_number.as_deref(), Some("3"));
        assert!(matches!(set.rejected[0].error, SyncError::InvalidRow(_)));
        assert_eq!(set.rejected[1].grant_number, None);
    }

    #[tokio::test]
    async fn fixture_gateway_reports_missing_export_as_unavailable() {
        let dir = tempdir().expect("tempdir");
        let gateway = FixtureSourceGateway::new(dir.path().join("missing.json"));
        let err = gateway.execute(JAN_QUERY).await.expect_err("missing file");
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn in_memory_gateway_records_queries() {
        let gateway = InMemorySourceGateway::new(Vec::new());
        let set = gateway.execute("SELECT 1").await.expect("rows");
        assert!(set.is_empty());
        assert_eq!(gateway.executed_queries(), vec!["SELECT 1".to_string()]);
    }
}
