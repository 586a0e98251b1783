//! Grant domain model and error kinds shared by the PASS grant loader crates.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pgl-core";

/// Date format used for window bounds on the command line and in the source query.
pub const WINDOW_DATE_FORMAT: &str = "%m/%d/%Y";

/// Institutional person identifier (JHED id) as reported by the source views.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(String);

impl PersonId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PersonId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a funding organization in the target system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunderId(String);

impl FunderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwardStatus {
    Active,
    PreAward,
    Terminated,
}

impl AwardStatus {
    /// Case-insensitive parse of the status text used by the source views.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input
            .trim()
            .to_ascii_lowercase()
            .replace(['-', ' '], "_");
        match normalized.as_str() {
            "active" => Some(Self::Active),
            "pre_award" | "preaward" => Some(Self::PreAward),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PreAward => "pre_award",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonRole {
    PrincipalInvestigator,
    CoInvestigator,
}

impl PersonRole {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_uppercase().as_str() {
            "P" | "PI" => Some(Self::PrincipalInvestigator),
            "C" | "COI" | "CO-PI" | "COPI" | "K" => Some(Self::CoInvestigator),
            _ => None,
        }
    }
}

/// The fields of a [`Grant`] that take part in reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantField {
    AwardNumber,
    AwardStatus,
    LocalKey,
    ProjectName,
    PrimaryFunder,
    DirectFunder,
    Pi,
    CoPis,
    AwardDate,
    StartDate,
    EndDate,
}

impl GrantField {
    pub const ALL: [GrantField; 11] = [
        GrantField::AwardNumber,
        GrantField::AwardStatus,
        GrantField::LocalKey,
        GrantField::ProjectName,
        GrantField::PrimaryFunder,
        GrantField::DirectFunder,
        GrantField::Pi,
        GrantField::CoPis,
        GrantField::AwardDate,
        GrantField::StartDate,
        GrantField::EndDate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwardNumber => "award_number",
            Self::AwardStatus => "award_status",
            Self::LocalKey => "local_key",
            Self::ProjectName => "project_name",
            Self::PrimaryFunder => "primary_funder",
            Self::DirectFunder => "direct_funder",
            Self::Pi => "pi",
            Self::CoPis => "co_pis",
            Self::AwardDate => "award_date",
            Self::StartDate => "start_date",
            Self::EndDate => "end_date",
        }
    }
}

impl fmt::Display for GrantField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A grant as held by the target system of record.
///
/// `id` is assigned by the target store and never takes part in comparison.
/// `co_pis` is a set: order carries no meaning and duplicates cannot exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub local_key: String,
    pub award_number: Option<String>,
    pub award_status: Option<AwardStatus>,
    pub project_name: Option<String>,
    pub primary_funder: Option<FunderId>,
    pub direct_funder: Option<FunderId>,
    pub pi: Option<PersonId>,
    #[serde(default)]
    pub co_pis: BTreeSet<PersonId>,
    pub award_date: Option<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl Grant {
    /// An otherwise empty grant carrying only its identity key.
    pub fn new(local_key: impl Into<String>) -> Self {
        Self {
            id: None,
            local_key: local_key.into(),
            award_number: None,
            award_status: None,
            project_name: None,
            primary_funder: None,
            direct_funder: None,
            pi: None,
            co_pis: BTreeSet::new(),
            award_date: None,
            start_date: None,
            end_date: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonDetail {
    pub jhed_id: PersonId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

/// One joined source record: a grant's proposal-view fields, one person and one sponsor name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub grant_number: String,
    pub title: Option<String>,
    pub award_number: Option<String>,
    pub award_status: Option<AwardStatus>,
    pub award_date: Option<NaiveDate>,
    pub award_start: Option<NaiveDate>,
    pub award_end: Option<NaiveDate>,
    pub prime_sponsor_code: Option<String>,
    pub sponsor: Option<String>,
    pub sponsor_code: Option<String>,
    pub department: Option<String>,
    pub division: Option<String>,
    pub unit_name: Option<String>,
    pub unit_number: Option<String>,
    pub update_timestamp: Option<NaiveDateTime>,
    pub person: PersonDetail,
    pub sponsor_name: Option<String>,
    pub role: Option<PersonRole>,
}

/// Inclusive `[start, end]` range over last-modified dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl SyncWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, SyncError> {
        if start > end {
            return Err(SyncError::InvalidWindow(format!(
                "start date {} is after end date {}",
                start.format(WINDOW_DATE_FORMAT),
                end.format(WINDOW_DATE_FORMAT)
            )));
        }
        Ok(Self { start, end })
    }

    /// The single-day window covering the day before `today`.
    pub fn yesterday(today: NaiveDate) -> Self {
        let day = today - Duration::days(1);
        Self {
            start: day,
            end: day,
        }
    }

    /// Applies the defaulting rules for optional `mm/dd/yyyy` inputs:
    /// no dates means yesterday only, a start alone runs through yesterday,
    /// and an end alone is rejected because a start date has no natural default.
    pub fn from_inputs(
        start: Option<&str>,
        end: Option<&str>,
        today: NaiveDate,
    ) -> Result<Self, SyncError> {
        let yesterday = today - Duration::days(1);
        match (start, end) {
            (None, None) => Ok(Self::yesterday(today)),
            (Some(start), None) => Self::new(parse_window_date(start)?, yesterday),
            (None, Some(_)) => Err(SyncError::InvalidWindow(
                "an end date was given without a start date".to_string(),
            )),
            (Some(start), Some(end)) => {
                Self::new(parse_window_date(start)?, parse_window_date(end)?)
            }
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..={}",
            self.start.format(WINDOW_DATE_FORMAT),
            self.end.format(WINDOW_DATE_FORMAT)
        )
    }
}

pub fn parse_window_date(input: &str) -> Result<NaiveDate, SyncError> {
    NaiveDate::parse_from_str(input.trim(), WINDOW_DATE_FORMAT).map_err(|err| {
        SyncError::InvalidWindow(format!("{input:?} is not a mm/dd/yyyy date: {err}"))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("invalid sync window: {0}")]
    InvalidWindow(String),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("source query failed: {0}")]
    QueryError(String),
    #[error("unknown funder: {0}")]
    UnknownFunder(String),
    #[error("target store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("not found in target store: {0}")]
    NotFound(String),
    #[error("invalid source row: {0}")]
    InvalidRow(String),
    #[error("aborting run after {failures} consecutive target store failures")]
    StoreEscalation { failures: usize },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidWindow(_) => ErrorKind::InvalidWindow,
            Self::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            Self::QueryError(_) => ErrorKind::QueryError,
            Self::UnknownFunder(_) => ErrorKind::UnknownFunder,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidRow(_) => ErrorKind::InvalidRow,
            Self::StoreEscalation { .. } => ErrorKind::StoreEscalation,
        }
    }

    /// Fatal errors end the run; the rest are recorded against a single grant.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidWindow(_)
                | Self::SourceUnavailable(_)
                | Self::QueryError(_)
                | Self::StoreEscalation { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidWindow,
    SourceUnavailable,
    QueryError,
    UnknownFunder,
    StoreUnavailable,
    NotFound,
    InvalidRow,
    StoreEscalation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::InvalidWindow => "invalid_window",
            Self::SourceUnavailable => "source_unavailable",
            Self::QueryError => "query_error",
            Self::UnknownFunder => "unknown_funder",
            Self::StoreUnavailable => "store_unavailable",
            Self::NotFound => "not_found",
            Self::InvalidRow => "invalid_row",
            Self::StoreEscalation => "store_escalation",
        };
        f.write_str(text)
    }
}
