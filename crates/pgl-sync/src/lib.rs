//! Grant sync pipeline: row aggregation, reconciliation against stored grants, and run orchestration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use pgl_core::{
    ErrorKind, FunderId, Grant, GrantField, PersonId, PersonRole, RawRow, SyncError, SyncWindow,
};
use pgl_source::{
    FixtureSourceGateway, FunderDirectory, FunderKey, RejectedRow, ResultSet, SourceGateway,
    WindowedQueryBuilder, YamlFunderDirectory,
};
use pgl_storage::{
    DryRunStore, InMemoryGrantStore, JsonFileGrantStore, PassClientConfig, PassHttpStore,
    TargetStore,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pgl-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
    Pass,
}

impl StoreBackend {
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "pass" => Ok(Self::Pass),
            other => bail!("unknown store backend {other:?} (expected memory, file or pass)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub home: PathBuf,
    pub source_rows: PathBuf,
    pub funders_path: PathBuf,
    pub store_backend: StoreBackend,
    pub store_file: PathBuf,
    pub pass_base_url: String,
    pub pass_user: Option<String>,
    pub pass_password: Option<String>,
    pub http_timeout_secs: u64,
    pub concurrency: usize,
    pub max_store_failures: Option<usize>,
    pub reports_dir: PathBuf,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; every value falls back to a default under `PGL_HOME`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let home = lookup("PGL_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let under_home = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(default))
        };

        let store_backend = match lookup("PGL_STORE") {
            Some(value) => StoreBackend::parse(&value)?,
            None => StoreBackend::File,
        };
        let http_timeout_secs = match lookup("PGL_HTTP_TIMEOUT_SECS") {
            Some(value) => value
                .parse()
                .with_context(|| format!("parsing PGL_HTTP_TIMEOUT_SECS={value}"))?,
            None => 20,
        };
        let concurrency = match lookup("PGL_CONCURRENCY") {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| format!("parsing PGL_CONCURRENCY={value}"))?
                .max(1),
            None => 1,
        };
        let max_store_failures = lookup("PGL_MAX_STORE_FAILURES")
            .map(|value| {
                value
                    .parse::<usize>()
                    .with_context(|| format!("parsing PGL_MAX_STORE_FAILURES={value}"))
            })
            .transpose()?
            .filter(|n| *n > 0);

        Ok(Self {
            source_rows: under_home("PGL_SOURCE_ROWS", "coeus_rows.json"),
            funders_path: under_home("PGL_FUNDERS", "funders.yaml"),
            store_backend,
            store_file: under_home("PGL_STORE_FILE", "grants.json"),
            pass_base_url: lookup("PASS_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080/data".to_string()),
            pass_user: lookup("PASS_USER"),
            pass_password: lookup("PASS_PASSWORD"),
            http_timeout_secs,
            concurrency,
            max_store_failures,
            reports_dir: under_home("PGL_REPORTS_DIR", "reports"),
            sync_cron: lookup("PGL_SYNC_CRON").unwrap_or_else(|| "0 0 2 * * *".to_string()),
            home,
        })
    }
}

/// Resolves optional `mm/dd/yyyy` bounds against today's local date.
pub fn resolve_window(start: Option<&str>, end: Option<&str>) -> Result<SyncWindow, SyncError> {
    SyncWindow::from_inputs(start, end, Local::now().date_naive())
}

/// Groups rows by grant number, keeping encounter order inside each group.
pub fn group_rows(rows: impl IntoIterator<Item = RawRow>) -> BTreeMap<String, Vec<RawRow>> {
    let mut groups: BTreeMap<String, Vec<RawRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.grant_number.clone()).or_default().push(row);
    }
    groups
}

/// Picks the PI and co-PI set for one grant's rows.
///
/// The first row flagged as PI wins; without any PI flag the first row's person is PI.
/// Everyone else lands in the co-PI set, so repeated people collapse.
pub fn resolve_investigators(rows: &[RawRow]) -> (Option<PersonId>, BTreeSet<PersonId>) {
    let pi = rows
        .iter()
        .find(|row| row.role == Some(PersonRole::PrincipalInvestigator))
        .or_else(|| rows.first())
        .map(|row| row.person.jhed_id.clone());
    let co_pis = rows
        .iter()
        .map(|row| row.person.jhed_id.clone())
        .filter(|id| Some(id) != pi.as_ref())
        .collect();
    (pi, co_pis)
}

/// Folds the joined person-per-row result set into one grant per grant number.
pub struct RowAggregator<'a> {
    funders: &'a dyn FunderDirectory,
}

impl<'a> RowAggregator<'a> {
    pub fn new(funders: &'a dyn FunderDirectory) -> Self {
        Self { funders }
    }

    /// Every input grant number maps to exactly one entry; funder lookups can fail per grant.
    pub fn aggregate(
        &self,
        rows: impl IntoIterator<Item = RawRow>,
    ) -> BTreeMap<String, Result<Grant, SyncError>> {
        group_rows(rows)
            .into_iter()
            .map(|(local_key, rows)| {
                let grant = self.fold_group(&local_key, &rows);
                (local_key, grant)
            })
            .collect()
    }

    /// Aggregates the decoded rows, then fails every grant that also had an undecodable row,
    /// since its person list is incomplete. Rejected rows without a grant number are returned.
    pub fn aggregate_result_set(
        &self,
        set: ResultSet,
    ) -> (BTreeMap<String, Result<Grant, SyncError>>, Vec<RejectedRow>) {
        let mut aggregated = self.aggregate(set.rows);
        let mut unattributed = Vec::new();
        let mut failed_keys = BTreeSet::new();
        for rejected in set.rejected {
            match rejected.grant_number {
                Some(local_key) => {
                    if failed_keys.insert(local_key.clone()) {
                        aggregated.insert(local_key, Err(rejected.error));
                    }
                }
                None => unattributed.push(rejected),
            }
        }
        (aggregated, unattributed)
    }

    pub fn fold_group(&self, local_key: &str, rows: &[RawRow]) -> Result<Grant, SyncError> {
        let Some(representative) = rows.first() else {
            return Err(SyncError::InvalidRow(format!("grant {local_key} has no rows")));
        };
        let (direct_funder, primary_funder) = self.resolve_funders(representative)?;
        let (pi, co_pis) = resolve_investigators(rows);

        Ok(Grant {
            id: None,
            local_key: local_key.to_string(),
            award_number: representative.award_number.clone(),
            award_status: representative.award_status,
            project_name: representative.title.clone(),
            primary_funder,
            direct_funder,
            pi,
            co_pis,
            award_date: representative.award_date,
            start_date: representative.award_start,
            end_date: representative.award_end,
        })
    }

    /// Direct funder comes from the sponsor code, then the sponsor name; the primary funder from
    /// the prime sponsor code, defaulting to the direct funder when there is no prime sponsor.
    fn resolve_funders(
        &self,
        row: &RawRow,
    ) -> Result<(Option<FunderId>, Option<FunderId>), SyncError> {
        let direct = match (&row.sponsor_code, &row.sponsor_name) {
            (Some(code), name) => Some(self.resolve_sponsor(code, name.as_deref())?),
            (None, Some(name)) => Some(self.funders.resolve(FunderKey::Name(name))?),
            (None, None) => None,
        };
        let primary = match &row.prime_sponsor_code {
            Some(code) => Some(self.funders.resolve(FunderKey::Code(code))?),
            None => direct.clone(),
        };
        Ok((direct, primary))
    }

    fn resolve_sponsor(&self, code: &str, name: Option<&str>) -> Result<FunderId, SyncError> {
        match (self.funders.resolve(FunderKey::Code(code)), name) {
            (Err(SyncError::UnknownFunder(by_code)), Some(name)) => {
                debug!(sponsor_code = code, sponsor_name = name, "falling back to sponsor name");
                self.funders.resolve(FunderKey::Name(name)).map_err(|_| {
                    SyncError::UnknownFunder(format!("{by_code} or sponsor name {name:?}"))
                })
            }
            (resolved, _) => resolved,
        }
    }
}

/// Fields on which two grants disagree. `co_pis` compares as a set and absent equals absent.
pub fn differing_fields(system: &Grant, stored: &Grant) -> Vec<GrantField> {
    GrantField::ALL
        .into_iter()
        .filter(|field| {
            let same = match field {
                GrantField::AwardNumber => system.award_number == stored.award_number,
                GrantField::AwardStatus => system.award_status == stored.award_status,
                GrantField::LocalKey => system.local_key == stored.local_key,
                GrantField::ProjectName => system.project_name == stored.project_name,
                GrantField::PrimaryFunder => system.primary_funder == stored.primary_funder,
                GrantField::DirectFunder => system.direct_funder == stored.direct_funder,
                GrantField::Pi => system.pi == stored.pi,
                GrantField::CoPis => system.co_pis == stored.co_pis,
                GrantField::AwardDate => system.award_date == stored.award_date,
                GrantField::StartDate => system.start_date == stored.start_date,
                GrantField::EndDate => system.end_date == stored.end_date,
            };
            !same
        })
        .collect()
}

/// Merges the freshly pulled grant into the stored one.
///
/// Scalars come from `system`. Co-PIs are additive: stored co-PIs are kept, and a stored PI
/// that `system` replaced is kept as a co-PI. The final PI never appears among the co-PIs.
pub fn merge_grants(system: &Grant, stored: &Grant) -> Grant {
    let mut co_pis = system.co_pis.clone();
    co_pis.extend(stored.co_pis.iter().cloned());
    if let Some(stored_pi) = &stored.pi {
        if system.pi.as_ref() != Some(stored_pi) {
            co_pis.insert(stored_pi.clone());
        }
    }
    if let Some(pi) = &system.pi {
        co_pis.remove(pi);
    }

    Grant {
        id: stored.id.clone(),
        local_key: system.local_key.clone(),
        award_number: system.award_number.clone(),
        award_status: system.award_status,
        project_name: system.project_name.clone(),
        primary_funder: system.primary_funder.clone(),
        direct_funder: system.direct_funder.clone(),
        pi: system.pi.clone(),
        co_pis,
        award_date: system.award_date,
        start_date: system.start_date,
        end_date: system.end_date,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    Create(Grant),
    Update {
        merged: Grant,
        changed: Vec<GrantField>,
    },
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantAction {
    Created,
    Updated,
    Unchanged,
}

impl UpdateDecision {
    pub fn action(&self) -> GrantAction {
        match self {
            Self::Create(_) => GrantAction::Created,
            Self::Update { .. } => GrantAction::Updated,
            Self::NoOp => GrantAction::Unchanged,
        }
    }
}

/// Decides whether a stored grant needs writing. Pure: persistence is left to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityReconciler;

impl EntityReconciler {
    pub fn reconcile(&self, system: &Grant, stored: Option<&Grant>) -> UpdateDecision {
        let Some(stored) = stored else {
            return UpdateDecision::Create(system.clone());
        };
        if differing_fields(system, stored).is_empty() {
            return UpdateDecision::NoOp;
        }

        // A stored co-PI superset can make the merge a no-op even though the pull differs.
        let merged = merge_grants(system, stored);
        let changed = differing_fields(&merged, stored);
        if changed.is_empty() {
            UpdateDecision::NoOp
        } else {
            UpdateDecision::Update { merged, changed }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantChange {
    pub local_key: String,
    pub action: GrantAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<GrantField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantFailure {
    pub local_key: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub window: SyncWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub query_sha256: String,
    pub rows_retrieved: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub changes: Vec<GrantChange>,
    pub failures: Vec<GrantFailure>,
    /// Set when a fatal error ended the run before every grant was handled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl SyncReport {
    pub fn new(run_id: Uuid, window: SyncWindow, query: &str, rows_retrieved: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            window,
            started_at: now,
            finished_at: now,
            query_sha256: sha256_hex(query.as_bytes()),
            rows_retrieved,
            created: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            changes: Vec::new(),
            failures: Vec::new(),
            aborted: None,
        }
    }

    pub fn record_change(&mut self, change: GrantChange) {
        match change.action {
            GrantAction::Created => self.created += 1,
            GrantAction::Updated => self.updated += 1,
            GrantAction::Unchanged => self.unchanged += 1,
        }
        self.changes.push(change);
    }

    pub fn record_failure(&mut self, local_key: impl Into<String>, err: &SyncError) {
        self.failed += 1;
        self.failures.push(GrantFailure {
            local_key: local_key.into(),
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    pub fn grants_seen(&self) -> usize {
        self.created + self.updated + self.unchanged + self.failed
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A run that ended on a fatal error. When grants were already handled, the report
/// of that work comes back in `partial_report`.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SyncRunError {
    pub error: SyncError,
    pub partial_report: Option<Box<SyncReport>>,
}

impl SyncRunError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl From<SyncError> for SyncRunError {
    fn from(error: SyncError) -> Self {
        Self {
            error,
            partial_report: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    /// Grants reconciled at once; 1 keeps the loop sequential.
    pub concurrency: usize,
    /// Consecutive `StoreUnavailable` failures that end the run; `None` never escalates.
    pub max_store_failures: Option<usize>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_store_failures: None,
        }
    }
}

#[derive(Debug)]
struct StoreFailureTracker {
    threshold: Option<usize>,
    consecutive: usize,
}

impl StoreFailureTracker {
    fn new(threshold: Option<usize>) -> Self {
        Self {
            threshold,
            consecutive: 0,
        }
    }

    fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    /// Returns the failure count once the escalation threshold is reached.
    fn failed(&mut self, err: &SyncError) -> Option<usize> {
        if matches!(err, SyncError::StoreUnavailable(_)) {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.threshold
            .filter(|threshold| self.consecutive >= *threshold)
            .map(|_| self.consecutive)
    }
}

/// Runs one windowed pull end to end: query, aggregate, reconcile and persist each grant.
pub struct SyncOrchestrator {
    query_builder: WindowedQueryBuilder,
    source: Arc<dyn SourceGateway>,
    store: Arc<dyn TargetStore>,
    funders: Arc<dyn FunderDirectory>,
    reconciler: EntityReconciler,
    options: OrchestratorOptions,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn SourceGateway>,
        store: Arc<dyn TargetStore>,
        funders: Arc<dyn FunderDirectory>,
    ) -> Self {
        Self {
            query_builder: WindowedQueryBuilder::new(),
            source,
            store,
            funders,
            reconciler: EntityReconciler,
            options: OrchestratorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// `Err` means the run failed before or while processing grants; per-grant failures
    /// are recorded in the returned report instead.
    pub async fn run(&self, window: SyncWindow) -> Result<SyncReport, SyncRunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %window);
        self.run_window(run_id, window).instrument(span).await
    }

    async fn run_window(
        &self,
        run_id: Uuid,
        window: SyncWindow,
    ) -> Result<SyncReport, SyncRunError> {
        let started_at = Utc::now();
        let query = self.query_builder.query_for(&window);
        let set = self.source.execute(&query).await.inspect_err(|err| {
            error!(error = %err, "source query failed; aborting run");
        })?;
        let rows_retrieved = set.len();

        let (aggregated, unattributed) =
            RowAggregator::new(self.funders.as_ref()).aggregate_result_set(set);
        info!(rows = rows_retrieved, grants = aggregated.len(), "aggregated source rows");

        let mut report = SyncReport::new(run_id, window, &query, rows_retrieved);
        report.started_at = started_at;
        for rejected in unattributed {
            report.record_failure(format!("row {}", rejected.index), &rejected.error);
        }

        let mut tracker = StoreFailureTracker::new(self.options.max_store_failures);
        let outcome = if self.options.concurrency <= 1 {
            self.run_sequential(aggregated, &mut report, &mut tracker)
                .await
        } else {
            self.run_parallel(aggregated, &mut report, &mut tracker)
                .await
        };

        report.finished_at = Utc::now();
        if let Err(error) = outcome {
            report.aborted = Some(error.to_string());
            return Err(SyncRunError {
                error,
                partial_report: Some(Box::new(report)),
            });
        }
        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            "sync run complete"
        );
        Ok(report)
    }

    async fn run_sequential(
        &self,
        aggregated: BTreeMap<String, Result<Grant, SyncError>>,
        report: &mut SyncReport,
        tracker: &mut StoreFailureTracker,
    ) -> Result<(), SyncError> {
        for (local_key, system) in aggregated {
            let span = info_span!("reconcile_grant", local_key = %local_key);
            let outcome = match system {
                Ok(grant) => {
                    apply_grant(self.store.as_ref(), &self.reconciler, grant)
                        .instrument(span)
                        .await
                }
                Err(err) => Err(err),
            };
            record_outcome(report, tracker, local_key, outcome)?;
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        aggregated: BTreeMap<String, Result<Grant, SyncError>>,
        report: &mut SyncReport,
        tracker: &mut StoreFailureTracker,
    ) -> Result<(), SyncError> {
        let limit = Arc::new(Semaphore::new(self.options.concurrency));
        let mut tasks = JoinSet::new();
        for (local_key, system) in aggregated {
            let store = Arc::clone(&self.store);
            let limit = Arc::clone(&limit);
            let reconciler = self.reconciler;
            let span = info_span!("reconcile_grant", local_key = %local_key);
            tasks.spawn(
                async move {
                    let outcome = match system {
                        Ok(grant) => match limit.acquire_owned().await {
                            Ok(_permit) => apply_grant(store.as_ref(), &reconciler, grant).await,
                            Err(_) => Err(SyncError::StoreUnavailable(
                                "grant limiter closed".to_string(),
                            )),
                        },
                        Err(err) => Err(err),
                    };
                    (local_key, outcome)
                }
                .instrument(span),
            );
        }

        // Outcomes are folded here, on one task, so report counters never race.
        while let Some(joined) = tasks.join_next().await {
            let (local_key, outcome) = match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => continue,
            };
            if let Err(err) = record_outcome(report, tracker, local_key, outcome) {
                tasks.abort_all();
                return Err(err);
            }
        }
        Ok(())
    }
}

async fn apply_grant(
    store: &dyn TargetStore,
    reconciler: &EntityReconciler,
    system: Grant,
) -> Result<GrantChange, SyncError> {
    let stored = store.find_by_local_key(&system.local_key).await?;
    let local_key = system.local_key.clone();
    match reconciler.reconcile(&system, stored.as_ref()) {
        UpdateDecision::Create(grant) => {
            let id = store.create(&grant).await?;
            debug!(store_id = %id, "created grant");
            Ok(GrantChange {
                local_key,
                action: GrantAction::Created,
                store_id: Some(id),
                changed_fields: Vec::new(),
            })
        }
        UpdateDecision::Update { merged, changed } => {
            store.update(&merged).await?;
            debug!(fields = ?changed, "updated grant");
            Ok(GrantChange {
                local_key,
                action: GrantAction::Updated,
                store_id: merged.id,
                changed_fields: changed,
            })
        }
        UpdateDecision::NoOp => Ok(GrantChange {
            local_key,
            action: GrantAction::Unchanged,
            store_id: stored.and_then(|grant| grant.id),
            changed_fields: Vec::new(),
        }),
    }
}

fn record_outcome(
    report: &mut SyncReport,
    tracker: &mut StoreFailureTracker,
    local_key: String,
    outcome: Result<GrantChange, SyncError>,
) -> Result<(), SyncError> {
    match outcome {
        Ok(change) => {
            tracker.succeeded();
            report.record_change(change);
            Ok(())
        }
        Err(err) => {
            warn!(local_key = %local_key, error = %err, "grant failed; continuing");
            let escalation = tracker.failed(&err);
            report.record_failure(local_key, &err);
            match escalation {
                Some(failures) => {
                    error!(failures, "target store keeps failing; aborting run");
                    Err(SyncError::StoreEscalation { failures })
                }
                None => Ok(()),
            }
        }
    }
}

/// Wires the configured source export, funder directory and target store into an orchestrator.
pub async fn build_orchestrator(config: &SyncConfig, dry_run: bool) -> Result<SyncOrchestrator> {
    let source: Arc<dyn SourceGateway> = Arc::new(FixtureSourceGateway::new(&config.source_rows));
    let funders: Arc<dyn FunderDirectory> =
        Arc::new(YamlFunderDirectory::from_path(&config.funders_path)?);
    let store: Arc<dyn TargetStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(InMemoryGrantStore::new()),
        StoreBackend::File => Arc::new(JsonFileGrantStore::open(&config.store_file).await?),
        StoreBackend::Pass => Arc::new(PassHttpStore::new(PassClientConfig {
            base_url: config.pass_base_url.clone(),
            user: config.pass_user.clone(),
            password: config.pass_password.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            max_concurrency: config.concurrency,
            ..Default::default()
        })?),
    };
    let store: Arc<dyn TargetStore> = if dry_run {
        Arc::new(DryRunStore::new(store))
    } else {
        store
    };

    Ok(SyncOrchestrator::new(source, store, funders).with_options(OrchestratorOptions {
        concurrency: config.concurrency,
        max_store_failures: config.max_store_failures,
    }))
}

/// Writes `<reports_root>/<run_id>/sync_report.json` and `summary.md`.
pub async fn write_report(reports_root: &Path, report: &SyncReport) -> Result<PathBuf> {
    let run_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing sync report")?;
    fs::write(run_dir.join("sync_report.json"), json)
        .await
        .context("writing sync_report.json")?;
    fs::write(run_dir.join("summary.md"), render_summary_markdown(report))
        .await
        .context("writing summary.md")?;
    Ok(run_dir)
}

pub fn render_summary_markdown(report: &SyncReport) -> String {
    let mut lines = vec![
        "# PASS Grant Sync Report".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Window: {}", report.window),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Source rows: {}", report.rows_retrieved),
        format!("- Created: {}", report.created),
        format!("- Updated: {}", report.updated),
        format!("- Unchanged: {}", report.unchanged),
        format!("- Failed: {}", report.failed),
    ];
    if let Some(reason) = &report.aborted {
        lines.push(format!("- Aborted: {reason}"));
    }

    let updated = report
        .changes
        .iter()
        .filter(|change| change.action == GrantAction::Updated)
        .collect::<Vec<_>>();
    if !updated.is_empty() {
        lines.push(String::new());
        lines.push("## Updated Grants".to_string());
        for change in updated {
            let fields = change
                .changed_fields
                .iter()
                .map(|field| field.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("- {}: {}", change.local_key, fields));
        }
    }

    if !report.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for failure in &report.failures {
            lines.push(format!(
                "- {} ({}): {}",
                failure.local_key, failure.kind, failure.message
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Registers a cron job that pulls yesterday's window and writes its report.
pub async fn build_scheduler(
    cron: &str,
    orchestrator: Arc<SyncOrchestrator>,
    reports_dir: PathBuf,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        let reports_dir = reports_dir.clone();
        Box::pin(async move {
            let window = SyncWindow::yesterday(Local::now().date_naive());
            match orchestrator.run(window).await {
                Ok(report) => match write_report(&reports_dir, &report).await {
                    Ok(dir) => info!(report = %dir.display(), "scheduled sync complete"),
                    Err(err) => warn!(error = %format!("{err:#}"), "writing scheduled sync report"),
                },
                Err(err) => {
                    error!(error = %err, "scheduled sync failed");
                    if let Some(report) = &err.partial_report {
                        if let Err(err) = write_report(&reports_dir, report).await {
                            warn!(error = %format!("{err:#}"), "writing partial sync report");
                        }
                    }
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pgl_core::{AwardStatus, PersonDetail};
    use pgl_source::FunderEntry;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn funders() -> YamlFunderDirectory {
        YamlFunderDirectory::from_entries([
            FunderEntry {
                id: "funder-nih".into(),
                code: Some("NIH01".into()),
                name: Some("National Institutes of Health".into()),
            },
            FunderEntry {
                id: "funder-umd".into(),
                code: Some("UMD01".into()),
                name: None,
            },
        ])
    }

    fn row(grant: &str, person: &str, role: Option<PersonRole>) -> RawRow {
        RawRow {
            grant_number: grant.to_string(),
            title: Some(format!("Project {grant}")),
            award_number: Some(format!("AWD-{grant}")),
            award_status: Some(AwardStatus::Active),
            award_date: Some(date(2018, 1, 1)),
            award_start: Some(date(2018, 2, 1)),
            award_end: Some(date(2020, 1, 31)),
            prime_sponsor_code: None,
            sponsor: None,
            sponsor_code: Some("NIH01".to_string()),
            department: None,
            division: None,
            unit_name: None,
            unit_number: None,
            update_timestamp: None,
            person: PersonDetail {
                jhed_id: PersonId::new(person),
                first_name: None,
                last_name: None,
                email: None,
            },
            sponsor_name: None,
            role,
        }
    }

    fn ids(people: &[&str]) -> BTreeSet<PersonId> {
        people.iter().map(|p| PersonId::new(*p)).collect()
    }

    fn grant_with(pi: Option<&str>, co_pis: &[&str]) -> Grant {
        let mut grant = Grant::new("120001");
        grant.award_number = Some("AWD-120001".into());
        grant.award_status = Some(AwardStatus::Active);
        grant.pi = pi.map(PersonId::new);
        grant.co_pis = ids(co_pis);
        grant
    }

    #[test]
    fn aggregation_yields_one_grant_per_grant_number() {
        let directory = funders();
        let rows = vec![
            row("A", "p1", None),
            row("B", "p2", None),
            row("A", "p3", None),
            row("C", "p4", None),
            row("B", "p2", None),
        ];
        let aggregated = RowAggregator::new(&directory).aggregate(rows);
        assert_eq!(
            aggregated.keys().cloned().collect::<Vec<_>>(),
            vec!["A".to_string(), "B".to_string(), "C".to_string()]
        );
        assert!(aggregated.values().all(|grant| grant.is_ok()));
    }

    #[test]
    fn duplicate_co_investigators_collapse() {
        let directory = funders();
        let rows = vec![
            row("120001", "p1", Some(PersonRole::PrincipalInvestigator)),
            row("120001", "p2", Some(PersonRole::CoInvestigator)),
            row("120001", "p3", Some(PersonRole::CoInvestigator)),
            row("120001", "p2", Some(PersonRole::CoInvestigator)),
        ];
        let grant = RowAggregator::new(&directory)
            .fold_group("120001", &rows)
            .expect("grant");
        assert_eq!(grant.pi, Some(PersonId::new("p1")));
        assert_eq!(grant.co_pis, ids(&["p2", "p3"]));
        assert_eq!(grant.project_name.as_deref(), Some("Project 120001"));
        assert_eq!(grant.start_date, Some(date(2018, 2, 1)));
    }

    #[test]
    fn role_flag_beats_encounter_order_and_first_row_is_fallback() {
        let flagged = vec![
            row("1", "c1", Some(PersonRole::CoInvestigator)),
            row("1", "pi", Some(PersonRole::PrincipalInvestigator)),
        ];
        let (pi, co_pis) = resolve_investigators(&flagged);
        assert_eq!(pi, Some(PersonId::new("pi")));
        assert_eq!(co_pis, ids(&["c1"]));

        let unflagged = vec![row("1", "first", None), row("1", "second", None)];
        let (pi, co_pis) = resolve_investigators(&unflagged);
        assert_eq!(pi, Some(PersonId::new("first")));
        assert_eq!(co_pis, ids(&["second"]));
    }

    #[test]
    fn primary_funder_defaults_to_direct_funder() {
        let directory = funders();
        let direct_only = RowAggregator::new(&directory)
            .fold_group("1", &[row("1", "p", None)])
            .expect("grant");
        assert_eq!(direct_only.direct_funder, Some(FunderId::new("funder-nih")));
        assert_eq!(direct_only.primary_funder, Some(FunderId::new("funder-nih")));

        let mut subaward = row("2", "p", None);
        subaward.sponsor_code = Some("UMD01".into());
        subaward.prime_sponsor_code = Some("NIH01".into());
        let grant = RowAggregator::new(&directory)
            .fold_group("2", &[subaward])
            .expect("grant");
        assert_eq!(grant.direct_funder, Some(FunderId::new("funder-umd")));
        assert_eq!(grant.primary_funder, Some(FunderId::new("funder-nih")));
    }

    #[test]
    fn unknown_funder_fails_only_its_grant() {
        let directory = funders();
        let mut unknown = row("B", "p2", None);
        unknown.sponsor_code = Some("XYZ99".into());
        let aggregated =
            RowAggregator::new(&directory).aggregate(vec![row("A", "p1", None), unknown]);
        assert!(aggregated["A"].is_ok());
        assert!(matches!(aggregated["B"], Err(SyncError::UnknownFunder(_))));
    }

    #[test]
    fn unknown_sponsor_code_falls_back_to_sponsor_name() {
        let directory = funders();
        let mut renamed = row("A", "p1", None);
        renamed.sponsor_code = Some("XYZ99".into());
        renamed.sponsor_name = Some("National Institutes of Health".into());
        let mut nameless = row("B", "p2", None);
        nameless.sponsor_code = Some("XYZ99".into());
        let mut misnamed = row("C", "p3", None);
        misnamed.sponsor_code = Some("XYZ99".into());
        misnamed.sponsor_name = Some("Nobody Foundation".into());

        let aggregated =
            RowAggregator::new(&directory).aggregate(vec![renamed, nameless, misnamed]);
        let grant = aggregated["A"].as_ref().expect("resolved by name");
        assert_eq!(grant.direct_funder, Some(FunderId::new("funder-nih")));
        assert_eq!(grant.primary_funder, Some(FunderId::new("funder-nih")));
        assert!(matches!(aggregated["B"], Err(SyncError::UnknownFunder(_))));
        match &aggregated["C"] {
            Err(SyncError::UnknownFunder(message)) => {
                assert!(message.contains("Nobody Foundation"), "{message}")
            }
            other => panic!("expected unknown funder, got {other:?}"),
        }
    }

    #[test]
    fn rejected_rows_fail_their_whole_grant() {
        let directory = funders();
        let set = ResultSet {
            rows: vec![
                row("A", "p1", None),
                row("B", "p2", None),
                row("B", "p3", None),
            ],
            rejected: vec![
                RejectedRow {
                    index: 3,
                    grant_number: Some("B".into()),
                    error: SyncError::InvalidRow("row 3: missing JHED_ID".into()),
                },
                RejectedRow {
                    index: 4,
                    grant_number: Some("B".into()),
                    error: SyncError::InvalidRow("row 4: missing JHED_ID".into()),
                },
                RejectedRow {
                    index: 5,
                    grant_number: None,
                    error: SyncError::InvalidRow("row 5: missing GRANT_NUMBER".into()),
                },
            ],
        };

        let (aggregated, unattributed) =
            RowAggregator::new(&directory).aggregate_result_set(set);
        assert!(aggregated["A"].is_ok());
        assert_eq!(
            aggregated["B"],
            Err(SyncError::InvalidRow("row 3: missing JHED_ID".into()))
        );
        assert_eq!(unattributed.len(), 1);
        assert_eq!(unattributed[0].index, 5);
    }

    #[test]
    fn reconcile_without_stored_grant_creates() {
        let system = grant_with(Some("p1"), &["p2"]);
        assert_eq!(
            EntityReconciler.reconcile(&system, None),
            UpdateDecision::Create(system.clone())
        );
    }

    #[test]
    fn reconcile_against_itself_is_noop() {
        let mut grant = grant_with(Some("p1"), &["p2", "p3"]);
        grant.award_date = None;
        grant.id = Some("grant-1".into());
        assert_eq!(EntityReconciler.reconcile(&grant, Some(&grant)), UpdateDecision::NoOp);
    }

    #[test]
    fn co_pi_merge_is_additive() {
        let system = grant_with(Some("p0"), &["B", "C"]);
        let stored = grant_with(Some("p0"), &["A", "B"]);
        match EntityReconciler.reconcile(&system, Some(&stored)) {
            UpdateDecision::Update { merged, changed } => {
                assert_eq!(merged.co_pis, ids(&["A", "B", "C"]));
                assert_eq!(changed, vec![GrantField::CoPis]);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn replaced_pi_is_kept_as_co_pi() {
        let system = grant_with(Some("Y"), &[]);
        let mut stored = grant_with(Some("X"), &[]);
        stored.id = Some("grant-7".into());
        match EntityReconciler.reconcile(&system, Some(&stored)) {
            UpdateDecision::Update { merged, changed } => {
                assert_eq!(merged.pi, Some(PersonId::new("Y")));
                assert_eq!(merged.co_pis, ids(&["X"]));
                assert_eq!(merged.id.as_deref(), Some("grant-7"));
                assert_eq!(changed, vec![GrantField::Pi, GrantField::CoPis]);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn promoted_co_pi_leaves_the_co_pi_set() {
        let system = grant_with(Some("Y"), &[]);
        let stored = grant_with(Some("X"), &["Y"]);
        let merged = merge_grants(&system, &stored);
        assert_eq!(merged.pi, Some(PersonId::new("Y")));
        assert_eq!(merged.co_pis, ids(&["X"]));
    }

    #[test]
    fn absent_dates_compare_null_safely() {
        let mut system = grant_with(Some("p1"), &[]);
        let mut stored = system.clone();
        system.award_date = None;
        stored.award_date = None;
        assert!(differing_fields(&system, &stored).is_empty());

        system.award_date = Some(date(2018, 5, 1));
        assert_eq!(differing_fields(&system, &stored), vec![GrantField::AwardDate]);
        assert!(matches!(
            EntityReconciler.reconcile(&system, Some(&stored)),
            UpdateDecision::Update { .. }
        ));
    }

    #[test]
    fn co_pis_compare_as_sets() {
        let system = grant_with(Some("p1"), &["b", "a"]);
        let stored = grant_with(Some("p1"), &["a", "b"]);
        assert!(differing_fields(&system, &stored).is_empty());
    }

    #[test]
    fn rerunning_against_merged_output_is_noop() {
        let system = grant_with(Some("Y"), &["B", "C"]);
        let stored = grant_with(Some("X"), &["A", "B"]);
        let merged = merge_grants(&system, &stored);
        assert_eq!(EntityReconciler.reconcile(&system, Some(&merged)), UpdateDecision::NoOp);
        assert_eq!(EntityReconciler.reconcile(&merged, Some(&merged)), UpdateDecision::NoOp);
    }

    #[test]
    fn store_failures_escalate_only_when_consecutive() {
        let mut tracker = StoreFailureTracker::new(Some(2));
        let unavailable = SyncError::StoreUnavailable("down".into());
        assert_eq!(tracker.failed(&unavailable), None);
        tracker.succeeded();
        assert_eq!(tracker.failed(&unavailable), None);
        assert_eq!(tracker.failed(&SyncError::UnknownFunder("x".into())), None);
        assert_eq!(tracker.failed(&unavailable), None);
        assert_eq!(tracker.failed(&unavailable), Some(2));

        let mut never = StoreFailureTracker::new(None);
        for _ in 0..10 {
            assert_eq!(never.failed(&unavailable), None);
        }
    }

    #[test]
    fn config_defaults_live_under_home() {
        let config = SyncConfig::from_lookup(|key| match key {
            "PGL_HOME" => Some("/srv/pgl".to_string()),
            "PGL_CONCURRENCY" => Some("4".to_string()),
            "PGL_STORE" => Some("PASS".to_string()),
            _ => None,
        })
        .expect("config");
        assert_eq!(config.source_rows, PathBuf::from("/srv/pgl/coeus_rows.json"));
        assert_eq!(config.funders_path, PathBuf::from("/srv/pgl/funders.yaml"));
        assert_eq!(config.reports_dir, PathBuf::from("/srv/pgl/reports"));
        assert_eq!(config.store_backend, StoreBackend::Pass);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_store_failures, None);
        assert_eq!(config.http_timeout_secs, 20);
    }

    #[test]
    fn config_rejects_unknown_backend_and_bad_numbers() {
        assert!(SyncConfig::from_lookup(|key| (key == "PGL_STORE").then(|| "oracle".to_string()))
            .is_err());
        assert!(SyncConfig::from_lookup(|key| {
            (key == "PGL_MAX_STORE_FAILURES").then(|| "many".to_string())
        })
        .is_err());
    }

    #[tokio::test]
    async fn report_files_are_written_per_run() {
        let dir = tempdir().expect("tempdir");
        let window = SyncWindow::new(date(2018, 1, 1), date(2018, 1, 2)).expect("window");
        let mut report = SyncReport::new(Uuid::new_v4(), window, "SELECT 1", 3);
        report.record_change(GrantChange {
            local_key: "120001".into(),
            action: GrantAction::Updated,
            store_id: Some("grant-1".into()),
            changed_fields: vec![GrantField::Pi, GrantField::CoPis],
        });
        report.record_failure("120003", &SyncError::UnknownFunder("sponsor code XYZ".into()));

        let run_dir = write_report(dir.path(), &report).await.expect("write");
        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("sync_report.json")).expect("read json"),
        )
        .expect("parse json");
        assert_eq!(json["updated"], 1);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["failures"][0]["kind"], "unknown_funder");
        assert_eq!(json["query_sha256"], sha256_hex(b"SELECT 1"));

        let summary = std::fs::read_to_string(run_dir.join("summary.md")).expect("read md");
        assert!(summary.contains("- Window: 01/01/2018..=01/02/2018"));
        assert!(summary.contains("- 120001: pi, co_pis"));
        assert!(summary.contains("- 120003 (unknown_funder)"));
        assert!(!summary.contains("Aborted"));
        assert!(json.get("aborted").is_none());
    }

    #[test]
    fn aborted_run_is_called_out_in_the_summary() {
        let window = SyncWindow::new(date(2018, 1, 1), date(2018, 1, 2)).expect("window");
        let mut report = SyncReport::new(Uuid::new_v4(), window, "SELECT 1", 2);
        report.aborted = Some(SyncError::StoreEscalation { failures: 2 }.to_string());
        let summary = render_summary_markdown(&report);
        assert!(summary.contains("- Aborted: "), "{summary}");
    }
}
