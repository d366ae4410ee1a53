use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use scone_ledger_core::{
    Acceptance, AdminControl, AlertChannel, ContractId, Decision, Deduplicator,
    DirectoryArtifacts, Finding, Harvester, HttpScanService, LedgerError, LedgerSettings,
    LogChannel, NewSession, NotifierGate, NotifyError, ObservedState, QuotaStore, Session,
    SessionState, SessionStore, SqliteStore, StatusPoller, Target, TextFindingExtractor,
    WebhookChannel,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "scone-ledger",
    author,
    version,
    about = "Scan session ledger and findings deduplication"
)]
struct Cli {
    /// SQLite ledger database (overrides SCONE_LEDGER_DB)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// Settings file (TOML/YAML/JSON); environment variables take precedence
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a PENDING session for a contract, consuming one quota slot
    Create {
        chain: String,
        address: String,
        #[arg(long, default_value_t = 0.0)]
        priority: f64,
        /// Admin control classification (eoa, multisig, timelock, unknown)
        #[arg(long, default_value = "unknown")]
        admin: AdminControl,
        /// Scanning service handle for the job
        #[arg(long = "external-ref", value_name = "REF")]
        external_ref: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List sessions in creation order
    List {
        #[arg(long)]
        state: Option<SessionState>,
        #[arg(long)]
        json: bool,
    },
    /// Show one session
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Check a session against the scanning service
    Poll {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Poll every non-terminal session, plus completed ones still awaiting harvest
    PollAll {
        #[arg(long)]
        json: bool,
    },
    /// Open a new session for the target of a FAILED one
    Retry {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Deduplicate and gate findings from a JSON or YAML file
    Ingest {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Extract findings from a markdown report of a COMPLETED session and ingest them
    Extract {
        #[arg(long)]
        session: String,
        file: PathBuf,
        /// Evidence link attached to every extracted finding
        #[arg(long)]
        reference: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show the session quota window
    Quota {
        #[arg(long)]
        json: bool,
    },
}

/// Settings file layered beneath `SCONE_LEDGER_*` environment variables.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    db: Option<String>,
    notify_threshold: Option<f64>,
    duplicate_policy: Option<String>,
    scan_endpoint: Option<String>,
    api_key: Option<String>,
    poll_timeout: Option<String>,
    webhook_url: Option<String>,
    artifacts_dir: Option<String>,
    quota_limit: Option<u32>,
    quota_window: Option<String>,
}

impl FileSettings {
    fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        settings
            .try_deserialize()
            .with_context(|| format!("invalid settings in {}", path.display()))
    }

    fn into_vars(self) -> HashMap<String, String> {
        let entries = [
            (LedgerSettings::DB_ENV, self.db),
            (
                LedgerSettings::THRESHOLD_ENV,
                self.notify_threshold.map(|v| v.to_string()),
            ),
            (LedgerSettings::POLICY_ENV, self.duplicate_policy),
            (LedgerSettings::ENDPOINT_ENV, self.scan_endpoint),
            (LedgerSettings::API_KEY_ENV, self.api_key),
            (LedgerSettings::POLL_TIMEOUT_ENV, self.poll_timeout),
            (LedgerSettings::WEBHOOK_ENV, self.webhook_url),
            (LedgerSettings::ARTIFACTS_ENV, self.artifacts_dir),
            (
                LedgerSettings::QUOTA_LIMIT_ENV,
                self.quota_limit.map(|v| v.to_string()),
            ),
            (LedgerSettings::QUOTA_WINDOW_ENV, self.quota_window),
        ];
        entries
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key.to_string(), value)))
            .collect()
    }
}

fn load_settings(cli: &Cli) -> Result<LedgerSettings> {
    let mut vars = match &cli.config {
        Some(path) => FileSettings::load(path)?.into_vars(),
        None => HashMap::new(),
    };
    vars.extend(std::env::vars().filter(|(key, _)| key.starts_with("SCONE_LEDGER_")));
    let mut settings = LedgerSettings::from_map(vars)?;
    if let Some(db) = &cli.db {
        settings.db_path = db.clone();
    }
    Ok(settings)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let store = Arc::new(
        SqliteStore::open(&settings.db_path)
            .with_context(|| format!("failed to open ledger {}", settings.db_path.display()))?,
    );

    match cli.command {
        Commands::Create {
            chain,
            address,
            priority,
            admin,
            external_ref,
            json,
        } => {
            let contract = ContractId::new(chain, address)?;
            let target = Target::new(contract, priority).with_admin_control(admin);
            create_session(&store, &settings, target, external_ref, json)?
        }
        Commands::List { state, json } => list_sessions(&store, state, json)?,
        Commands::Show { id, json } => print_session(&store.get(&id)?, json)?,
        Commands::Poll { id, json } => {
            let session = store.get(&id)?;
            poll_sessions(&store, &settings, vec![session], json).await?
        }
        Commands::PollAll { json } => {
            let mut open = Vec::new();
            for state in [SessionState::Pending, SessionState::Running] {
                for session in store.list(Some(state)) {
                    open.push(session?);
                }
            }
            if settings.artifacts_dir.is_some() {
                for session in store.list(Some(SessionState::Completed)) {
                    let session = session?;
                    if session.harvested_at.is_none() {
                        open.push(session);
                    }
                }
            }
            open.sort_by_key(|session| session.created_at);
            poll_sessions(&store, &settings, open, json).await?
        }
        Commands::Retry { id, json } => {
            let session = store.retry(&id)?;
            print_session(&session, json)?
        }
        Commands::Ingest { file, json } => {
            let findings = read_findings(&file)?;
            ingest_findings(&store, &settings, findings, json).await?
        }
        Commands::Extract {
            session,
            file,
            reference,
            json,
        } => {
            let session = store.get(&session)?;
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let extractor = TextFindingExtractor::new()?;
            let findings = extractor
                .extract(&session, &text)?
                .into_iter()
                .map(|finding| match &reference {
                    Some(link) => finding.with_reference(link.clone()),
                    None => finding,
                })
                .collect();
            ingest_findings(&store, &settings, findings, json).await?
        }
        Commands::Quota { json } => show_quota(&store, &settings, json)?,
    }
    Ok(())
}

fn create_session(
    store: &SqliteStore,
    settings: &LedgerSettings,
    target: Target,
    external_ref: Option<String>,
    json: bool,
) -> Result<()> {
    if target.admin_control.is_protected() {
        warn!(
            contract = %target.contract,
            admin = target.admin_control.as_str(),
            "target admin is protected; findings may not be exploitable"
        );
    }
    let new = NewSession {
        external_ref,
        ..NewSession::new(target)
    };
    let (session, window) = store.insert_within_quota(new, &settings.quota_policy())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }
    println!(
        "{} session {} for {} ({} of {} sessions used)",
        "created".green().bold(),
        session.id,
        session.target.contract,
        window.used,
        window.limit
    );
    Ok(())
}

fn list_sessions(store: &SqliteStore, state: Option<SessionState>, json: bool) -> Result<()> {
    if json {
        let sessions = store.list(state).collect::<Result<Vec<_>, _>>()?;
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    let mut count = 0;
    for session in store.list(state) {
        let session = session?;
        println!(
            "- {id}  {state:<10} {contract}  created {created}",
            id = session.id,
            state = state_label(session.state),
            contract = session.target.contract,
            created = session.created_at.to_rfc3339(),
        );
        count += 1;
    }
    println!("{count} session(s)");
    Ok(())
}

fn print_session(session: &Session, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(session)?);
        return Ok(());
    }
    println!("Session:   {}", session.id);
    println!("State:     {}", state_label(session.state));
    println!("Contract:  {}", session.target.contract);
    println!("Admin:     {}", session.target.admin_control.as_str());
    println!("Priority:  {:.2}", session.target.priority_score);
    println!("Created:   {}", session.created_at.to_rfc3339());
    if let Some(completed_at) = session.completed_at {
        println!("Completed: {}", completed_at.to_rfc3339());
    }
    if let Some(external_ref) = &session.external_ref {
        println!("Remote:    {external_ref}");
    }
    if let Some(retry_of) = &session.retry_of {
        println!("Retry of:  {retry_of}");
    }
    Ok(())
}

fn state_label(state: SessionState) -> colored::ColoredString {
    let label = state.as_str();
    match state {
        SessionState::Pending => label.white(),
        SessionState::Running => label.cyan(),
        SessionState::Completed => label.green().bold(),
        SessionState::Failed => label.red().bold(),
    }
}

fn alert_channel(settings: &LedgerSettings) -> Result<Arc<dyn AlertChannel>> {
    let channel: Arc<dyn AlertChannel> = match &settings.webhook_url {
        Some(url) => Arc::new(WebhookChannel::new(url.clone(), settings.poll_timeout)?),
        None => Arc::new(LogChannel),
    };
    Ok(channel)
}

fn notifier_gate(settings: &LedgerSettings) -> Result<NotifierGate<dyn AlertChannel>> {
    Ok(NotifierGate::with_threshold(
        alert_channel(settings)?,
        settings.notify_threshold,
    )?)
}

#[derive(Serialize)]
struct PollLine {
    session_id: String,
    observed: Option<ObservedState>,
    accepted: usize,
    notified: usize,
    error: Option<String>,
}

impl PollLine {
    fn observed(session: &Session, observed: ObservedState) -> Self {
        Self {
            session_id: session.id.clone(),
            observed: Some(observed),
            accepted: 0,
            notified: 0,
            error: None,
        }
    }

    fn failed(session: &Session, error: String) -> Self {
        Self {
            session_id: session.id.clone(),
            observed: None,
            accepted: 0,
            notified: 0,
            error: Some(error),
        }
    }
}

/// Harvests findings when an artifacts directory is configured, otherwise only tracks state.
enum StatusChecker {
    Harvest(Harvester<SqliteStore, HttpScanService, DirectoryArtifacts, dyn AlertChannel>),
    Poll(StatusPoller<SqliteStore, HttpScanService>),
}

impl StatusChecker {
    fn new(store: &Arc<SqliteStore>, settings: &LedgerSettings) -> Result<Self> {
        let service = Arc::new(HttpScanService::new(settings)?);
        let poller = StatusPoller::with_timeout(Arc::clone(store), service, settings.poll_timeout);
        Ok(match &settings.artifacts_dir {
            Some(dir) => Self::Harvest(Harvester::new(
                poller,
                Deduplicator::with_policy(Arc::clone(store), settings.duplicate_policy),
                notifier_gate(settings)?,
                Arc::new(DirectoryArtifacts::new(dir)?),
            )),
            None => Self::Poll(poller),
        })
    }

    async fn check(&self, session: &Session) -> PollLine {
        match self {
            Self::Harvest(harvester) => match harvester.harvest(session).await {
                Ok(report) => {
                    let (accepted, notified) = (report.accepted(), report.notified());
                    PollLine {
                        accepted,
                        notified,
                        ..PollLine::observed(session, report.observed)
                    }
                }
                Err(err) => PollLine::failed(session, err.to_string()),
            },
            Self::Poll(poller) => match poller.poll(session).await {
                Ok(observed) => PollLine::observed(session, observed),
                Err(err) => PollLine::failed(session, err.to_string()),
            },
        }
    }
}

async fn poll_sessions(
    store: &Arc<SqliteStore>,
    settings: &LedgerSettings,
    sessions: Vec<Session>,
    json: bool,
) -> Result<()> {
    let checker = StatusChecker::new(store, settings)?;
    let mut lines = Vec::with_capacity(sessions.len());
    for session in &sessions {
        lines.push(checker.check(session).await);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
        return Ok(());
    }
    for line in &lines {
        match (&line.observed, &line.error) {
            (Some(observed), _) => {
                let marker = if observed.changed {
                    "advanced".green().bold()
                } else {
                    "unchanged".normal()
                };
                println!(
                    "{} {} -> {} (findings accepted: {}, notified: {})",
                    marker,
                    line.session_id,
                    state_label(observed.state),
                    line.accepted,
                    line.notified
                );
            }
            (None, Some(error)) => {
                println!("{} {}: {}", "failed".red().bold(), line.session_id, error)
            }
            (None, None) => {}
        }
    }
    Ok(())
}

fn read_findings(path: &Path) -> Result<Vec<Finding>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    if is_yaml {
        serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML findings in {}", path.display()))
    } else {
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON findings in {}", path.display()))
    }
}

#[derive(Serialize)]
struct IngestLine {
    fingerprint: String,
    contract: String,
    vulnerability_kind: String,
    confidence: f64,
    acceptance: Acceptance,
    decision: Decision,
    dispatch_error: Option<String>,
}

/// Findings must be well formed and come from sessions the ledger has seen complete.
fn ensure_completed(store: &SqliteStore, finding: &Finding) -> Result<()> {
    finding.validate()?;
    let session = store.get(&finding.session_id)?;
    if session.state != SessionState::Completed {
        return Err(LedgerError::SessionNotCompleted {
            id: session.id,
            state: session.state,
        }
        .into());
    }
    Ok(())
}

async fn ingest_findings(
    store: &Arc<SqliteStore>,
    settings: &LedgerSettings,
    findings: Vec<Finding>,
    json: bool,
) -> Result<()> {
    for finding in &findings {
        ensure_completed(store, finding)?;
    }
    let dedup = Deduplicator::with_policy(Arc::clone(store), settings.duplicate_policy);
    let gate = notifier_gate(settings)?;

    let mut lines = Vec::with_capacity(findings.len());
    let mut outcome = Ok(());
    for finding in findings {
        match ingest_one(&dedup, &gate, &finding).await {
            Ok(line) => lines.push(line),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }
    print_ingest_lines(&lines, json)?;
    outcome
}

async fn ingest_one(
    dedup: &Deduplicator<SqliteStore>,
    gate: &NotifierGate<dyn AlertChannel>,
    finding: &Finding,
) -> Result<IngestLine> {
    let acceptance = dedup.ingest(finding)?;
    let (decision, dispatch_error) = match gate.evaluate(finding, acceptance).await {
        Ok(decision) => (decision, None),
        Err(err @ NotifyError::DispatchFailed { .. }) => {
            (Decision::Notify, Some(err.to_string()))
        }
        Err(err) => return Err(err.into()),
    };
    Ok(IngestLine {
        fingerprint: finding.fingerprint().to_string(),
        contract: finding.contract.to_string(),
        vulnerability_kind: finding.vulnerability_kind.clone(),
        confidence: finding.confidence,
        acceptance,
        decision,
        dispatch_error,
    })
}

fn print_ingest_lines(lines: &[IngestLine], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(lines)?);
        return Ok(());
    }
    for line in lines {
        let acceptance = match line.acceptance {
            Acceptance::Accepted => "accepted".green().bold(),
            Acceptance::Duplicate => "duplicate".yellow(),
        };
        let decision = match (&line.decision, &line.dispatch_error) {
            (Decision::Notify, None) => "notified".green(),
            (Decision::Notify, Some(_)) => "dispatch failed".red().bold(),
            (Decision::Suppress, _) => "suppressed".normal(),
        };
        println!(
            "{acceptance} {kind} on {contract} ({confidence:.0}%) {decision} [{fp}]",
            kind = line.vulnerability_kind,
            contract = line.contract,
            confidence = line.confidence * 100.0,
            fp = &line.fingerprint[..12.min(line.fingerprint.len())],
        );
        if let Some(error) = &line.dispatch_error {
            println!("    {error}");
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct QuotaView {
    name: String,
    limit: u32,
    used: u32,
    remaining: u32,
    window: String,
    resets_at: Option<DateTime<Utc>>,
}

fn show_quota(store: &SqliteStore, settings: &LedgerSettings, json: bool) -> Result<()> {
    let policy = settings.quota_policy();
    let current = QuotaStore::quota(store, &policy.name)?
        .map(|window| window.at(Utc::now()));
    let used = current.as_ref().map_or(0, |window| window.used);
    let view = QuotaView {
        name: policy.name.clone(),
        limit: policy.limit,
        used,
        remaining: policy.limit.saturating_sub(used),
        window: humantime::format_duration(policy.window).to_string(),
        resets_at: current.map(|window| window.resets_at()),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    let remaining = if view.remaining == 0 {
        view.remaining.to_string().red().bold()
    } else {
        view.remaining.to_string().green()
    };
    println!(
        "quota {}: {} of {} used, {} remaining (window {})",
        view.name, view.used, view.limit, remaining, view.window
    );
    if let Some(resets_at) = view.resets_at {
        println!("resets at {}", resets_at.to_rfc3339());
    }
    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
