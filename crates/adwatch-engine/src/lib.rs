//! Reconciliation engine and the watch pipelines built around it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use adwatch_almanac::{birthdays_on, refresh_solar_from_lunar, BirthdayBasis, BirthdayEntry};
use adwatch_core::{
    Observation, ReconcileError, Record, RecordStatus, SequencePosition, SkipReason,
    SkippedObservation,
};
use adwatch_notify::Notifier;
use adwatch_source::{ListingSelectors, ObservationSource, RunContext};
use adwatch_store::TableStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-engine";

/// Everything one reconciliation pass produces. `snapshot` is the final
/// ordered table; the three classification lists carry the same records with
/// their final ranks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub new: Vec<Record>,
    pub updated: Vec<Record>,
    pub stale: Vec<Record>,
    pub snapshot: Vec<Record>,
    pub skipped: Vec<SkippedObservation>,
}

/// Reconcile a fresh observation batch against the persisted snapshot.
///
/// Pure and deterministic: no I/O, same inputs always give the same outcome.
/// The only fatal condition is a duplicate identity inside the snapshot
/// itself; observations without a derivable identity are dropped and
/// reported in `skipped`, and a duplicate identity within the batch is
/// ignored after its first occurrence.
pub fn reconcile(
    observed: &[Observation],
    snapshot: &[Record],
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, ReconcileError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(snapshot.len());
    for (row, record) in snapshot.iter().enumerate() {
        if let Some(&first_row) = index.get(record.identity.as_str()) {
            return Err(ReconcileError::MalformedSnapshot {
                identity: record.identity.clone(),
                first_row,
                second_row: row,
            });
        }
        index.insert(record.identity.as_str(), row);
    }

    // Touched records in batch discovery order, tagged with whether they are
    // new; identity equality always wins over attribute equality.
    let mut touched: Vec<(Record, bool)> = Vec::new();
    let mut seen_this_run: HashSet<&str> = HashSet::new();
    let mut touched_rows: HashSet<usize> = HashSet::new();
    let mut skipped = Vec::new();

    for (batch_index, observation) in observed.iter().enumerate() {
        let Some(identity) = observation.identity.as_deref() else {
            skipped.push(SkippedObservation {
                index: batch_index,
                reason: SkipReason::MissingIdentity,
            });
            continue;
        };
        // First occurrence wins inside one batch.
        if !seen_this_run.insert(identity) {
            continue;
        }

        match index.get(identity) {
            None => {
                touched.push((
                    Record {
                        identity: identity.to_string(),
                        rank: 0,
                        position: observation.position,
                        immutable: observation.immutable.clone(),
                        mutable: observation.mutable.clone(),
                        status: RecordStatus::Active,
                        first_seen_at: now,
                        last_seen_at: now,
                    },
                    true,
                ));
            }
            Some(&row) => {
                let mut record = snapshot[row].clone();
                record.mutable = observation.mutable.clone();
                record.position = observation.position;
                record.status = RecordStatus::Active;
                record.last_seen_at = now;
                touched.push((record, false));
                touched_rows.insert(row);
            }
        }
    }

    // Untouched rows stay in the snapshot as stale. Only rows freshly
    // transitioning from active land in the stale list, so a re-run over the
    // engine's own output reports nothing as newly stale.
    let mut untouched: Vec<(Record, bool)> = Vec::new();
    for (row, record) in snapshot.iter().enumerate() {
        if !touched_rows.contains(&row) {
            let was_active = record.status == RecordStatus::Active;
            let mut record = record.clone();
            record.status = RecordStatus::Stale;
            untouched.push((record, was_active));
        }
    }

    // Final ordering: position ascending; within a position, records touched
    // this run in discovery order, then untouched stale rows in prior order.
    let mut keyed: Vec<(SequencePosition, u8, usize, Record, Option<bool>)> = Vec::new();
    for (discovery, (record, is_new)) in touched.into_iter().enumerate() {
        keyed.push((record.position, 0, discovery, record, Some(is_new)));
    }
    for (prior, (record, _)) in untouched.iter().cloned().enumerate() {
        keyed.push((record.position, 1, prior, record, None));
    }
    keyed.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

    let mut final_snapshot = Vec::with_capacity(keyed.len());
    let mut new = Vec::new();
    let mut updated = Vec::new();
    let mut stale_ranks: HashMap<String, u32> = HashMap::new();
    for (display_index, (_, _, _, mut record, is_new)) in keyed.into_iter().enumerate() {
        record.rank = display_index as u32 + 1;
        match is_new {
            Some(true) => new.push(record.clone()),
            Some(false) => updated.push(record.clone()),
            None => {
                stale_ranks.insert(record.identity.clone(), record.rank);
            }
        }
        final_snapshot.push(record);
    }
    let mut stale = Vec::new();
    for (mut record, was_active) in untouched {
        if let Some(&rank) = stale_ranks.get(&record.identity) {
            record.rank = rank;
        }
        if was_active {
            stale.push(record);
        }
    }

    // New and updated lists come back in discovery order, stale in prior
    // snapshot order, regardless of where sorting placed them.
    new.sort_by_key(|r| {
        observed
            .iter()
            .position(|o| o.identity.as_deref() == Some(r.identity.as_str()))
            .unwrap_or(usize::MAX)
    });
    updated.sort_by_key(|r| {
        observed
            .iter()
            .position(|o| o.identity.as_deref() == Some(r.identity.as_str()))
            .unwrap_or(usize::MAX)
    });

    Ok(ReconcileOutcome {
        new,
        updated,
        stale,
        snapshot: final_snapshot,
        skipped,
    })
}

/// Process-level configuration, read once at startup and passed down.
/// Nothing else in the workspace touches the environment.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub snapshot_path: PathBuf,
    pub birthday_book_path: PathBuf,
    pub registry_path: PathBuf,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_pages: u32,
    pub max_consecutive_empty: u32,
    pub tz_hours: f64,
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self {
            snapshot_path: std::env::var("ADWATCH_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/snapshot.json")),
            birthday_book_path: std::env::var("ADWATCH_BIRTHDAY_BOOK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/birthdays.json")),
            registry_path: std::env::var("ADWATCH_REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./watches.yaml")),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
            user_agent: std::env::var("ADWATCH_USER_AGENT")
                .unwrap_or_else(|_| "adwatch/0.1".to_string()),
            http_timeout_secs: std::env::var("ADWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_pages: std::env::var("ADWATCH_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            max_consecutive_empty: std::env::var("ADWATCH_MAX_CONSECUTIVE_EMPTY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            tz_hours: std::env::var("ADWATCH_TZ_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(adwatch_almanac::DEFAULT_TZ_HOURS),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchRegistry {
    pub watches: Vec<WatchEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchEntry {
    pub watch_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub start_url: String,
    #[serde(default)]
    pub selectors: Option<ListingSelectors>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn load_watch_registry(path: &PathBuf) -> Result<WatchRegistry> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub observed: usize,
    pub new: usize,
    pub updated: usize,
    pub stale: usize,
    pub skipped: usize,
    pub total_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BirthdaySummary {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub today_matches: usize,
    pub tomorrow_matches: usize,
    pub book_rewritten: bool,
    pub notified: bool,
}

/// One listing watch wired to its collaborators. Reads the snapshot,
/// observes, reconciles, writes the snapshot back, then alerts on new
/// records. Notify failures are logged and never abort the run; a malformed
/// snapshot aborts before anything is written.
pub struct WatchPipeline {
    snapshot_store: Box<dyn TableStore<Record>>,
    source: Box<dyn ObservationSource>,
    notifier: Box<dyn Notifier>,
}

impl WatchPipeline {
    pub fn new(
        snapshot_store: Box<dyn TableStore<Record>>,
        source: Box<dyn ObservationSource>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            snapshot_store,
            source,
            notifier,
        }
    }

    pub async fn run_scan(&self) -> Result<ScanSummary> {
        let ctx = RunContext::new();
        info!(run_id = %ctx.run_id, source_id = self.source.source_id(), "scan starting");

        let snapshot = self
            .snapshot_store
            .read()
            .await
            .context("reading snapshot table")?;
        let observed = self
            .source
            .observe(&ctx)
            .await
            .context("observing source")?;

        let outcome = reconcile(&observed, &snapshot, Utc::now())?;

        self.snapshot_store
            .write(&outcome.snapshot)
            .await
            .context("writing snapshot table")?;

        for record in &outcome.new {
            if let Err(err) = self.notifier.notify_record(record).await {
                warn!(identity = %record.identity, error = %err, "notify failed; continuing");
            }
        }

        let summary = ScanSummary {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            observed: observed.len(),
            new: outcome.new.len(),
            updated: outcome.updated.len(),
            stale: outcome.stale.len(),
            skipped: outcome.skipped.len(),
            total_rows: outcome.snapshot.len(),
        };
        info!(
            run_id = %summary.run_id,
            new = summary.new,
            updated = summary.updated,
            stale = summary.stale,
            skipped = summary.skipped,
            total = summary.total_rows,
            "scan finished"
        );
        Ok(summary)
    }
}

pub struct BirthdayPipeline {
    book_store: Box<dyn TableStore<BirthdayEntry>>,
    notifier: Box<dyn Notifier>,
    tz_hours: f64,
}

impl BirthdayPipeline {
    pub fn new(
        book_store: Box<dyn TableStore<BirthdayEntry>>,
        notifier: Box<dyn Notifier>,
        tz_hours: f64,
    ) -> Self {
        Self {
            book_store,
            notifier,
            tz_hours,
        }
    }

    pub async fn run(&self, today: NaiveDate) -> Result<BirthdaySummary> {
        let run_id = Uuid::new_v4();
        let mut entries = self
            .book_store
            .read()
            .await
            .context("reading birthday book")?;

        // Write the book back only when the derived column actually moved.
        let book_rewritten = refresh_solar_from_lunar(&mut entries, today.year(), self.tz_hours);
        if book_rewritten {
            self.book_store
                .write(&entries)
                .await
                .context("writing birthday book")?;
        }

        let tomorrow = today.succ_opt().context("date overflow computing tomorrow")?;
        let today_matches = birthdays_on(&entries, today);
        let tomorrow_matches = birthdays_on(&entries, tomorrow);

        let mut notified = false;
        if !today_matches.is_empty() || !tomorrow_matches.is_empty() {
            let digest = render_birthday_digest(today, &today_matches, tomorrow, &tomorrow_matches);
            match self.notifier.notify_text(&digest).await {
                Ok(()) => notified = true,
                Err(err) => warn!(error = %err, "birthday notify failed; continuing"),
            }
        }

        let summary = BirthdaySummary {
            run_id,
            date: today,
            today_matches: today_matches.len(),
            tomorrow_matches: tomorrow_matches.len(),
            book_rewritten,
            notified,
        };
        info!(
            run_id = %summary.run_id,
            today = summary.today_matches,
            tomorrow = summary.tomorrow_matches,
            rewritten = summary.book_rewritten,
            "birthday check finished"
        );
        Ok(summary)
    }
}

pub fn render_birthday_digest(
    today: NaiveDate,
    today_matches: &[adwatch_almanac::BirthdayMatch],
    tomorrow: NaiveDate,
    tomorrow_matches: &[adwatch_almanac::BirthdayMatch],
) -> String {
    let mut sections = Vec::new();
    if !today_matches.is_empty() {
        sections.push(render_birthday_section(
            &format!("🎉 Hôm nay ({})", today.format("%d/%m/%Y")),
            today_matches,
        ));
    }
    if !tomorrow_matches.is_empty() {
        sections.push(render_birthday_section(
            &format!("📅 Ngày mai ({})", tomorrow.format("%d/%m/%Y")),
            tomorrow_matches,
        ));
    }
    sections.join("\n\n")
}

fn render_birthday_section(heading: &str, matches: &[adwatch_almanac::BirthdayMatch]) -> String {
    let mut lines = vec![format!("{heading} là sinh nhật của:")];
    for m in matches {
        let detail = match &m.basis {
            BirthdayBasis::Solar(date) => format!("Dương lịch: {}", date.format("%d/%m/%Y")),
            BirthdayBasis::Lunar(lunar) => format!("Âm lịch: {}/{}", lunar.day, lunar.month),
        };
        lines.push(format!("- {} ({})", m.name, detail));
    }
    lines.join("\n")
}
