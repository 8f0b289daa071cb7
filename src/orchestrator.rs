//! # Pipeline Orchestration
//!
//! Drives one stateless run: fetch, normalize, select, fall back, lay out,
//! render, write. The run moves through the [`Stage`] states and records them
//! in a [`RunReport`].
//!
//! ## Failure Policy
//! Upstream problems never fail a run. A source that keeps failing after its
//! retries is skipped; when no source yields a departure inside the window
//! the synthetic headway schedule is used instead. Only writing the output
//! artifact (and, in pathological configurations, allocating or encoding the
//! canvas) can end a run in [`Stage::Failed`].
//!
//! ## Stop Identity
//! Before any fetch, sources configured without a stop id get the ids found
//! by name in the first stop table available (the timetable archive). The
//! lookup happens once per run; when it fails those sources keep their
//! name-only identity.
//!
//! ## Sequencing
//! Sources are awaited one after the other in configured priority order and
//! the first one producing a non-empty selection wins. Every fetch error is
//! retried with exponential backoff until the source's attempts run out.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, FixedOffset};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, FallbackConfig, LabelsConfig, RetryConfig};
use crate::fallback;
use crate::feed::{FeedSource, FetchError, RawRecord};
use crate::layout::{layout, BoardSpec, Footer, Header, LayoutPlan};
use crate::normalize::{normalize_all, DirectionTable};
use crate::renderer::{render, EncodedImage, RenderError};
use crate::select::select;
use crate::{Departure, StopIdentity};

/// States of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Fetching,
    Normalizing,
    Selecting,
    FallingBack,
    LayingOut,
    Rendering,
    Done,
    Failed,
}

/// Persisting the image failed.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that end a run without an image.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Exponential backoff between attempts on one source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: StdDuration,
    pub max_delay: StdDuration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: StdDuration::from_millis(config.base_delay_ms),
            max_delay: StdDuration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> StdDuration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// What happened during a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    /// Current or final stage
    pub stage: Stage,
    /// Every stage entered, in order
    pub stages: Vec<Stage>,
    /// Source whose departures were shown; `None` on fallback boards
    pub source: Option<String>,
    /// Fetch attempts across all sources
    pub attempts: u32,
    /// Records dropped by the normalizer
    pub rejected: usize,
    /// Departures handed to the layout
    pub departures: usize,
    pub fallback: bool,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            stages: vec![Stage::Idle],
            source: None,
            attempts: 0,
            rejected: 0,
            departures: 0,
            fallback: false,
        }
    }
}

impl RunReport {
    fn enter(&mut self, stage: Stage) {
        debug!(from = ?self.stage, to = ?stage, "stage transition");
        self.stage = stage;
        self.stages.push(stage);
    }
}

/// Everything a run needs, built once from configuration.
pub struct Orchestrator<S> {
    title: String,
    sources: Vec<(StopIdentity, S)>,
    retry: RetryPolicy,
    directions: DirectionTable,
    horizon: Duration,
    max_count: usize,
    fallback: FallbackConfig,
    labels: LabelsConfig,
    spec: BoardSpec,
    output: PathBuf,
}

impl<S: FeedSource> Orchestrator<S> {
    /// `sources` must already be in priority order.
    pub fn from_config(config: &Config, sources: Vec<(StopIdentity, S)>) -> Self {
        Self {
            title: config.stop.name.clone(),
            sources,
            retry: RetryPolicy::from_config(&config.retry),
            directions: DirectionTable::from_config(&config.directions),
            horizon: Duration::minutes(config.selection.horizon_minutes),
            max_count: config.selection.max_count,
            fallback: config.fallback.clone(),
            labels: config.labels.clone(),
            spec: BoardSpec::from_config(&config.board, &config.labels),
            output: config.output.path.clone(),
        }
    }

    pub fn spec(&self) -> &BoardSpec {
        &self.spec
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Fetch from one source, retrying failures with backoff.
    async fn fetch_with_retry(
        &self,
        stop: &StopIdentity,
        source: &S,
        now: DateTime<FixedOffset>,
        report: &mut RunReport,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let mut attempt = 1;
        loop {
            report.attempts += 1;
            debug!(source = source.name(), attempt, "fetching");
            match source.fetch(stop, now, self.horizon).await {
                Ok(records) => {
                    info!(source = source.name(), records = records.len(), attempt, "fetch succeeded");
                    return Ok(records);
                }
                Err(err) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        source = source.name(),
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Every source's stop identity for this run.
    pub async fn resolve_stops(&self) -> Vec<StopIdentity> {
        let mut stops: Vec<StopIdentity> = self.sources.iter().map(|(stop, _)| stop.clone()).collect();
        let Some(name) = stops
            .iter()
            .find(|stop| !stop.is_resolved())
            .map(|stop| stop.name().to_string())
        else {
            return stops;
        };

        let Some(ids) = self.lookup_stop(&name).await else {
            warn!(stop = %name, "stop lookup failed, unresolved sources keep the name only");
            return stops;
        };
        for stop in stops.iter_mut().filter(|stop| !stop.is_resolved()) {
            *stop = StopIdentity::with_ids(stop.name(), ids.iter().cloned());
        }
        stops
    }

    /// Ids for `name` from the first source whose stop table knows it.
    async fn lookup_stop(&self, name: &str) -> Option<BTreeSet<String>> {
        for (_, source) in &self.sources {
            match source.lookup_stop(name).await {
                Ok(Some(ids)) if !ids.is_empty() => {
                    info!(source = source.name(), stop = name, ids = ?ids, "resolved stop by name");
                    return Some(ids);
                }
                Ok(Some(_)) => warn!(source = source.name(), stop = name, "station not in stop table"),
                Ok(None) => {}
                Err(err) => warn!(source = source.name(), error = %err, "stop lookup failed"),
            }
        }
        None
    }

    /// The departures to show: the first source with a non-empty selection,
    /// else the synthetic schedule.
    pub async fn resolve(&self, now: DateTime<FixedOffset>, report: &mut RunReport) -> Vec<Departure> {
        let stops = self.resolve_stops().await;
        for (stop, (_, source)) in stops.iter().zip(&self.sources) {
            report.enter(Stage::Fetching);
            let records = match self.fetch_with_retry(stop, source, now, report).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(source = source.name(), error = %err, "source failed, trying next");
                    continue;
                }
            };

            report.enter(Stage::Normalizing);
            let (departures, rejected) = normalize_all(&records, &self.directions, now);
            report.rejected += rejected;
            if rejected > 0 {
                info!(source = source.name(), accepted = departures.len(), rejected, "records rejected");
            }

            report.enter(Stage::Selecting);
            let selected = select(departures, now, self.horizon, self.max_count);
            if selected.is_empty() {
                info!(source = source.name(), "no departures within the window");
                continue;
            }
            report.source = Some(source.name().to_string());
            report.departures = selected.len();
            return selected;
        }

        report.enter(Stage::FallingBack);
        report.fallback = true;
        let synthetic = fallback::generate(now, &self.fallback, &self.directions);
        warn!(departures = synthetic.len(), "no live departures, using headway model");
        report.departures = synthetic.len();
        synthetic
    }

    /// Resolve departures and lay out the board without rendering it.
    pub async fn plan(&self, now: DateTime<FixedOffset>) -> (LayoutPlan, RunReport) {
        let mut report = RunReport::default();
        let plan = self.plan_with_report(now, &mut report).await;
        (plan, report)
    }

    async fn plan_with_report(&self, now: DateTime<FixedOffset>, report: &mut RunReport) -> LayoutPlan {
        let departures = self.resolve(now, report).await;

        report.enter(Stage::LayingOut);
        let badge = if report.fallback {
            &self.labels.offline_badge
        } else {
            &self.labels.live_badge
        };
        let header = Header {
            title: self.title.clone(),
            badge: Some(badge.clone()),
        };
        let footer = Footer {
            prefix: self.labels.updated_prefix.clone(),
            resolved_at: now,
        };
        layout(&header, &footer, &departures, &self.spec)
    }

    /// Full run; the report is filled in even when the run fails.
    pub async fn run_with_report(
        &self,
        now: DateTime<FixedOffset>,
        report: &mut RunReport,
    ) -> Result<EncodedImage, RunError> {
        let plan = self.plan_with_report(now, report).await;

        report.enter(Stage::Rendering);
        let image = match render(&plan, &self.spec) {
            Ok(image) => image,
            Err(err) => {
                report.enter(Stage::Failed);
                return Err(err.into());
            }
        };

        if let Err(err) = write_atomically(&self.output, &image.bytes) {
            report.enter(Stage::Failed);
            return Err(err.into());
        }
        report.enter(Stage::Done);
        info!(
            path = %self.output.display(),
            source = report.source.as_deref().unwrap_or("fallback"),
            departures = report.departures,
            "board written"
        );
        Ok(image)
    }

    pub async fn run(&self, now: DateTime<FixedOffset>) -> Result<RunReport, RunError> {
        let mut report = RunReport::default();
        self.run_with_report(now, &mut report).await?;
        Ok(report)
    }
}

/// Write to a sibling temporary file, then rename over `path`.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), OutputError> {
    let mut temporary = path.as_os_str().to_owned();
    temporary.push(".tmp");
    let temporary = PathBuf::from(temporary);

    let wrap = |source: io::Error| OutputError::Write {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&temporary, bytes).map_err(wrap)?;
    fs::rename(&temporary, path).map_err(|err| {
        let _ = fs::remove_file(&temporary);
        wrap(err)
    })
}
