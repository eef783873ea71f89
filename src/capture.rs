//! Trigger/read/store cycle driving one instrument into one container.

use crate::config::RunSettings;
use crate::protocol::{Scope, Settings};
use crate::settings::log_settings;
use crate::stats::RunStats;
use crate::store::{Compression, Store};
use crate::waveform::{
    build_time_axis, decode, derive_sample_layout, RawSamples, SampleDtype, WaveformDescriptor,
};
use crate::{DaqError, Result};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_EXTENSION: &str = "hdf5";

/// Cooperative stop request, checked between trigger cycles.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Configuring,
    Triggering,
    Reading,
    Cancelled,
    Faulted,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Consecutive transient failures tolerated before giving up
    pub max_retries: usize,
    pub compression: Compression,
    /// Operator attributes stored at the container root
    pub attributes: BTreeMap<String, String>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_retries: 10,
            compression: Compression::default(),
            attributes: BTreeMap::new(),
        }
    }
}

impl From<&RunSettings> for CaptureOptions {
    fn from(settings: &RunSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            compression: Compression {
                level: settings.compression_level,
                threads: settings.blosc_threads,
            },
            attributes: settings
                .attributes
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchSummary {
    pub events_written: usize,
    pub elapsed_seconds: f64,
    pub cycles: usize,
    pub retries: usize,
    pub cancelled: bool,
}

struct ChannelPlan {
    channel: u8,
    desc: WaveformDescriptor,
    dtype: SampleDtype,
}

/// One capture run. Owns the store for its lifetime and borrows the scope.
pub struct CaptureSession<'a> {
    scope: &'a mut dyn Scope,
    options: &'a CaptureOptions,
    state: CaptureState,
    store: Option<Store>,
    plans: Vec<ChannelPlan>,
    sequence_count: usize,
    written: usize,
    committed: BTreeMap<u8, usize>,
    stats: RunStats,
    torn_down: bool,
}

impl<'a> CaptureSession<'a> {
    pub fn new(scope: &'a mut dyn Scope, options: &'a CaptureOptions) -> Self {
        Self {
            scope,
            options,
            state: CaptureState::Idle,
            store: None,
            plans: Vec::new(),
            sequence_count: 1,
            written: 0,
            committed: BTreeMap::new(),
            stats: RunStats::new(),
            torn_down: false,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Acquire `events` events into a new container at `path`.
    pub fn run(
        &mut self,
        path: &Path,
        events: usize,
        cancel: &CancellationToken,
    ) -> Result<FetchSummary> {
        let outcome = self
            .configure(path, events)
            .and_then(|()| self.acquire(events, cancel));
        if outcome.is_err() {
            self.state = CaptureState::Faulted;
        }
        let teardown = self.teardown();

        match (outcome, teardown) {
            (Err(e), Err(t)) => {
                error!("teardown after failure: {t}");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(t)) => Err(t),
            (Ok(cancelled), Ok(())) => {
                let summary = self.summary(cancelled);
                match self.stats.seconds_per_event() {
                    Some(per_event) => info!(
                        "wrote {} events in {:.1} s ({:.4} s per event)",
                        summary.events_written, summary.elapsed_seconds, per_event
                    ),
                    None => info!("wrote no events in {:.1} s", summary.elapsed_seconds),
                }
                Ok(summary)
            }
        }
    }

    fn summary(&self, cancelled: bool) -> FetchSummary {
        FetchSummary {
            events_written: self.written,
            elapsed_seconds: self.stats.elapsed_secs(),
            cycles: self.stats.cycles,
            retries: self.stats.retries,
            cancelled,
        }
    }

    fn configure(&mut self, path: &Path, events: usize) -> Result<()> {
        self.state = CaptureState::Configuring;
        if events == 0 {
            return Err(DaqError::Configuration("event target must be at least 1".into()));
        }

        self.scope.set_display(false)?;
        self.scope.check_errors()?;
        self.scope.clear()?;

        let channels = self.scope.active_channels()?;
        if channels.is_empty() {
            return Err(DaqError::Configuration("no active channels".into()));
        }
        let settings = self.scope.settings()?;
        log_settings(&settings);
        self.sequence_count = self.scope.sequence_count(&settings)?;
        self.scope.prepare()?;

        for &channel in &channels {
            let desc = self.scope.descriptor(channel, self.sequence_count)?;
            let dtype = derive_sample_layout(&desc)?.dtype();
            debug!(
                "channel {channel}: {} samples x {} events, {:?}",
                desc.samples_per_event(),
                desc.events_per_block(),
                dtype
            );
            self.plans.push(ChannelPlan {
                channel,
                desc,
                dtype,
            });
        }

        // Held by the session before any dataset exists so teardown can shrink it.
        let store = self
            .store
            .insert(Store::open(path, self.options.compression)?);
        store.set_settings(&settings)?;
        store.set_attributes(self.options.attributes.iter())?;
        for plan in &self.plans {
            store.declare_channel(
                plan.channel,
                events,
                plan.desc.samples_per_event(),
                plan.dtype,
                &plan.desc,
            )?;
            self.committed.insert(plan.channel, 0);
        }
        info!(
            "capturing {events} events on channels {:?} (sequence count {})",
            channels, self.sequence_count
        );
        Ok(())
    }

    /// Returns whether the loop stopped on cancellation.
    fn acquire(&mut self, events: usize, cancel: &CancellationToken) -> Result<bool> {
        let mut consecutive = 0;
        while self.written < events {
            if cancel.is_cancelled() {
                info!("cancelled after {} events", self.written);
                self.state = CaptureState::Cancelled;
                return Ok(true);
            }

            match self.cycle(events) {
                Ok(()) => consecutive = 0,
                Err(e) if e.is_transient() => {
                    consecutive += 1;
                    self.stats.retry();
                    if consecutive > self.options.max_retries {
                        return Err(DaqError::RetryLimit {
                            attempts: consecutive,
                            last: Box::new(e),
                        });
                    }
                    warn!("retrying cycle at event {}: {e}", self.written);
                    self.scope.clear()?;
                }
                Err(e) => return Err(e),
            }

            if self.stats.report_due() {
                info!(
                    "{}/{} events, {:.2} MB/s",
                    self.written,
                    events,
                    self.stats.average_rate()
                );
            }
        }
        self.state = CaptureState::Idle;
        Ok(false)
    }

    fn cycle(&mut self, events: usize) -> Result<()> {
        self.state = CaptureState::Triggering;
        self.scope.trigger()?;

        self.state = CaptureState::Reading;
        let usable = self.sequence_count.min(events - self.written);
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| DaqError::Configuration("store is not open".into()))?;
        let mut size = 0;
        for plan in &self.plans {
            let bytes = self.scope.read_waveform_block(plan.channel, &plan.desc)?;
            if bytes.len() != plan.desc.block_bytes() {
                return Err(DaqError::MalformedBlock {
                    expected: plan.desc.block_bytes(),
                    actual: bytes.len(),
                });
            }
            size += bytes.len();
            let layout = derive_sample_layout(&plan.desc)?;
            let batch = RawSamples::from_bytes(&bytes, layout)?
                .into_events(self.sequence_count)?
                .truncate(usable);
            store.write_batch(plan.channel, self.written, &batch)?;
        }

        self.written += usable;
        for plan in &self.plans {
            self.committed.insert(plan.channel, self.written);
        }
        self.stats.increment(usable, size);
        Ok(())
    }

    /// Close the store and hand the instrument back to the operator. Runs once.
    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut first: Option<DaqError> = None;
        let mut note = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!("teardown {step}: {e}");
                first.get_or_insert(e);
            }
        };

        if let Some(mut store) = self.store.take() {
            note("finalize", store.finalize(&self.committed));
            note("close", store.close());
        }
        note("clear", self.scope.clear());
        note("display", self.scope.set_display(true));
        note("error check", self.scope.check_errors());

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Acquire `events` events from `scope` into a new container at `path`.
pub fn fetch(
    scope: &mut dyn Scope,
    path: &Path,
    events: usize,
    options: &CaptureOptions,
    cancel: &CancellationToken,
) -> Result<FetchSummary> {
    CaptureSession::new(scope, options).run(path, events, cancel)
}

/// One acquisition of `channel` as `(time_axis, physical_values)`.
///
/// In sequence mode `values` holds every event back to back and the time
/// axis restarts for each of them, so both vectors have the same length.
pub fn get_waveform(scope: &mut dyn Scope, channel: u8) -> Result<(Vec<f64>, Vec<f64>)> {
    scope.trigger()?;
    let sequence_count = scope.sequence_count(&Settings::new())?;
    let desc = scope.descriptor(channel, sequence_count)?;
    let bytes = scope.read_waveform_block(channel, &desc)?;
    if bytes.len() != desc.block_bytes() {
        return Err(DaqError::MalformedBlock {
            expected: desc.block_bytes(),
            actual: bytes.len(),
        });
    }
    let values = decode(&bytes, &desc)?;
    let event_axis = build_time_axis(&desc);
    let time = event_axis.iter().copied().cycle().take(values.len()).collect();
    Ok((time, values))
}

/// Output path for run `run` of `runs`: `<stem>_<NN>.<ext>` when there is
/// more than one run.
pub fn run_file_name(output: &Path, run: usize, runs: usize) -> PathBuf {
    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(DEFAULT_EXTENSION);
    if runs <= 1 {
        return output.with_extension(ext);
    }
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("run");
    let width = runs.to_string().len().max(2);
    output.with_file_name(format!("{stem}_{run:0width$}.{ext}"))
}
