//! Hierarchical timing spans for one task run.
//!
//! A [`Profiler`] is owned by a single run and reset at its start. Spans nest
//! by the order they are opened; completed spans are aggregated per name by
//! [`Profiler::summary`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

pub type Metadata = BTreeMap<String, Value>;

/// Handle to an opened span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(usize);

#[derive(Debug, Clone)]
struct TimingEntry {
    name: String,
    start: Instant,
    end: Option<Instant>,
    parent: Option<SpanId>,
    children: Vec<SpanId>,
    depth: usize,
    metadata: Metadata,
}

impl TimingEntry {
    fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.duration_since(self.start))
    }
}

/// Snapshot of one span, open or closed.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub name: String,
    pub depth: usize,
    pub parent: Option<SpanId>,
    pub children: Vec<SpanId>,
    pub duration: Option<Duration>,
    pub metadata: Metadata,
}

#[derive(Debug, Default)]
struct ProfilerState {
    entries: Vec<TimingEntry>,
    stack: Vec<SpanId>,
}

#[derive(Debug, Default)]
pub struct Profiler {
    state: Mutex<ProfilerState>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a span nested under the innermost open span.
    pub fn start(&self, name: &str, metadata: Option<Metadata>) -> SpanId {
        let mut state = self.lock();
        let id = SpanId(state.entries.len());
        let parent = state.stack.last().copied();
        let depth = state.stack.len();
        if let Some(parent) = parent {
            state.entries[parent.0].children.push(id);
        }
        state.entries.push(TimingEntry {
            name: name.to_string(),
            start: Instant::now(),
            end: None,
            parent,
            children: Vec::new(),
            depth,
            metadata: metadata.unwrap_or_default(),
        });
        state.stack.push(id);
        id
    }

    /// Close a span and return its duration.
    ///
    /// Unknown or already closed ids return `None`. A span closed out of order
    /// is removed from the open stack wherever it sits.
    pub fn end(&self, id: SpanId) -> Option<Duration> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(id.0)?;
        if entry.end.is_some() {
            warn!(span = %entry.name, "span already closed");
            return None;
        }
        let end = Instant::now();
        entry.end = Some(end);
        let duration = end.duration_since(entry.start);
        let (name, depth) = (entry.name.clone(), entry.depth);
        let metadata = if entry.metadata.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&entry.metadata).unwrap_or_default()
        };
        if let Some(pos) = state.stack.iter().rposition(|open| *open == id) {
            state.stack.remove(pos);
        }
        drop(state);

        info!(
            target: "autopilot::profiler",
            "{}{}: {:.3}s {}",
            "  ".repeat(depth),
            name,
            duration.as_secs_f64(),
            metadata
        );
        Some(duration)
    }

    /// Open a span that closes when the returned guard drops.
    pub fn scope(&self, name: &str, metadata: Option<Metadata>) -> SpanGuard<'_> {
        SpanGuard {
            profiler: self,
            id: self.start(name, metadata),
        }
    }

    /// Merge keys into a span's metadata. Unknown ids are ignored.
    pub fn add_metadata(&self, id: SpanId, metadata: Metadata) {
        if let Some(entry) = self.lock().entries.get_mut(id.0) {
            entry.metadata.extend(metadata);
        }
    }

    pub fn span(&self, id: SpanId) -> Option<SpanRecord> {
        let state = self.lock();
        let entry = state.entries.get(id.0)?;
        Some(SpanRecord {
            name: entry.name.clone(),
            depth: entry.depth,
            parent: entry.parent,
            children: entry.children.clone(),
            duration: entry.duration(),
            metadata: entry.metadata.clone(),
        })
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.stack.clear();
    }

    /// Aggregate closed spans by name, sorted by total time descending.
    ///
    /// Open spans are excluded. Total execution time sums closed top-level
    /// spans only, so nested time is not counted twice.
    pub fn summary(&self) -> ProfileSummary {
        let state = self.lock();
        let mut by_name: HashMap<&str, Vec<Duration>> = HashMap::new();
        let mut total_execution = Duration::ZERO;
        for entry in &state.entries {
            let Some(duration) = entry.duration() else {
                continue;
            };
            by_name.entry(&entry.name).or_default().push(duration);
            if entry.parent.is_none() {
                total_execution += duration;
            }
        }

        let mut rows: Vec<SpanStats> = by_name
            .into_iter()
            .map(|(name, durations)| SpanStats::from_durations(name, &durations))
            .collect();
        rows.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
        ProfileSummary {
            rows,
            total_execution,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProfilerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Closes its span on drop, including early returns and `?` paths.
#[must_use = "the span closes when the guard is dropped"]
pub struct SpanGuard<'a> {
    profiler: &'a Profiler,
    id: SpanId,
}

impl SpanGuard<'_> {
    pub fn id(&self) -> SpanId {
        self.id
    }

    pub fn add_metadata(&self, metadata: Metadata) {
        self.profiler.add_metadata(self.id, metadata);
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        self.profiler.end(self.id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanStats {
    pub name: String,
    pub count: usize,
    pub total: Duration,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl SpanStats {
    fn from_durations(name: &str, durations: &[Duration]) -> Self {
        let total: Duration = durations.iter().sum();
        let count = durations.len();
        Self {
            name: name.to_string(),
            count,
            total,
            avg: total / u32::try_from(count.max(1)).unwrap_or(u32::MAX),
            min: durations.iter().min().copied().unwrap_or_default(),
            max: durations.iter().max().copied().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSummary {
    pub rows: Vec<SpanStats>,
    pub total_execution: Duration,
}

impl ProfileSummary {
    pub fn get(&self, name: &str) -> Option<&SpanStats> {
        self.rows.iter().find(|row| row.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl fmt::Display for ProfileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<28} {:>6} {:>10} {:>10} {:>10} {:>10}",
            "span", "count", "total(s)", "avg(s)", "min(s)", "max(s)"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<28} {:>6} {:>10.3} {:>10.3} {:>10.3} {:>10.3}",
                row.name,
                row.count,
                row.total.as_secs_f64(),
                row.avg.as_secs_f64(),
                row.min.as_secs_f64(),
                row.max.as_secs_f64()
            )?;
        }
        write!(
            f,
            "total execution: {:.3}s",
            self.total_execution.as_secs_f64()
        )
    }
}
