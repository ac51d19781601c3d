//! # Collector: source enumeration as a diff stream.
//!
//! ```text
//! pass 1:  enumerate ─► Add/Scan for every entry ─► Watch
//! wait:    source.changed()          (one-shot: stop here)
//! pass N:  enumerate ─► Drop vanished, Add/Scan new or changed ─► Watch
//! ```
//!
//! An unchanged source yields only `Watch`.

use std::collections::{BTreeMap, VecDeque};

use crate::collect::source::{Entry, Source};
use crate::error::TaskError;
use crate::tasks::VarMap;

/// One reconciliation step.
#[derive(Clone, Debug, PartialEq)]
pub enum Collected {
    /// Create or update a task instance.
    Add {
        taskdef: String,
        path: String,
        data: VarMap,
    },
    /// Create or update a nested collector.
    Scan { path: String, data: VarMap },
    /// Remove an instance subtree.
    Drop { path: String },
    /// A full pass is complete; stale children may be removed.
    Watch,
}

impl From<Entry> for Collected {
    fn from(e: Entry) -> Self {
        match e {
            Entry::Task {
                taskdef,
                path,
                data,
            } => Collected::Add {
                taskdef,
                path,
                data,
            },
            Entry::Scan { path, data } => Collected::Scan { path, data },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Fresh,
    Waiting,
    Done,
}

/// Lazy, restartable stream of [`Collected`] steps.
pub struct Collector {
    source: Box<dyn Source>,
    seen: BTreeMap<String, Entry>,
    pending: VecDeque<Collected>,
    one_shot: bool,
    stage: Stage,
}

impl Collector {
    pub fn new(source: impl Source) -> Self {
        Self {
            source: Box::new(source),
            seen: BTreeMap::new(),
            pending: VecDeque::new(),
            one_shot: false,
            stage: Stage::Fresh,
        }
    }

    /// Ends the stream after the first pass.
    pub fn one_shot(mut self, yes: bool) -> Self {
        self.one_shot = yes;
        self
    }

    /// Enumerates once and diffs against the previous pass. Ends with `Watch`.
    pub async fn pass(&mut self) -> Result<Vec<Collected>, TaskError> {
        let current: BTreeMap<String, Entry> = self
            .source
            .enumerate()
            .await?
            .into_iter()
            .map(|e| (e.path().to_string(), e))
            .collect();

        let mut out: Vec<Collected> = self
            .seen
            .keys()
            .filter(|path| !current.contains_key(*path))
            .map(|path| Collected::Drop { path: path.clone() })
            .collect();
        for (path, entry) in &current {
            if self.seen.get(path) != Some(entry) {
                out.push(entry.clone().into());
            }
        }
        out.push(Collected::Watch);

        self.seen = current;
        Ok(out)
    }

    /// Next step; `None` once a one-shot collector finished its pass.
    pub async fn next(&mut self) -> Result<Option<Collected>, TaskError> {
        loop {
            if let Some(step) = self.pending.pop_front() {
                return Ok(Some(step));
            }
            match self.stage {
                Stage::Done => return Ok(None),
                Stage::Fresh => {}
                Stage::Waiting => self.source.changed().await?,
            }
            let steps = self.pass().await?;
            self.pending.extend(steps);
            self.stage = if self.one_shot {
                Stage::Done
            } else {
                Stage::Waiting
            };
        }
    }

    /// Paths produced by the last pass.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.seen.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::FixedSource;
    use pretty_assertions::assert_eq;

    fn item(name: &str) -> Entry {
        Entry::Task {
            taskdef: "test/sleep".into(),
            path: format!("c/{name}"),
            data: VarMap::new(),
        }
    }

    #[tokio::test]
    async fn unchanged_source_only_watches() {
        let mut c = Collector::new(FixedSource::new(vec![item("a"), item("b"), item("c")]));
        let first = c.pass().await.unwrap();
        assert_eq!(first.len(), 4);
        assert!(matches!(first[0], Collected::Add { .. }));
        assert_eq!(first[3], Collected::Watch);

        assert_eq!(c.pass().await.unwrap(), vec![Collected::Watch]);
        assert_eq!(c.paths().collect::<Vec<_>>(), vec!["c/a", "c/b", "c/c"]);
    }

    #[tokio::test]
    async fn one_shot_stream_ends_after_first_pass() {
        let mut c = Collector::new(FixedSource::new(vec![item("a")])).one_shot(true);
        assert!(matches!(c.next().await.unwrap(), Some(Collected::Add { .. })));
        assert_eq!(c.next().await.unwrap(), Some(Collected::Watch));
        assert_eq!(c.next().await.unwrap(), None);
    }
}
