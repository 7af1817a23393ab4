//! Modification-marker polling.
//!
//! Admin tooling signals a config change either by rewriting the config file
//! or by touching the reload marker. Each consumer keeps its own
//! [`ChangeWatcher`], so several workers can observe the same marker without
//! racing to delete it.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

#[derive(Debug)]
pub struct ChangeWatcher {
    watched: Vec<(PathBuf, Option<SystemTime>)>,
}

impl ChangeWatcher {
    /// Start watching `paths`; their current state is the baseline.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let watched = paths
            .into_iter()
            .map(|p| {
                let p = p.as_ref().to_path_buf();
                let stamp = modified(&p);
                (p, stamp)
            })
            .collect();
        Self { watched }
    }

    /// `true` if any watched file appeared, disappeared or changed mtime
    /// since the previous call. The new state becomes the baseline.
    pub fn poll_changed(&mut self) -> bool {
        let mut changed = false;
        for (path, last) in &mut self.watched {
            let now = modified(path);
            if now != *last {
                *last = now;
                changed = true;
            }
        }
        changed
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
