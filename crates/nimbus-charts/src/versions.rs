//! Chart version selection
//!
//! Tags are bucketed into version classes and the best non-empty class
//! wins: releases over prereleases over milestones over snapshots over
//! PR snapshots. Within a class the sort is plain lexicographic;
//! callers may only rely on getting *some* tag from the best class.

use crate::error::{ChartError, Result};
use regex::Regex;

const RELEASE: &str = r"^\d+\.\d+\.\d+$";
const PRERELEASE: &str = r"-[0-9a-f]{7}$";
const MILESTONE: &str = r"-M\d+$";
const PR_SNAPSHOT: &str = r"-PR\d{3,4}-SNAPSHOT$";
const SNAPSHOT: &str = r"-SNAPSHOT$";

/// Classification order: a PR snapshot must be claimed before the plain
/// snapshot pattern would swallow it.
const CLASSIFY_ORDER: &[&str] = &[RELEASE, PRERELEASE, MILESTONE, PR_SNAPSHOT, SNAPSHOT];

/// Selection preference between non-empty classes.
const PREFERENCE: &[&str] = &[RELEASE, PRERELEASE, MILESTONE, SNAPSHOT, PR_SNAPSHOT];

/// Pick a chart version out of a raw tag list.
pub fn select_version(tags: &[String], repo: &str) -> Result<String> {
    let patterns: Vec<(usize, Regex)> = CLASSIFY_ORDER
        .iter()
        .map(|p| Regex::new(p).expect("static version pattern"))
        .enumerate()
        .collect();

    let mut buckets: Vec<Vec<&String>> = vec![Vec::new(); CLASSIFY_ORDER.len()];
    for tag in tags {
        for (i, pattern) in &patterns {
            if pattern.is_match(tag) {
                buckets[*i].push(tag);
                break;
            }
        }
    }

    for preferred in PREFERENCE {
        let index = CLASSIFY_ORDER
            .iter()
            .position(|p| p == preferred)
            .expect("preference lists the same classes");
        if !buckets[index].is_empty() {
            let mut candidates = buckets[index].clone();
            candidates.sort();
            return Ok(candidates[0].clone());
        }
    }
    Err(ChartError::NoVersion {
        repo: repo.to_string(),
    })
}
