//! ---
//! ota_section: "14-versioning"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Version metadata and target version ordering."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Ordering for the free-form `custom.version` strings carried by targets.
//!
//! Target versions are not guaranteed to be semver (`"42"`, `"1.10"`,
//! `"2024.03-rc1"` all occur in practice), so the comparison walks both
//! strings byte by byte and compares runs of ASCII digits numerically.
//! `1.9.0` therefore orders before `1.10`, and garbage still yields a total
//! order instead of an error.

use std::cmp::Ordering;
use std::fmt;

/// A target's custom version string with natural ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CustomVersion(String);

impl CustomVersion {
    /// Wrap a raw version string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the raw string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialOrd for CustomVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CustomVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_versions(&self.0, &other.0)
    }
}

/// Compare two version strings with numeric digit runs.
#[must_use]
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let a = left.as_bytes();
    let b = right.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    while i < a.len() && j < b.len() {
        if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            let a_end = digit_run_end(a, i);
            let b_end = digit_run_end(b, j);
            match compare_digit_runs(&a[i..a_end], &b[j..b_end]) {
                Ordering::Equal => {
                    i = a_end;
                    j = b_end;
                }
                other => return other,
            }
            continue;
        }
        match a[i].cmp(&b[j]) {
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
            other => return other,
        }
    }

    (a.len() - i).cmp(&(b.len() - j))
}

fn digit_run_end(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(bytes.len(), |offset| start + offset)
}

fn compare_digit_runs(a: &[u8], b: &[u8]) -> Ordering {
    let a_trimmed = trim_leading_zeros(a);
    let b_trimmed = trim_leading_zeros(b);
    a_trimmed
        .len()
        .cmp(&b_trimmed.len())
        .then_with(|| a_trimmed.cmp(b_trimmed))
        .then_with(|| a.len().cmp(&b.len()))
}

fn trim_leading_zeros(run: &[u8]) -> &[u8] {
    let first = run.iter().position(|b| *b != b'0').unwrap_or(run.len());
    &run[first..]
}
