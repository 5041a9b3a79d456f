//! Advisory PII detection and redaction.
//!
//! Detection never blocks by default; the orchestrator surfaces findings
//! and only blocks when configured to. Overlapping findings resolve by
//! keyword-anchored specificity: a pattern anchored by a preceding domain
//! keyword ("passport", "DOB") wins over a format-only pattern covering
//! the same range.

use once_cell::sync::Lazy;
use regex::Regex;

/// (kind, keyword-anchored, pattern source). Anchored patterns carry their
/// own domain keyword, so a match is unambiguous even when the digits also
/// fit a format-only pattern.
const PII_TABLE: &[(&str, bool, &str)] = &[
    ("email", false, r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"),
    ("date_of_birth", true, r"(?i)(dob|date\s+of\s+birth|born\s+on)\s*:?\s*\d{1,2}[/\-]\d{1,2}[/\-]\d{2,4}"),
    ("passport", true, r"(?i)passport\s*(number|no|#)?\s*:?\s*[A-Z0-9]{6,9}"),
    ("drivers_license", true, r"(?i)(driver'?s?\s*licen[sc]e\s*(number|no|#)?|DL\s*#|licen[sc]e\s*(number|no|#))\s*:?\s*[A-Z0-9]{5,15}"),
    ("phone_us", false, r"\+?1?[-.\s]?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b"),
    ("ssn", false, r"\b\d{3}[-\s]\d{2}[-\s]\d{4}\b"),
    ("credit_card", false, r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b"),
    ("ip_address", false, r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b"),
];

static COMPILED: Lazy<Vec<(&'static str, bool, Regex)>> = Lazy::new(|| {
    PII_TABLE
        .iter()
        .map(|(kind, anchored, source)| {
            let re = Regex::new(source)
                .unwrap_or_else(|e| panic!("invalid PII pattern {:?}: {}", source, e));
            (*kind, *anchored, re)
        })
        .collect()
});

/// One detected PII range (byte offsets into the input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiFinding {
    pub kind: &'static str,
    pub start: usize,
    pub end: usize,
    /// Whether a domain keyword anchored the match.
    pub anchored: bool,
}

/// Regex-based PII detector. Pure; no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct PiiDetector;

impl PiiDetector {
    pub fn new() -> Self {
        Self
    }

    /// Detect PII ranges. Returned findings are non-overlapping, sorted by
    /// start offset, after specificity resolution.
    pub fn detect(&self, text: &str) -> Vec<PiiFinding> {
        let mut candidates: Vec<PiiFinding> = Vec::new();
        for (kind, anchored, regex) in COMPILED.iter() {
            for m in regex.find_iter(text) {
                candidates.push(PiiFinding {
                    kind,
                    start: m.start(),
                    end: m.end(),
                    anchored: *anchored,
                });
            }
        }

        // Anchored findings first, then earlier and longer ranges; greedy
        // non-overlap acceptance implements the specificity rule.
        candidates.sort_by(|a, b| {
            b.anchored
                .cmp(&a.anchored)
                .then(a.start.cmp(&b.start))
                .then(b.end.cmp(&a.end))
        });

        let mut accepted: Vec<PiiFinding> = Vec::new();
        for candidate in candidates {
            let overlaps = accepted
                .iter()
                .any(|f| candidate.start < f.end && f.start < candidate.end);
            if !overlaps {
                accepted.push(candidate);
            }
        }

        accepted.sort_by_key(|f| f.start);
        accepted
    }

    /// Replace each finding with `[KIND_REDACTED]`.
    pub fn redact(&self, text: &str, findings: &[PiiFinding]) -> String {
        let mut redacted = text.to_string();
        // Replace back-to-front so earlier offsets stay valid.
        let mut ordered: Vec<&PiiFinding> = findings.iter().collect();
        ordered.sort_by_key(|f| std::cmp::Reverse(f.start));
        for finding in ordered {
            let marker = format!("[{}_REDACTED]", finding.kind.to_uppercase());
            redacted.replace_range(finding.start..finding.end, &marker);
        }
        redacted
    }

    /// Distinct kinds present in the findings, in text order.
    pub fn kinds(findings: &[PiiFinding]) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = Vec::new();
        for f in findings {
            if !kinds.contains(&f.kind) {
                kinds.push(f.kind);
            }
        }
        kinds
    }
}
