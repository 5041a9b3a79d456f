//! Layer 1: fast regex/heuristic prompt-injection detection.
//!
//! Patterns follow the OWASP LLM Top 10 injection taxonomy plus common
//! attack vectors observed in production traffic. First match wins and the
//! matched pattern id is opaque to callers; it is recorded in span
//! attributes for triage. No I/O, idempotent.

use once_cell::sync::Lazy;
use regex::Regex;

/// (category, pattern source) in priority order. Earlier entries win.
const PATTERN_TABLE: &[(&str, &str)] = &[
    // Direct instruction override
    ("instruction_override", r"(?i)ignore\s+(all\s+)?(previous|above|prior|your)\s+(instructions?|prompts?|rules?|context|directives?|guidelines?)"),
    ("instruction_override", r"(?i)disregard\s+(all\s+)?(previous|above|prior|your|the)\s+(instructions?|prompts?|rules?|guidelines?|safety)"),
    ("instruction_override", r"(?i)disregard\s+the\s+above\b"),
    ("instruction_override", r"(?i)forget\s+(everything|all|your)\s+(you|instructions?|rules?|were|have)"),
    ("instruction_override", r"(?i)override\s+(your|all|the|any)\s+(safety|security|rules?|restrictions?|protocols?|guidelines?|instructions?)"),
    ("instruction_override", r"(?i)stop\s+following\s+(your|the|all)\s+(guidelines?|rules?|instructions?|restrictions?)"),
    ("instruction_override", r"(?i)previous\s+instructions?\s+(are|is)\s+(void|invalid|null|cancelled|overridden)"),
    ("instruction_override", r"(?i)new\s+(instruction|directive|rule|system\s+prompt)\s*:"),
    // Role manipulation / jailbreaking
    ("role_manipulation", r"(?i)you\s+are\s+now\s+(a|an|the|DAN|operating|in)\b"),
    ("role_manipulation", r"(?i)pretend\s+(you|to\s+be|that)\s+"),
    ("role_manipulation", r"(?i)roleplay\s+(as|like)\s+"),
    ("role_manipulation", r"(?i)from\s+now\s+on\s*,?\s*(you|act|behave|respond|ignore|operate)"),
    ("role_manipulation", r"(?i)(enable|activate|unlock)\s+(developer|admin|unrestricted|jailbreak|debug|god)\s+mode"),
    ("role_manipulation", r"(?i)assume\s+the\s+role\s+of"),
    ("role_manipulation", r"(?i)without\s+(any|ethical|safety|content)\s+(guidelines?|restrictions?|filters?|policy|limitations?)"),
    // System prompt extraction
    ("prompt_extraction", r"(?i)(show|reveal|display|print|output|repeat|echo|tell|give)\s+(me\s+)?(your|the|system|base|original|initial|hidden|secret|complete|full)\s+((system|initial|original|hidden|secret|full|base|complete)\s+)?(prompt|instructions?|rules?|config|configuration|message|directives?)"),
    ("prompt_extraction", r"(?i)what\s+(are|is|were|does)\s+(your|the)\s+(system\s+)?(prompt|instructions?|rules?|initial\s+prompt|base\s+instructions?|configuration)"),
    ("prompt_extraction", r"(?i)repeat\s+(everything|all|the\s+text)\s+(above|before)\s+(this|my)"),
    ("prompt_extraction", r"(?i)what\s+were\s+you\s+told\s+before\s+this"),
    ("prompt_extraction", r"(?i)(hidden|secret)\s+(system\s+)?(prompt|message|instructions?|config)"),
    // Delimiter / template-token attacks
    ("delimiter_attack", r"(?i)\[/?system\]"),
    ("delimiter_attack", r"(?i)<\|?(system|im_start|im_end|endoftext)\|?>"),
    ("delimiter_attack", r"(?i)```\s*(system|admin|root)"),
    ("delimiter_attack", r"(?i)###\s*(system|instruction|admin|end|break)"),
    ("delimiter_attack", r"(?i)\[/?INST\]"),
    ("delimiter_attack", r"(?i)END\s+OF\s+PROMPT"),
    // Encoding / obfuscation evasion
    ("encoding_evasion", r"(?i)(decode|decrypt|deobfuscate|base64|rot13)\s*:?\s+(this|the\s+following|below|[A-Za-z0-9+/=]{6,})"),
    ("encoding_evasion", r"(?i)ign[o0]re\s+(all\s+)?prev[i1]"),
    ("encoding_evasion", r"(?i)d\.i\.?s\.?r\.?e\.?g\.?a\.?r\.?d"),
    ("encoding_evasion", r"(?i)i\.g\.?n\.?o\.?r\.?e"),
    // Payload injection
    ("code_injection", r"(?i)(execute|run|eval|exec)\s+(this|the\s+following)\s+(code|command|script|payload|python|javascript)"),
    ("code_injection", r"(?i)__import__\s*\("),
    ("code_injection", r"(?i)(eval|exec)\s*\("),
    ("code_injection", r"(?i)subprocess\.(run|call|Popen|check_output)"),
    ("code_injection", r"(?i)os\.(system|popen|exec)"),
    // Recursive / nested injection
    ("nested_injection", r"(?i)(translate|summarize|analyze|search\s+for|rephrase)\s+(this|the\s+following)\s*:?\s*.{0,80}(ignore|disregard|forget|reveal|override|bypass)"),
    // Social engineering / authority claims
    ("social_engineering", r"(?i)(I\s+am|I'm|as)\s+(your|a|the|an)\s+(developer|admin|administrator|creator|owner|CEO|manager|root|supervisor)"),
    ("social_engineering", r"(?i)(authorized|admin|root)\s+(access|override|privilege|clearance)"),
    ("social_engineering", r"(?i)for\s+(debugging|compliance|audit|review|testing)\s+purposes?\s*,?\s*(please\s+)?(show|reveal|display|output|give|print)"),
    // Hypothetical bypass attempts
    ("hypothetical_bypass", r"(?i)hypothetically\s*,?\s*(if|what\s+if)\s+you\s+(had|have|were)"),
    ("hypothetical_bypass", r"(?i)if\s+I\s+were\s+(an?\s+)?(admin|developer|root|authorized)"),
    // Suspicious raw-byte content
    ("control_characters", r"[\x00-\x08\x0b\x0c\x0e-\x1f]"),
    ("zero_width_chars", r"[\u{200b}-\u{200f}\u{2028}-\u{202f}\u{feff}]"),
    ("unicode_flooding", r"[^\x00-\x7F]{50,}"),
];

static COMPILED: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    PATTERN_TABLE
        .iter()
        .map(|(category, source)| {
            let re = Regex::new(source)
                .unwrap_or_else(|e| panic!("invalid injection pattern {:?}: {}", source, e));
            (*category, re)
        })
        .collect()
});

/// Longest run of one repeated character that flags a repetition flood.
const REPEATED_CHAR_LIMIT: usize = 20;

/// Number of consecutive identical words that flags a repetition flood.
const REPEATED_WORD_LIMIT: usize = 5;

/// A positive detection: the attack category plus an opaque pattern id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionMatch {
    pub category: &'static str,
    pub pattern_id: String,
}

/// Ordered regex/heuristic injection detector. Target: well under 10ms per
/// query at typical lengths.
#[derive(Debug, Clone, Copy, Default)]
pub struct InjectionDetector;

impl InjectionDetector {
    pub fn new() -> Self {
        Self
    }

    /// Check text for injection patterns. Returns on the first match.
    pub fn detect(&self, text: &str) -> Option<InjectionMatch> {
        for (idx, (category, regex)) in COMPILED.iter().enumerate() {
            if regex.is_match(text) {
                return Some(InjectionMatch {
                    category,
                    pattern_id: format!("{}/{}", category, idx),
                });
            }
        }
        // Repetition floods need backreference-style matching, so they are
        // checked in code rather than the regex table.
        if has_repeated_char_run(text, REPEATED_CHAR_LIMIT) {
            return Some(InjectionMatch {
                category: "repetition_attack",
                pattern_id: "repetition_attack/chars".to_string(),
            });
        }
        if has_repeated_word_run(text, REPEATED_WORD_LIMIT) {
            return Some(InjectionMatch {
                category: "repetition_attack",
                pattern_id: "repetition_attack/words".to_string(),
            });
        }
        None
    }
}

fn has_repeated_char_run(text: &str, limit: usize) -> bool {
    let mut run = 0usize;
    let mut prev: Option<char> = None;
    for ch in text.chars() {
        if Some(ch) == prev {
            run += 1;
            if run >= limit {
                return true;
            }
        } else {
            prev = Some(ch);
            run = 1;
        }
    }
    false
}

fn has_repeated_word_run(text: &str, limit: usize) -> bool {
    let mut run = 0usize;
    let mut prev: Option<&str> = None;
    for word in text.split_whitespace() {
        if Some(word) == prev {
            run += 1;
            if run >= limit {
                return true;
            }
        } else {
            prev = Some(word);
            run = 1;
        }
    }
    false
}
