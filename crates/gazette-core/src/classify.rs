//! Deterministic failure classification for the retry policy.
//!
//! Raw agent output frequently carries several overlapping failure signals,
//! so classification is an ordered, first-match-wins pass over a fixed rule
//! list. The order below is part of the contract — reordering it changes
//! observed retry behavior:
//!
//! 1. `model_not_available`  (drift/unsupported/unknown-model text)
//! 2. `timeout_or_probe`     (deadline exceeded, or probe-timeout text)
//! 3. `access_or_auth`       (auth signatures; never counts toward drift)
//! 4. `billing_or_quota`     (quota/rate-limit signatures; never counts)
//! 5. `output_invalid`       (validator rejection)
//! 6. `other_failure`        (fallback)

use crate::task::FailureClass;

const MODEL_NOT_AVAILABLE_PATTERNS: &[&str] = &[
    "model not found",
    "unknown model",
    "unsupported model",
    "invalid model",
    "model is not available",
    "model has been deprecated",
    "not available in your region",
];

const TIMEOUT_PATTERNS: &[&str] = &["deadline exceeded", "probe timed out"];

const ACCESS_OR_AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "permission denied",
    "invalid api key",
    "authentication",
    "auth",
    "restricted token",
];

const BILLING_OR_QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "resource_exhausted",
    "insufficient credit",
    "billing",
    "payment",
    "usage limit",
    "rate limit",
    "too many requests",
    "429",
];

/// Everything the classifier is allowed to look at. Built once per failed
/// attempt; classification is a pure function of this value.
#[derive(Debug, Clone)]
pub struct FailureEvidence {
    /// Lowercased `stderr` then `stdout`, newline-joined.
    pub haystack: String,
    pub exit_code: i32,
    /// Wall time reached the per-attempt budget.
    pub timed_out: bool,
    /// The output validator rejected the result file.
    pub output_invalid: bool,
}

impl FailureEvidence {
    pub fn new(
        stdout: &str,
        stderr: &str,
        exit_code: i32,
        timed_out: bool,
        output_invalid: bool,
    ) -> Self {
        Self {
            haystack: format!("{stderr}\n{stdout}").to_lowercase(),
            exit_code,
            timed_out,
            output_invalid,
        }
    }
}

/// Classifier verdict with the rule and pattern that fired, recorded in the
/// task's event detail for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: FailureClass,
    pub matched_rule: &'static str,
    pub matched_pattern: Option<&'static str>,
}

type Rule = (
    FailureClass,
    &'static str,
    fn(&FailureEvidence) -> Option<Option<&'static str>>,
);

fn first_pattern(
    haystack: &str,
    patterns: &'static [&'static str],
) -> Option<Option<&'static str>> {
    patterns
        .iter()
        .find(|p| haystack.contains(**p))
        .map(|p| Some(*p))
}

/// The fixed priority list. Evaluated top to bottom; the first rule whose
/// predicate fires decides the class.
const RULES: &[Rule] = &[
    (
        FailureClass::ModelNotAvailable,
        "model_not_available",
        |ev| first_pattern(&ev.haystack, MODEL_NOT_AVAILABLE_PATTERNS),
    ),
    (FailureClass::TimeoutOrProbe, "timeout_or_probe", |ev| {
        if ev.timed_out {
            Some(None)
        } else {
            first_pattern(&ev.haystack, TIMEOUT_PATTERNS)
        }
    }),
    (FailureClass::AccessOrAuth, "access_or_auth", |ev| {
        first_pattern(&ev.haystack, ACCESS_OR_AUTH_PATTERNS)
    }),
    (FailureClass::BillingOrQuota, "billing_or_quota", |ev| {
        first_pattern(&ev.haystack, BILLING_OR_QUOTA_PATTERNS)
    }),
    (FailureClass::OutputInvalid, "output_invalid", |ev| {
        if ev.output_invalid { Some(None) } else { None }
    }),
];

/// Classify a failed attempt. Identical evidence always yields an identical
/// class; anything no rule claims lands in `other_failure`.
pub fn classify(evidence: &FailureEvidence) -> Classification {
    for (class, rule, predicate) in RULES {
        if let Some(matched_pattern) = predicate(evidence) {
            return Classification {
                class: *class,
                matched_rule: rule,
                matched_pattern,
            };
        }
    }
    Classification {
        class: FailureClass::OtherFailure,
        matched_rule: "fallback",
        matched_pattern: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(stdout: &str, stderr: &str) -> FailureEvidence {
        FailureEvidence::new(stdout, stderr, 1, false, false)
    }

    #[test]
    fn model_not_available_from_text() {
        let c = classify(&evidence("", "Error: Unknown model 'nova-9'"));
        assert_eq!(c.class, FailureClass::ModelNotAvailable);
        assert_eq!(c.matched_pattern, Some("unknown model"));
    }

    #[test]
    fn timeout_flag_wins_over_auth_text() {
        // Order is the contract: timeout is checked before auth.
        let c = classify(&FailureEvidence::new(
            "",
            "authentication failed while waiting",
            -1,
            true,
            false,
        ));
        assert_eq!(c.class, FailureClass::TimeoutOrProbe);
    }

    #[test]
    fn model_text_wins_over_timeout_flag() {
        let c = classify(&FailureEvidence::new(
            "",
            "model not found: gazette-1",
            -1,
            true,
            false,
        ));
        assert_eq!(c.class, FailureClass::ModelNotAvailable);
    }

    #[test]
    fn auth_wins_over_quota_text() {
        let c = classify(&evidence("", "permission denied: quota check skipped"));
        assert_eq!(c.class, FailureClass::AccessOrAuth);
        assert_eq!(c.matched_pattern, Some("permission denied"));
    }

    #[test]
    fn quota_signatures() {
        for text in ["HTTP 429", "rate limit reached", "monthly usage limit"] {
            let c = classify(&evidence("", text));
            assert_eq!(c.class, FailureClass::BillingOrQuota, "text: {text}");
        }
    }

    #[test]
    fn output_invalid_when_flagged() {
        let c = classify(&FailureEvidence::new("done", "", 0, false, true));
        assert_eq!(c.class, FailureClass::OutputInvalid);
        assert_eq!(c.matched_rule, "output_invalid");
    }

    #[test]
    fn fallback_is_other_failure() {
        let c = classify(&evidence("something odd happened", ""));
        assert_eq!(c.class, FailureClass::OtherFailure);
        assert_eq!(c.matched_rule, "fallback");
        assert_eq!(c.matched_pattern, None);
    }

    #[test]
    fn classification_is_deterministic() {
        let ev = FailureEvidence::new("out", "unauthorized and rate limit", 2, false, false);
        let first = classify(&ev);
        for _ in 0..10 {
            assert_eq!(classify(&ev), first);
        }
        assert_eq!(first.class, FailureClass::AccessOrAuth);
    }
}
