// Reviewer output parsing: structured first, keyword fallback last

use super::types::ReviewDecision;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ParsedReview {
    decision: String,
    #[serde(default)]
    feedback: String,
}

/// Parse reviewer output into a decision and feedback text.
///
/// Order: a fenced JSON block, then a raw JSON object, then keyword
/// scanning. The keyword fallback defaults to needs-changes whenever the
/// text is ambiguous; it never defaults to approve.
pub fn parse_reviewer_feedback(output: &str) -> (ReviewDecision, String) {
    if let Some(parsed) = parse_fenced_block(output).or_else(|| parse_raw_object(output)) {
        if let Some(decision) = decision_from_str(&parsed.decision) {
            let feedback = if parsed.feedback.is_empty() {
                output.trim().to_string()
            } else {
                parsed.feedback
            };
            return (decision, feedback);
        }
    }
    (keyword_fallback(output), output.trim().to_string())
}

fn parse_fenced_block(output: &str) -> Option<ParsedReview> {
    let mut rest = output;
    let mut last = None;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let body_start = after_fence.find('\n')?;
        let body = &after_fence[body_start + 1..];
        let end = body.find("```")?;
        if let Ok(parsed) = serde_json::from_str::<ParsedReview>(body[..end].trim()) {
            last = Some(parsed);
        }
        rest = &body[end + 3..];
    }
    last
}

fn parse_raw_object(output: &str) -> Option<ParsedReview> {
    // Scan balanced top-level objects; the last one that parses wins
    let bytes = output.as_bytes();
    let mut last = None;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            for (j, &b) in bytes[i..].iter().enumerate() {
                if escaped {
                    escaped = false;
                    continue;
                }
                match b {
                    b'\\' if in_string => escaped = true,
                    b'"' => in_string = !in_string,
                    b'{' if !in_string => depth += 1,
                    b'}' if !in_string => {
                        depth -= 1;
                        if depth == 0 {
                            let candidate = &output[i..=i + j];
                            if let Ok(parsed) = serde_json::from_str::<ParsedReview>(candidate) {
                                last = Some(parsed);
                            }
                            i += j;
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
        i += 1;
    }
    last
}

fn decision_from_str(s: &str) -> Option<ReviewDecision> {
    match s.trim().to_lowercase().as_str() {
        "approve" | "approved" => Some(ReviewDecision::Approve),
        "reject" | "rejected" => Some(ReviewDecision::Reject),
        "needs_changes" | "needs-changes" | "changes" => Some(ReviewDecision::NeedsChanges),
        _ => None,
    }
}

/// Last-resort keyword scan over free text. Mixed or absent signals resolve
/// to needs-changes.
fn keyword_fallback(output: &str) -> ReviewDecision {
    let lower = output.to_lowercase();
    let approved = lower.contains("approved") || lower.contains("lgtm");
    let rejected = lower.contains("rejected") || lower.contains("critical failure");
    match (approved, rejected) {
        (true, false) => ReviewDecision::Approve,
        (false, true) => ReviewDecision::Reject,
        _ => ReviewDecision::NeedsChanges,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block() {
        let output = "Looks solid.\n```json\n{\"decision\":\"approve\",\"feedback\":\"clean\"}\n```\n";
        let (decision, feedback) = parse_reviewer_feedback(output);
        assert_eq!(decision, ReviewDecision::Approve);
        assert_eq!(feedback, "clean");
    }

    #[test]
    fn test_raw_object() {
        let output = r#"Summary first. {"decision":"needs_changes","feedback":"missing tests"}"#;
        let (decision, feedback) = parse_reviewer_feedback(output);
        assert_eq!(decision, ReviewDecision::NeedsChanges);
        assert_eq!(feedback, "missing tests");
    }

    #[test]
    fn test_fenced_preferred_over_raw() {
        let output = "{\"decision\":\"reject\"}\n```json\n{\"decision\":\"approve\",\"feedback\":\"ok\"}\n```";
        let (decision, _) = parse_reviewer_feedback(output);
        assert_eq!(decision, ReviewDecision::Approve);
    }

    #[test]
    fn test_keyword_approved() {
        let (decision, _) = parse_reviewer_feedback("This change is approved, nice work.");
        assert_eq!(decision, ReviewDecision::Approve);
    }

    #[test]
    fn test_keyword_rejected() {
        let (decision, _) = parse_reviewer_feedback("Rejected: the approach is wrong.");
        assert_eq!(decision, ReviewDecision::Reject);
    }

    #[test]
    fn test_mixed_signals_resolve_to_needs_changes() {
        let (decision, _) =
            parse_reviewer_feedback("Not rejected outright, could be approved after fixes.");
        assert_eq!(decision, ReviewDecision::NeedsChanges);
    }

    #[test]
    fn test_unparseable_defaults_to_needs_changes() {
        let (decision, feedback) = parse_reviewer_feedback("I have some thoughts about this.");
        assert_eq!(decision, ReviewDecision::NeedsChanges);
        assert_eq!(feedback, "I have some thoughts about this.");
    }

    #[test]
    fn test_unknown_decision_string_falls_back() {
        let (decision, _) = parse_reviewer_feedback(r#"{"decision":"maybe","feedback":"hmm"}"#);
        assert_eq!(decision, ReviewDecision::NeedsChanges);
    }
}
