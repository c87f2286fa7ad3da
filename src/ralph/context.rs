// Prompt construction for worker and reviewer iterations
// Every iteration is rebuilt from accumulated history, never a resumed session

use super::types::{IterationSummary, RalphTaskConfig, ReviewerFeedback};

/// Builds each iteration's prompts from scratch out of the task description
/// and accumulated summaries and feedback.
pub struct ContextInitializer;

impl ContextInitializer {
    /// Prompt for the worker's next iteration.
    pub fn build_worker_prompt(
        config: &RalphTaskConfig,
        summaries: &[IterationSummary],
        feedback: &[ReviewerFeedback],
        iteration: u32,
    ) -> String {
        let history = render_history(summaries, feedback);
        let latest_feedback = feedback
            .last()
            .map(|f| f.feedback.clone())
            .unwrap_or_default();

        if let Some(template) = &config.worker_prompt_template {
            return template
                .replace("{task}", &config.description)
                .replace("{history}", &history)
                .replace("{feedback}", &latest_feedback);
        }

        let mut prompt = format!("# Task\n\n{}\n", config.description);
        if iteration > 1 {
            prompt.push_str(&format!(
                "\n# Iteration {}\n\nPrevious attempts did not fully satisfy the reviewer.\n",
                iteration
            ));
            if !history.is_empty() {
                prompt.push_str(&format!("\n# History\n\n{}\n", history));
            }
            if !latest_feedback.is_empty() {
                prompt.push_str(&format!(
                    "\n# Reviewer feedback to address\n\n{}\n",
                    latest_feedback
                ));
            }
        }
        prompt.push_str("\nWork on the task now. Make the changes directly.\n");
        prompt
    }

    /// Prompt for the reviewer judging one worker run.
    pub fn build_reviewer_prompt(config: &RalphTaskConfig, summary: &IterationSummary) -> String {
        if let Some(template) = &config.reviewer_prompt_template {
            return template
                .replace("{task}", &config.description)
                .replace("{summary}", &summary.output);
        }

        let files = if summary.files_touched.is_empty() {
            "(none reported)".to_string()
        } else {
            summary.files_touched.join("\n- ")
        };
        format!(
            "# Review request\n\n\
             The task was:\n\n{}\n\n\
             The worker (iteration {}) reported:\n\n{}\n\n\
             Files touched:\n- {}\n\n\
             Judge whether the task is done. Respond with a JSON object:\n\
             ```json\n\
             {{\"decision\":\"approve\"|\"reject\"|\"needs_changes\",\"feedback\":\"...\"}}\n\
             ```\n\
             Use reject only for unrecoverable approaches. Use needs_changes\n\
             when another worker pass could fix the problems.",
            config.description, summary.iteration, summary.output, files
        )
    }
}

fn render_history(summaries: &[IterationSummary], feedback: &[ReviewerFeedback]) -> String {
    let mut sections = Vec::new();
    for summary in summaries {
        let mut section = format!(
            "## Iteration {} (worker)\n{}",
            summary.iteration,
            truncate(&summary.output, 2000)
        );
        if let Some(entry) = feedback.iter().find(|f| f.iteration == summary.iteration) {
            section.push_str(&format!(
                "\n\n## Iteration {} (reviewer: {:?})\n{}",
                entry.iteration,
                entry.decision,
                truncate(&entry.feedback, 1000)
            ));
        }
        sections.push(section);
    }
    sections.join("\n\n")
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    // Cut at a char boundary at or below max
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ralph::types::ReviewDecision;
    use chrono::Utc;

    fn config() -> RalphTaskConfig {
        RalphTaskConfig {
            project_id: "p1".to_string(),
            description: "implement the widget".to_string(),
            max_turns: 3,
            worker_model: None,
            reviewer_model: None,
            worker_prompt_template: None,
            reviewer_prompt_template: None,
            system_prompt_append: None,
        }
    }

    fn summary(iteration: u32) -> IterationSummary {
        IterationSummary {
            iteration,
            output: format!("did work in iteration {}", iteration),
            files_touched: vec!["src/widget.rs".to_string()],
            tokens_used: 100,
            duration_ms: 1000,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_first_iteration_has_no_history() {
        let prompt = ContextInitializer::build_worker_prompt(&config(), &[], &[], 1);
        assert!(prompt.contains("implement the widget"));
        assert!(!prompt.contains("# History"));
    }

    #[test]
    fn test_later_iteration_includes_feedback() {
        let feedback = vec![ReviewerFeedback {
            iteration: 1,
            decision: ReviewDecision::NeedsChanges,
            feedback: "handle the empty case".to_string(),
            timestamp: Utc::now(),
        }];
        let prompt =
            ContextInitializer::build_worker_prompt(&config(), &[summary(1)], &feedback, 2);
        assert!(prompt.contains("did work in iteration 1"));
        assert!(prompt.contains("handle the empty case"));
    }

    #[test]
    fn test_worker_template_substitution() {
        let mut config = config();
        config.worker_prompt_template = Some("TASK: {task} | FB: {feedback}".to_string());
        let feedback = vec![ReviewerFeedback {
            iteration: 1,
            decision: ReviewDecision::NeedsChanges,
            feedback: "more tests".to_string(),
            timestamp: Utc::now(),
        }];
        let prompt = ContextInitializer::build_worker_prompt(&config, &[], &feedback, 2);
        assert_eq!(prompt, "TASK: implement the widget | FB: more tests");
    }

    #[test]
    fn test_reviewer_prompt_mentions_output_and_files() {
        let prompt = ContextInitializer::build_reviewer_prompt(&config(), &summary(1));
        assert!(prompt.contains("did work in iteration 1"));
        assert!(prompt.contains("src/widget.rs"));
        assert!(prompt.contains("needs_changes"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "aé".repeat(10);
        let cut = truncate(&text, 3);
        assert!(cut.len() <= 3);
        assert!(text.starts_with(cut));
    }
}
