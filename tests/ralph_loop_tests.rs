// Integration tests for the Ralph worker/reviewer loop using a scripted
// runner in place of real agent processes

#[cfg(test)]
mod ralph_loop_tests {
    use async_trait::async_trait;
    use foreman::error::{ForemanError, Result};
    use foreman::ralph::{
        FinalStatus, IterationRunner, RalphLoopService, RalphStatus, RalphTask, RalphTaskConfig,
        ReviewDecision, WorkerRun,
    };
    use foreman::settings::RalphSettings;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Runner that replays canned worker and reviewer outputs in order.
    struct ScriptedRunner {
        worker_outputs: Mutex<VecDeque<String>>,
        reviewer_outputs: Mutex<VecDeque<String>>,
        worker_calls: Mutex<u32>,
        reviewer_calls: Mutex<u32>,
    }

    impl ScriptedRunner {
        fn new(workers: Vec<&str>, reviewers: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                worker_outputs: Mutex::new(workers.into_iter().map(String::from).collect()),
                reviewer_outputs: Mutex::new(reviewers.into_iter().map(String::from).collect()),
                worker_calls: Mutex::new(0),
                reviewer_calls: Mutex::new(0),
            })
        }

        fn worker_calls(&self) -> u32 {
            *self.worker_calls.lock().unwrap()
        }

        fn reviewer_calls(&self) -> u32 {
            *self.reviewer_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl IterationRunner for ScriptedRunner {
        async fn run_worker(&self, _task: &RalphTask, _prompt: &str) -> Result<WorkerRun> {
            *self.worker_calls.lock().unwrap() += 1;
            let output = self
                .worker_outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "did some work".to_string());
            Ok(WorkerRun {
                output,
                ..Default::default()
            })
        }

        async fn run_reviewer(&self, _task: &RalphTask, _prompt: &str) -> Result<String> {
            *self.reviewer_calls.lock().unwrap() += 1;
            Ok(self
                .reviewer_outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "needs_changes".to_string()))
        }
    }

    fn config(max_turns: u32) -> RalphTaskConfig {
        RalphTaskConfig {
            project_id: "proj-1".to_string(),
            description: "add a health endpoint".to_string(),
            max_turns,
            worker_model: None,
            reviewer_model: None,
            worker_prompt_template: None,
            reviewer_prompt_template: None,
            system_prompt_append: None,
        }
    }

    async fn wait_for_terminal(service: &RalphLoopService, task_id: &str) -> RalphTask {
        for _ in 0..200 {
            if let Some(task) = service.get_task(task_id) {
                if !task.is_active() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not reach a terminal state", task_id);
    }

    #[tokio::test]
    async fn test_approval_ends_loop_after_one_pair() {
        let runner = ScriptedRunner::new(
            vec!["implemented the endpoint"],
            vec![r#"```json
{"decision": "approve", "feedback": "looks good"}
```"#],
        );
        let service = RalphLoopService::new(runner.clone(), RalphSettings::default());
        let task_id = service.start_loop(config(5)).unwrap();

        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.status, RalphStatus::Completed);
        assert_eq!(task.final_status, Some(FinalStatus::Approved));
        assert_eq!(task.summaries.len(), 1);
        assert_eq!(task.feedback.len(), 1);
        assert_eq!(task.feedback[0].decision, ReviewDecision::Approve);
        assert_eq!(runner.worker_calls(), 1);
        assert_eq!(runner.reviewer_calls(), 1);
    }

    #[tokio::test]
    async fn test_max_turns_one_runs_exactly_one_pair() {
        let runner = ScriptedRunner::new(
            vec!["first attempt"],
            vec![r#"{"decision": "needs_changes", "feedback": "missing tests"}"#],
        );
        let service = RalphLoopService::new(runner.clone(), RalphSettings::default());
        let task_id = service.start_loop(config(1)).unwrap();

        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.status, RalphStatus::Completed);
        assert_eq!(task.final_status, Some(FinalStatus::MaxTurnsReached));
        assert_eq!(task.summaries.len(), 1);
        assert_eq!(task.feedback.len(), 1);
        assert_eq!(runner.worker_calls(), 1);
        assert_eq!(runner.reviewer_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_critical_failure() {
        let runner = ScriptedRunner::new(
            vec!["broke the build"],
            vec![r#"{"decision": "reject", "feedback": "fundamentally wrong approach"}"#],
        );
        let service = RalphLoopService::new(runner.clone(), RalphSettings::default());
        let task_id = service.start_loop(config(5)).unwrap();

        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.status, RalphStatus::Failed);
        assert_eq!(task.final_status, Some(FinalStatus::CriticalFailure));
        assert_eq!(task.summaries.len(), 1);
        assert_eq!(runner.worker_calls(), 1);
    }

    #[tokio::test]
    async fn test_needs_changes_feeds_next_iteration() {
        let runner = ScriptedRunner::new(
            vec!["first attempt", "second attempt"],
            vec![
                r#"{"decision": "needs_changes", "feedback": "add error handling"}"#,
                r#"{"decision": "approve", "feedback": "fixed"}"#,
            ],
        );
        let service = RalphLoopService::new(runner.clone(), RalphSettings::default());
        let task_id = service.start_loop(config(5)).unwrap();

        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.final_status, Some(FinalStatus::Approved));
        assert_eq!(task.current_iteration, 2);
        assert_eq!(task.summaries.len(), 2);
        assert_eq!(task.feedback.len(), 2);
        // Histories stay ordered by iteration
        assert_eq!(task.summaries[0].iteration, 1);
        assert_eq!(task.summaries[1].iteration, 2);
    }

    #[tokio::test]
    async fn test_worker_error_fails_task() {
        struct FailingRunner;

        #[async_trait]
        impl IterationRunner for FailingRunner {
            async fn run_worker(&self, _task: &RalphTask, _prompt: &str) -> Result<WorkerRun> {
                Err(anyhow::anyhow!("process exited with code 1").into())
            }

            async fn run_reviewer(&self, _task: &RalphTask, _prompt: &str) -> Result<String> {
                unreachable!("reviewer must not run after a worker failure")
            }
        }

        let service = RalphLoopService::new(Arc::new(FailingRunner), RalphSettings::default());
        let task_id = service.start_loop(config(3)).unwrap();

        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.status, RalphStatus::Failed);
        assert_eq!(task.final_status, Some(FinalStatus::CriticalFailure));
        assert!(task.error.is_some());
    }

    #[tokio::test]
    async fn test_pause_and_resume_reject_wrong_state() {
        let runner = ScriptedRunner::new(
            vec!["implemented"],
            vec![r#"{"decision": "approve", "feedback": "fine"}"#],
        );
        let service = RalphLoopService::new(runner, RalphSettings::default());
        let task_id = service.start_loop(config(5)).unwrap();
        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.status, RalphStatus::Completed);

        // The task exists but is terminal; that is a state error, not a
        // missing task
        let err = service.pause(&task_id).unwrap_err();
        assert!(matches!(err, ForemanError::InvalidTaskState(_)));

        let err = service.resume(&task_id).unwrap_err();
        assert!(matches!(err, ForemanError::InvalidTaskState(_)));

        let err = service.pause("no-such-task").unwrap_err();
        assert!(matches!(err, ForemanError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_loop_applies_settings_prompt_templates() {
        let runner = ScriptedRunner::new(
            vec!["done"],
            vec![r#"{"decision": "approve", "feedback": "ok"}"#],
        );
        let settings = RalphSettings {
            worker_prompt_template: Some("Work on: {task}".to_string()),
            reviewer_prompt_template: Some("Review: {task} {summary}".to_string()),
            ..Default::default()
        };
        let service = RalphLoopService::new(runner, settings);
        let task_id = service.start_loop(config(5)).unwrap();

        let task = service.get_task(&task_id).unwrap();
        assert_eq!(
            task.config.worker_prompt_template.as_deref(),
            Some("Work on: {task}")
        );
        assert_eq!(
            task.config.reviewer_prompt_template.as_deref(),
            Some("Review: {task} {summary}")
        );
        wait_for_terminal(&service, &task_id).await;
    }

    #[tokio::test]
    async fn test_task_history_retention_drops_oldest_inactive() {
        // Scripted outputs exhausted after the first task; the fallback
        // reviewer verdict is needs_changes, so max_turns=1 still terminates
        let runner = ScriptedRunner::new(vec![], vec![]);
        let settings = RalphSettings {
            history_retention: 2,
            ..Default::default()
        };
        let service = RalphLoopService::new(runner, settings);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = service.start_loop(config(1)).unwrap();
            wait_for_terminal(&service, &id).await;
            ids.push(id);
        }

        let tasks = service.tasks_for_project("proj-1");
        assert_eq!(tasks.len(), 2);
        // Newest first, oldest pruned
        assert_eq!(tasks[0].id, ids[2]);
        assert_eq!(tasks[1].id, ids[1]);
        assert!(service.get_task(&ids[0]).is_none());
    }
}
