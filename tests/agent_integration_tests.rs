// End-to-end tests running real subprocesses through a stub agent binary
// that speaks the NDJSON stream protocol

#![cfg(unix)]

#[cfg(test)]
mod agent_integration_tests {
    use foreman::agent::{AgentEvent, AgentLaunchSpec, ProcessAgent};
    use foreman::manager::{AgentManager, ManagerEvent, StartAgentOptions, StartOutcome};
    use foreman::models::{PermissionMode, Project, ProjectStatus};
    use foreman::queue::AgentQueue;
    use foreman::session::SessionManager;
    use foreman::settings::Settings;
    use foreman::storage::{
        MemoryConversationRepository, MemoryProjectRepository, MemorySettingsRepository,
        ProjectRepository,
    };
    use foreman::tracker::ProcessTracker;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const STUB_SCRIPT: &str = r#"#!/bin/sh
printf '%s\n' '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hello from agent"}],"usage":{"input_tokens":10,"output_tokens":5}}}'
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"ready"}'
while read -r line; do
  printf '%s\n' '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"echo reply"}]}}'
  printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"done"}'
done
"#;

    const PLAN_STUB_SCRIPT: &str = r#"#!/bin/sh
printf '%s\n' '{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"tu_1","name":"ExitPlanMode","input":{"plan":"1. add the endpoint"}}]}}'
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"plan ready"}'
while read -r line; do
  printf '%s\n' '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"working"}]}}'
  printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"done"}'
done
"#;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn write_script(dir: &std::path::Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn write_stub(dir: &std::path::Path) -> PathBuf {
        write_script(dir, "stub-agent.sh", STUB_SCRIPT)
    }

    async fn recv_or_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_process_agent_streams_and_exits_on_input_close() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path());

        let mut spec = AgentLaunchSpec::new("proj-1", dir.path());
        spec.agent_binary = Some(stub);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = ProcessAgent::new(spec, tx);

        let pid = agent.start(Some("hi there")).await.unwrap();
        assert!(pid > 0);

        let mut saw_hello = false;
        let mut saw_usage = false;
        let mut exit_code = None;
        let mut closed = false;
        loop {
            match recv_or_timeout(&mut rx).await {
                AgentEvent::Message { content, .. } if content == "hello from agent" => {
                    saw_hello = true;
                }
                AgentEvent::Usage { usage, .. } => {
                    assert_eq!(usage.input_tokens, 10);
                    assert_eq!(usage.output_tokens, 5);
                    saw_usage = true;
                }
                AgentEvent::WaitingForInput { waiting: true, .. } if !closed => {
                    // Agent idle; closing stdin ends the run
                    agent.close_input().await;
                    closed = true;
                }
                AgentEvent::Exit { exit_code: code, .. } => {
                    exit_code = Some(code);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_hello);
        assert!(saw_usage);
        assert_eq!(exit_code, Some(Some(0)));
        assert!(!agent.collected_output().is_empty());
    }

    #[tokio::test]
    async fn test_manager_caps_queues_and_promotes() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path());

        let projects = Arc::new(MemoryProjectRepository::new());
        projects
            .insert(Project::new("proj-a", "A", dir.path().to_string_lossy()))
            .await;
        projects
            .insert(Project::new("proj-b", "B", dir.path().to_string_lossy()))
            .await;
        let conversations = Arc::new(MemoryConversationRepository::new());

        let settings = Settings {
            max_concurrent_agents: 1,
            agent_binary: Some(stub),
            ..Default::default()
        };
        let settings_repo = Arc::new(MemorySettingsRepository::new(settings));
        let sessions = Arc::new(SessionManager::new(projects.clone(), conversations.clone()));
        let queue = Arc::new(AgentQueue::new());
        let tracker = Arc::new(ProcessTracker::new(&dir.path().join("state")).unwrap());

        let manager = AgentManager::new(
            projects.clone(),
            conversations.clone(),
            settings_repo,
            sessions,
            queue.clone(),
            tracker,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.set_event_sender(tx);

        let outcome = manager
            .start_agent(
                "proj-a",
                StartAgentOptions {
                    instructions: Some("start working".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Started(_)));

        // Second start for the same project is rejected outright
        assert!(manager
            .start_agent("proj-a", StartAgentOptions::default())
            .await
            .is_err());

        // A different project goes to the queue once the cap is reached
        let outcome = manager
            .start_agent("proj-b", StartAgentOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::Queued);
        assert!(queue.is_queued("proj-b"));

        // Wait until proj-a's agent is idle so input has somewhere to go
        loop {
            if let ManagerEvent::WaitingForInput(p) = recv_or_timeout(&mut rx).await {
                if p.project_id == "proj-a" && p.waiting {
                    break;
                }
            }
        }
        manager.send_input("proj-a", "keep going").await.unwrap();

        // Stopping proj-a frees the slot; proj-b must be promoted
        assert!(manager.stop_agent("proj-a").await.unwrap());
        loop {
            if let ManagerEvent::AgentExit(p) = recv_or_timeout(&mut rx).await {
                if p.project_id == "proj-a" {
                    break;
                }
            }
        }
        for _ in 0..200 {
            if manager.is_agent_running("proj-b") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.is_agent_running("proj-b"));
        assert!(!queue.is_queued("proj-b"));

        // Conversation history captured both sides of the exchange
        let project = projects.find_by_id("proj-a").await.unwrap().unwrap();
        let conversation_id = project.current_conversation_id.unwrap();
        assert!(conversations.message_count(&conversation_id).await >= 2);

        let result = manager.shutdown().await.unwrap();
        assert!(result.is_clean());
        assert!(result.agents_stopped >= 1);
        assert!(!manager.is_agent_running("proj-b"));
    }

    #[tokio::test]
    async fn test_queue_promotion_skips_unstartable_entry() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path());

        let projects = Arc::new(MemoryProjectRepository::new());
        for id in ["proj-a", "proj-b", "proj-c"] {
            projects
                .insert(Project::new(id, id, dir.path().to_string_lossy()))
                .await;
        }
        let conversations = Arc::new(MemoryConversationRepository::new());
        let settings = Settings {
            max_concurrent_agents: 1,
            agent_binary: Some(stub),
            ..Default::default()
        };
        let settings_repo = Arc::new(MemorySettingsRepository::new(settings));
        let sessions = Arc::new(SessionManager::new(projects.clone(), conversations.clone()));
        let queue = Arc::new(AgentQueue::new());
        let tracker = Arc::new(ProcessTracker::new(&dir.path().join("state")).unwrap());
        let manager = AgentManager::new(
            projects.clone(),
            conversations,
            settings_repo,
            sessions,
            queue.clone(),
            tracker,
        );

        let outcome = manager
            .start_agent("proj-a", StartAgentOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Started(_)));
        assert_eq!(
            manager
                .start_agent("proj-b", StartAgentOptions::default())
                .await
                .unwrap(),
            StartOutcome::Queued
        );
        assert_eq!(
            manager
                .start_agent("proj-c", StartAgentOptions::default())
                .await
                .unwrap(),
            StartOutcome::Queued
        );

        // proj-b's record disappears before its turn comes up, so its
        // promotion fails; the head of the queue must not block proj-c
        projects.remove("proj-b").await;

        assert!(manager.stop_agent("proj-a").await.unwrap());
        for _ in 0..200 {
            if manager.is_agent_running("proj-c") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.is_agent_running("proj-c"));
        assert!(!queue.is_queued("proj-b"));
        assert!(!queue.is_queued("proj-c"));

        let result = manager.shutdown().await.unwrap();
        assert!(result.is_clean());
    }

    #[tokio::test]
    async fn test_plan_approval_restart_keeps_replacement_status() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let stub = write_script(dir.path(), "plan-agent.sh", PLAN_STUB_SCRIPT);

        let projects = Arc::new(MemoryProjectRepository::new());
        projects
            .insert(Project::new("proj-a", "A", dir.path().to_string_lossy()))
            .await;
        let conversations = Arc::new(MemoryConversationRepository::new());
        let settings = Settings {
            max_concurrent_agents: 1,
            agent_binary: Some(stub),
            ..Default::default()
        };
        let settings_repo = Arc::new(MemorySettingsRepository::new(settings));
        let sessions = Arc::new(SessionManager::new(projects.clone(), conversations.clone()));
        let queue = Arc::new(AgentQueue::new());
        let tracker = Arc::new(ProcessTracker::new(&dir.path().join("state")).unwrap());
        let manager = AgentManager::new(
            projects.clone(),
            conversations,
            settings_repo,
            sessions,
            queue,
            tracker,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.set_event_sender(tx);

        manager
            .start_agent(
                "proj-a",
                StartAgentOptions {
                    instructions: Some("plan the work".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Wait for the proposed plan to surface
        loop {
            if let ManagerEvent::WaitingForInput(p) = recv_or_timeout(&mut rx).await {
                if p.project_id == "proj-a" && p.waiting && p.plan.is_some() {
                    break;
                }
            }
        }

        // Approval tears down the planning instance and starts an
        // auto-accepting replacement under the same slot
        manager.send_input("proj-a", "yes").await.unwrap();
        let mut replaced = false;
        for _ in 0..200 {
            if let Some(agent) = manager.agent_for("proj-a") {
                if agent.spec().permission_mode == PermissionMode::AcceptEdits {
                    replaced = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(replaced);

        // Straggling events from the torn-down instance must not overwrite
        // the replacement's status
        tokio::time::sleep(Duration::from_millis(200)).await;
        let project = projects.find_by_id("proj-a").await.unwrap().unwrap();
        assert_ne!(project.status, ProjectStatus::Idle);
        assert_ne!(project.status, ProjectStatus::Error);

        let result = manager.shutdown().await.unwrap();
        assert!(result.is_clean());
    }

    #[tokio::test]
    async fn test_oneoff_agent_runs_outside_slots() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path());

        let projects = Arc::new(MemoryProjectRepository::new());
        let conversations = Arc::new(MemoryConversationRepository::new());
        let settings = Settings {
            max_concurrent_agents: 1,
            agent_binary: Some(stub),
            ..Default::default()
        };
        let settings_repo = Arc::new(MemorySettingsRepository::new(settings));
        let sessions = Arc::new(SessionManager::new(projects.clone(), conversations.clone()));
        let queue = Arc::new(AgentQueue::new());
        let tracker = Arc::new(ProcessTracker::new(&dir.path().join("state")).unwrap());
        let manager = AgentManager::new(
            projects,
            conversations,
            settings_repo,
            sessions,
            queue,
            tracker,
        );

        let id = manager
            .run_oneoff(dir.path(), "optimize the images")
            .await
            .unwrap();
        assert!(id.starts_with("oneoff:"));
        // One-off agents never occupy a project slot
        assert_eq!(manager.running_agent_count(), 0);

        let result = manager.shutdown().await.unwrap();
        assert!(result.is_clean());
    }
}
