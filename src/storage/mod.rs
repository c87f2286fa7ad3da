// Repository contracts consumed by the core, plus in-memory implementations
// Durable backends are supplied by the embedding application

use crate::error::{ForemanError, Result};
use crate::models::{Conversation, ContextUsage, Message, MilestoneRef, Project, ProjectStatus};
use crate::settings::Settings;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn find_by_id(&self, project_id: &str) -> Result<Option<Project>>;
    async fn update_status(&self, project_id: &str, status: ProjectStatus) -> Result<()>;
    async fn set_current_conversation(
        &self,
        project_id: &str,
        conversation_id: Option<String>,
    ) -> Result<()>;
    async fn update_context_usage(&self, project_id: &str, usage: &ContextUsage) -> Result<()>;
    async fn update_next_item(&self, project_id: &str, item: Option<MilestoneRef>) -> Result<()>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(&self, project_id: &str) -> Result<Conversation>;
    async fn find_by_id(&self, conversation_id: &str) -> Result<Option<Conversation>>;
    async fn add_message(&self, conversation_id: &str, message: Message) -> Result<()>;
    async fn update_metadata(&self, conversation_id: &str, metadata: Value) -> Result<()>;
    /// Deleting a conversation that does not exist is not an error.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;
    /// Blocks until all buffered writes reach stable storage.
    async fn flush(&self) -> Result<()>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get(&self) -> Result<Settings>;
}

/// In-memory project repository, used in tests and as a default backend.
pub struct MemoryProjectRepository {
    projects: Mutex<HashMap<String, Project>>,
}

impl MemoryProjectRepository {
    pub fn new() -> Self {
        Self {
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, project: Project) {
        self.projects.lock().await.insert(project.id.clone(), project);
    }

    pub async fn remove(&self, project_id: &str) {
        self.projects.lock().await.remove(project_id);
    }
}

impl Default for MemoryProjectRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectRepository for MemoryProjectRepository {
    async fn find_by_id(&self, project_id: &str) -> Result<Option<Project>> {
        Ok(self.projects.lock().await.get(project_id).cloned())
    }

    async fn update_status(&self, project_id: &str, status: ProjectStatus) -> Result<()> {
        let mut projects = self.projects.lock().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| ForemanError::ProjectNotFound(project_id.to_string()))?;
        project.status = status;
        Ok(())
    }

    async fn set_current_conversation(
        &self,
        project_id: &str,
        conversation_id: Option<String>,
    ) -> Result<()> {
        let mut projects = self.projects.lock().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| ForemanError::ProjectNotFound(project_id.to_string()))?;
        project.current_conversation_id = conversation_id;
        Ok(())
    }

    async fn update_context_usage(&self, project_id: &str, usage: &ContextUsage) -> Result<()> {
        let mut projects = self.projects.lock().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| ForemanError::ProjectNotFound(project_id.to_string()))?;
        project.context_usage = Some(usage.clone());
        Ok(())
    }

    async fn update_next_item(&self, project_id: &str, item: Option<MilestoneRef>) -> Result<()> {
        let mut projects = self.projects.lock().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| ForemanError::ProjectNotFound(project_id.to_string()))?;
        project.next_item = item;
        Ok(())
    }
}

/// In-memory conversation repository.
pub struct MemoryConversationRepository {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl MemoryConversationRepository {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub async fn message_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .lock()
            .await
            .get(conversation_id)
            .map(|c| c.messages.len())
            .unwrap_or(0)
    }

    pub async fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.lock().await.contains_key(conversation_id)
    }
}

impl Default for MemoryConversationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationRepository {
    async fn create(&self, project_id: &str) -> Result<Conversation> {
        let conversation = Conversation::new(project_id);
        self.conversations
            .lock()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn find_by_id(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.lock().await.get(conversation_id).cloned())
    }

    async fn add_message(&self, conversation_id: &str, message: Message) -> Result<()> {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations.get_mut(conversation_id).ok_or_else(|| {
            ForemanError::Storage(format!("Conversation not found: {}", conversation_id))
        })?;
        conversation.messages.push(message);
        Ok(())
    }

    async fn update_metadata(&self, conversation_id: &str, metadata: Value) -> Result<()> {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations.get_mut(conversation_id).ok_or_else(|| {
            ForemanError::Storage(format!("Conversation not found: {}", conversation_id))
        })?;
        conversation.metadata = metadata;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.conversations.lock().await.remove(conversation_id);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Fixed-settings repository.
pub struct MemorySettingsRepository {
    settings: Settings,
}

impl MemorySettingsRepository {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl Default for MemorySettingsRepository {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

#[async_trait]
impl SettingsRepository for MemorySettingsRepository {
    async fn get(&self) -> Result<Settings> {
        Ok(self.settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_project_status_update() {
        let repo = MemoryProjectRepository::new();
        repo.insert(Project::new("p1", "Proj", "/tmp/p1")).await;
        repo.update_status("p1", ProjectStatus::Running).await.unwrap();
        let project = repo.find_by_id("p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Running);
    }

    #[tokio::test]
    async fn test_update_missing_project_fails() {
        let repo = MemoryProjectRepository::new();
        let result = repo.update_status("ghost", ProjectStatus::Idle).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_conversation_lifecycle() {
        let repo = MemoryConversationRepository::new();
        let conv = repo.create("p1").await.unwrap();
        assert!(uuid::Uuid::parse_str(&conv.id).is_ok());
        repo.add_message(&conv.id, Message::user("hi")).await.unwrap();
        assert_eq!(repo.message_count(&conv.id).await, 1);
        repo.delete_conversation(&conv.id).await.unwrap();
        assert!(!repo.contains(&conv.id).await);
    }

    #[tokio::test]
    async fn test_delete_missing_conversation_is_ok() {
        let repo = MemoryConversationRepository::new();
        assert!(repo.delete_conversation("nope").await.is_ok());
    }
}
