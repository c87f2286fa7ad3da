// Roadmap document model and markdown parsing
// A roadmap is phases (H2) containing milestones (H3) containing task-list items

use crate::models::MilestoneRef;
use anyhow::{Context, Result};
use async_trait::async_trait;
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ROADMAP_FILE_NAME: &str = "ROADMAP.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapTask {
    pub title: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapMilestone {
    pub id: String,
    pub title: String,
    pub tasks: Vec<RoadmapTask>,
}

impl RoadmapMilestone {
    pub fn pending_tasks(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| !t.completed)
            .map(|t| t.title.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.completed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapPhase {
    pub id: String,
    pub title: String,
    pub milestones: Vec<RoadmapMilestone>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapDoc {
    pub phases: Vec<RoadmapPhase>,
}

impl RoadmapDoc {
    /// First milestone with at least one incomplete task, in document order.
    ///
    /// Milestones with no tasks at all are skipped rather than selected.
    pub fn next_milestone(&self) -> Option<MilestoneRef> {
        for phase in &self.phases {
            for milestone in &phase.milestones {
                let pending = milestone.pending_tasks();
                if !pending.is_empty() {
                    return Some(MilestoneRef {
                        phase_id: phase.id.clone(),
                        phase_title: phase.title.clone(),
                        milestone_id: milestone.id.clone(),
                        milestone_title: milestone.title.clone(),
                        pending_tasks: pending,
                    });
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// Parses roadmap markdown into the document model.
pub trait RoadmapParser: Send + Sync {
    fn parse(&self, markdown: &str) -> Result<RoadmapDoc>;
}

/// Markdown roadmap parser built on pulldown-cmark with task-list support.
#[derive(Debug, Default)]
pub struct MarkdownRoadmapParser;

impl MarkdownRoadmapParser {
    pub fn new() -> Self {
        Self
    }
}

impl RoadmapParser for MarkdownRoadmapParser {
    fn parse(&self, markdown: &str) -> Result<RoadmapDoc> {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TASKLISTS);
        let parser = Parser::new_ext(markdown, options);

        let mut doc = RoadmapDoc::default();
        let mut heading_level: Option<u32> = None;
        let mut heading_text = String::new();
        let mut task_checked: Option<bool> = None;
        let mut task_text = String::new();

        for event in parser {
            match event {
                Event::Start(Tag::Heading { level, .. }) => {
                    heading_level = Some(level as u32);
                    heading_text.clear();
                }
                Event::End(TagEnd::Heading(_)) => {
                    let title = heading_text.trim().to_string();
                    match heading_level.take() {
                        Some(2) => {
                            let id = format!("phase-{}", doc.phases.len() + 1);
                            doc.phases.push(RoadmapPhase {
                                id,
                                title,
                                milestones: Vec::new(),
                            });
                        }
                        Some(3) => {
                            if let Some(phase) = doc.phases.last_mut() {
                                let id = format!(
                                    "{}-milestone-{}",
                                    phase.id,
                                    phase.milestones.len() + 1
                                );
                                phase.milestones.push(RoadmapMilestone {
                                    id,
                                    title,
                                    tasks: Vec::new(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
                Event::TaskListMarker(checked) => {
                    task_checked = Some(checked);
                    task_text.clear();
                }
                Event::End(TagEnd::Item) => {
                    if let Some(checked) = task_checked.take() {
                        let title = task_text.trim().to_string();
                        if !title.is_empty() {
                            if let Some(milestone) = doc
                                .phases
                                .last_mut()
                                .and_then(|p| p.milestones.last_mut())
                            {
                                milestone.tasks.push(RoadmapTask {
                                    title,
                                    completed: checked,
                                });
                            }
                        }
                    }
                    task_text.clear();
                }
                Event::Text(text) | Event::Code(text) => {
                    if heading_level.is_some() {
                        heading_text.push_str(&text);
                    } else if task_checked.is_some() {
                        task_text.push_str(&text);
                    }
                }
                _ => {}
            }
        }

        Ok(doc)
    }
}

/// Loads roadmap documents from stable storage.
#[async_trait]
pub trait RoadmapStore: Send + Sync {
    /// Returns None when the project has no roadmap file.
    async fn load(&self, project_path: &Path) -> Result<Option<RoadmapDoc>>;
}

/// Reads ROADMAP.md from the project root.
pub struct FileRoadmapStore {
    parser: MarkdownRoadmapParser,
}

impl FileRoadmapStore {
    pub fn new() -> Self {
        Self {
            parser: MarkdownRoadmapParser::new(),
        }
    }
}

impl Default for FileRoadmapStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoadmapStore for FileRoadmapStore {
    async fn load(&self, project_path: &Path) -> Result<Option<RoadmapDoc>> {
        let path = project_path.join(ROADMAP_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(self.parser.parse(&content)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Roadmap

## Phase A

### M1
- [x] first task
- [x] second task
- [ ] third task

### M2
- [ ] everything
- [ ] still everything

## Phase B

### M3
- [x] already done
";

    #[test]
    fn test_parse_structure() {
        let doc = MarkdownRoadmapParser::new().parse(SAMPLE).unwrap();
        assert_eq!(doc.phases.len(), 2);
        assert_eq!(doc.phases[0].title, "Phase A");
        assert_eq!(doc.phases[0].milestones.len(), 2);
        assert_eq!(doc.phases[0].milestones[0].tasks.len(), 3);
        assert!(doc.phases[0].milestones[0].tasks[0].completed);
        assert!(!doc.phases[0].milestones[0].tasks[2].completed);
    }

    #[test]
    fn test_next_milestone_prefers_first_incomplete() {
        let doc = MarkdownRoadmapParser::new().parse(SAMPLE).unwrap();
        let next = doc.next_milestone().unwrap();
        assert_eq!(next.milestone_title, "M1");
        assert_eq!(next.phase_title, "Phase A");
        assert_eq!(next.pending_tasks, vec!["third task".to_string()]);
    }

    #[test]
    fn test_fully_complete_roadmap_has_no_next() {
        let md = "## P\n\n### M\n- [x] done\n";
        let doc = MarkdownRoadmapParser::new().parse(md).unwrap();
        assert!(doc.next_milestone().is_none());
    }

    #[test]
    fn test_plain_list_items_are_not_tasks() {
        let md = "## P\n\n### M\n- not a task\n- [ ] real task\n";
        let doc = MarkdownRoadmapParser::new().parse(md).unwrap();
        let tasks = &doc.phases[0].milestones[0].tasks;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "real task");
    }

    #[test]
    fn test_empty_document() {
        let doc = MarkdownRoadmapParser::new().parse("").unwrap();
        assert!(doc.is_empty());
        assert!(doc.next_milestone().is_none());
    }

    #[tokio::test]
    async fn test_file_store_missing_roadmap() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRoadmapStore::new();
        let doc = store.load(dir.path()).await.unwrap();
        assert!(doc.is_none());
    }

    #[tokio::test]
    async fn test_file_store_reads_roadmap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ROADMAP_FILE_NAME), SAMPLE).unwrap();
        let store = FileRoadmapStore::new();
        let doc = store.load(dir.path()).await.unwrap().unwrap();
        assert_eq!(doc.phases.len(), 2);
    }
}
