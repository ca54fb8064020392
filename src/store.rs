//! In-memory authoritative snapshot of every project.
//!
//! Projects are held behind `Arc` and never mutated in place: a change swaps
//! in a new `Arc`, leaving untouched siblings pointer-equal to what readers
//! saw before. `revision` only moves when something actually changed.

use std::sync::Arc;

use crate::project::{Project, ProjectId};

#[derive(Debug, Default, Clone)]
pub struct ProjectStore {
    projects: Vec<Arc<Project>>,
    current: Option<ProjectId>,
    revision: u64,
}

impl ProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_projects(projects: Vec<Project>, current: Option<ProjectId>) -> Self {
        let mut store = Self {
            projects: projects.into_iter().map(Arc::new).collect(),
            current: None,
            revision: 0,
        };
        if let Some(id) = current {
            store.set_current(&id);
        }
        store
    }

    pub fn all(&self) -> &[Arc<Project>] {
        &self.projects
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Project>> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn current(&self) -> Option<&Arc<Project>> {
        self.current.as_deref().and_then(|id| self.get(id))
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Structural replace by id, keeping the project's position. An unknown
    /// id is appended.
    pub fn replace(&mut self, project: Project) {
        let project = Arc::new(project);
        match self.projects.iter().position(|p| p.id == project.id) {
            Some(index) => self.projects[index] = project,
            None => self.projects.push(project),
        }
        self.revision += 1;
    }

    /// Select the current project. An unknown id is ignored and the previous
    /// selection stays in place.
    pub fn set_current(&mut self, id: &str) {
        if self.get(id).is_some() && self.current.as_deref() != Some(id) {
            self.current = Some(id.to_string());
            self.revision += 1;
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Project>> {
        let index = self.projects.iter().position(|p| p.id == id)?;
        let removed = self.projects.remove(index);
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
        self.revision += 1;
        Some(removed)
    }

    /// Swap in a whole new project list. Entries that are pointer-equal to
    /// the current ones keep their identity; nothing is bumped when the list
    /// is unchanged. The current selection survives if its id still exists.
    pub fn replace_all(&mut self, projects: Vec<Arc<Project>>) -> bool {
        let unchanged = projects.len() == self.projects.len()
            && projects
                .iter()
                .zip(&self.projects)
                .all(|(new, old)| Arc::ptr_eq(new, old));
        if unchanged {
            return false;
        }

        self.projects = projects;
        if let Some(id) = self.current.clone() {
            if self.get(&id).is_none() {
                self.current = None;
            }
        }
        self.revision += 1;
        true
    }

    /// Drop everything (sign-out).
    pub fn clear(&mut self) {
        if !self.projects.is_empty() || self.current.is_some() {
            self.projects.clear();
            self.current = None;
            self.revision += 1;
        }
    }
}
