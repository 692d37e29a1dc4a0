//! Template catalog
//!
//! Loads declarative YAML templates from a directory. Flat files register
//! under their declared name; subdirectories carrying a `domain.yaml` form
//! a hierarchical catalog (domain -> project -> task) whose projects alias
//! their template under the `domain/project` path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::parse_duration;
use crate::domain::template::{
    CatalogDomain, CatalogProject, CatalogTask, Commands, Port, Resources, Template, Volume,
};
use crate::error::{Error, Result};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_CPU_LIMIT: &str = "1";
const DEFAULT_MEMORY_LIMIT: &str = "512m";

/// YAML shape of a template file
#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    base_image: String,
    #[serde(default)]
    services: Vec<String>,
    #[serde(default)]
    resources: Resources,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    ttl: Option<String>,
    #[serde(default)]
    expose: Vec<Port>,
    #[serde(default)]
    volumes: Vec<Volume>,
    #[serde(default)]
    commands: Commands,
    #[serde(default)]
    labels: HashMap<String, String>,
}

/// YAML shape of a domain.yaml file
#[derive(Debug, Deserialize)]
struct DomainFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

/// YAML shape of a task file
#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    code: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    difficulty: String,
    #[serde(default)]
    required_level: String,
    #[serde(default)]
    time_limit: i64,
    #[serde(default)]
    skills: Vec<String>,
}

#[derive(Default)]
struct CatalogData {
    templates: HashMap<String, Template>,
    domains: HashMap<String, CatalogDomain>,
    projects: HashMap<String, CatalogProject>,
    tasks: HashMap<String, CatalogTask>,
}

/// Read-mostly template and catalog store
#[derive(Default)]
pub struct TemplateCatalog {
    data: RwLock<CatalogData>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all templates from a directory. Individual bad files are
    /// skipped with a warning; only an unreadable directory is an error.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        info!(dir = %dir.display(), "loading templates");

        let mut loaded = 0usize;
        for path in yaml_files(dir)? {
            // domain.yaml describes a catalog domain, not a template
            if path.file_name().is_some_and(|n| n == "domain.yaml" || n == "domain.yml") {
                continue;
            }
            match self.load_file(&path) {
                Ok(name) => {
                    info!(template = name, file = %path.display(), "template loaded");
                    loaded += 1;
                }
                Err(e) => warn!(file = %path.display(), error = %e, "failed to load template"),
            }
        }
        info!(count = loaded, "templates loaded");

        self.load_catalog(dir);
        Ok(())
    }

    /// Load a single template file; returns the registered name.
    pub fn load_file(&self, path: &Path) -> Result<String> {
        let raw = std::fs::read_to_string(path)?;
        let file: TemplateFile = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Validation(format!("invalid template YAML: {e}")))?;

        let template = into_template(file)?;
        let name = template.name.clone();
        self.add(template);
        Ok(name)
    }

    /// Register a template programmatically
    pub fn add(&self, template: Template) {
        let mut data = self.data.write().expect("catalog lock");
        data.templates.insert(template.name.clone(), template);
    }

    /// Remove a template by name
    pub fn remove(&self, name: &str) {
        let mut data = self.data.write().expect("catalog lock");
        data.templates.remove(name);
    }

    /// Resolve a template by declared name or `domain/project` alias
    pub fn get(&self, name: &str) -> Option<Template> {
        let data = self.data.read().expect("catalog lock");
        data.templates.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Template> {
        let data = self.data.read().expect("catalog lock");
        data.templates.values().cloned().collect()
    }

    // --- Catalog accessors ---

    pub fn domains(&self) -> Vec<CatalogDomain> {
        let data = self.data.read().expect("catalog lock");
        data.domains.values().cloned().collect()
    }

    pub fn domain(&self, id: &str) -> Option<CatalogDomain> {
        let data = self.data.read().expect("catalog lock");
        data.domains.get(id).cloned()
    }

    pub fn projects(&self, domain_id: &str) -> Vec<CatalogProject> {
        let data = self.data.read().expect("catalog lock");
        data.projects
            .values()
            .filter(|p| p.domain_id == domain_id)
            .cloned()
            .collect()
    }

    pub fn project(&self, id: &str) -> Option<CatalogProject> {
        let data = self.data.read().expect("catalog lock");
        data.projects.get(id).cloned()
    }

    pub fn tasks(&self, project_id: &str) -> Vec<CatalogTask> {
        let data = self.data.read().expect("catalog lock");
        data.tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn task(&self, id: &str) -> Option<CatalogTask> {
        let data = self.data.read().expect("catalog lock");
        data.tasks.get(id).cloned()
    }

    // --- Catalog loading ---

    fn load_catalog(&self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to scan catalog directories");
                return;
            }
        };

        for entry in entries.flatten() {
            let domain_dir = entry.path();
            if !domain_dir.is_dir() || !domain_dir.join("domain.yaml").is_file() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.load_domain(&id, &domain_dir) {
                Ok(domain) => {
                    info!(
                        domain = domain.id,
                        projects = domain.projects_count,
                        tasks = domain.tasks_count,
                        "catalog domain loaded"
                    );
                    let mut data = self.data.write().expect("catalog lock");
                    data.domains.insert(domain.id.clone(), domain);
                }
                Err(e) => warn!(domain = id, error = %e, "failed to load domain"),
            }
        }
    }

    fn load_domain(&self, id: &str, dir: &Path) -> Result<CatalogDomain> {
        let raw = std::fs::read_to_string(dir.join("domain.yaml"))?;
        let file: DomainFile = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Validation(format!("invalid domain YAML: {e}")))?;

        let mut domain = CatalogDomain {
            id: id.to_string(),
            name: file.name,
            description: file.description,
            projects_count: 0,
            tasks_count: 0,
        };

        for entry in std::fs::read_dir(dir)?.flatten() {
            let project_dir = entry.path();
            if !project_dir.is_dir() || !project_dir.join("template.yaml").is_file() {
                continue;
            }
            let project_name = entry.file_name().to_string_lossy().to_string();
            match self.load_project(id, &project_name, &project_dir) {
                Ok(project) => {
                    domain.projects_count += 1;
                    domain.tasks_count += project.tasks_count;
                    let mut data = self.data.write().expect("catalog lock");
                    data.projects.insert(project.id.clone(), project);
                }
                Err(e) => {
                    warn!(domain = id, project = project_name, error = %e, "failed to load project")
                }
            }
        }

        Ok(domain)
    }

    fn load_project(&self, domain_id: &str, project_name: &str, dir: &Path) -> Result<CatalogProject> {
        let template_name = self.load_file(&dir.join("template.yaml"))?;
        let project_id = format!("{domain_id}/{project_name}");

        let (name, description) = {
            let mut data = self.data.write().expect("catalog lock");
            let template = data.templates.get(&template_name).cloned();
            match template {
                Some(template) => {
                    // Alias so the template resolves by its catalog path too
                    data.templates.insert(project_id.clone(), template.clone());
                    (template.name, template.description)
                }
                None => (project_name.to_string(), String::new()),
            }
        };

        let mut project = CatalogProject {
            id: project_id.clone(),
            domain_id: domain_id.to_string(),
            name,
            description,
            tasks_count: 0,
        };

        let tasks_dir = dir.join("tasks");
        if tasks_dir.is_dir() {
            project.tasks_count = self.load_tasks(domain_id, &project_id, &tasks_dir);
        }

        Ok(project)
    }

    fn load_tasks(&self, domain_id: &str, project_id: &str, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(project = project_id, error = %e, "failed to read tasks directory");
                return 0;
            }
        };

        let mut count = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !path.is_file() || !is_yaml {
                continue;
            }
            match load_task(domain_id, project_id, &path) {
                Ok(task) => {
                    let mut data = self.data.write().expect("catalog lock");
                    data.tasks.insert(task.id.clone(), task);
                    count += 1;
                }
                Err(e) => warn!(file = %path.display(), error = %e, "failed to load task"),
            }
        }
        count
    }
}

fn into_template(file: TemplateFile) -> Result<Template> {
    if file.name.is_empty() {
        return Err(Error::Validation("template name is required".to_string()));
    }
    if file.base_image.is_empty() {
        return Err(Error::Validation("base_image is required".to_string()));
    }

    let ttl = file
        .ttl
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(DEFAULT_TTL);

    let mut resources = file.resources;
    if resources.cpu_limit.is_empty() {
        resources.cpu_limit = DEFAULT_CPU_LIMIT.to_string();
    }
    if resources.memory_limit.is_empty() {
        resources.memory_limit = DEFAULT_MEMORY_LIMIT.to_string();
    }

    Ok(Template {
        name: file.name,
        description: file.description,
        base_image: file.base_image,
        services: file.services,
        resources,
        env: file.env,
        ttl_seconds: ttl.as_secs(),
        expose: file.expose,
        volumes: file.volumes,
        commands: file.commands,
        labels: file.labels,
    })
}

fn load_task(domain_id: &str, project_id: &str, path: &Path) -> Result<CatalogTask> {
    let raw = std::fs::read_to_string(path)?;
    let file: TaskFile = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Validation(format!("invalid task YAML: {e}")))?;

    if file.title.is_empty() {
        return Err(Error::Validation("task title is required".to_string()));
    }

    // Code falls back to the file name
    let code = if file.code.is_empty() {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    } else {
        file.code
    };

    Ok(CatalogTask {
        id: format!("{project_id}/{code}"),
        code,
        title: file.title,
        description: file.description,
        difficulty: file.difficulty,
        required_level: (!file.required_level.is_empty()).then_some(file.required_level),
        time_limit: file.time_limit,
        skills: file.skills,
        domain_id: domain_id.to_string(),
        project_id: project_id.to_string(),
    })
}

/// Flat and one-level-deep YAML files under `dir`
fn yaml_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_file() && is_yaml(&path) {
            files.push(path);
        } else if path.is_dir() {
            if let Ok(sub) = std::fs::read_dir(&path) {
                for entry in sub.flatten() {
                    let path = entry.path();
                    if path.is_file() && is_yaml(&path) {
                        files.push(path);
                    }
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, contents).expect("write");
    }

    #[test]
    fn load_flat_template_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            "backend-python.yaml",
            r#"
name: backend-python
description: Python backend environment
base_image: python:3.12-slim
services:
  - postgres
  - redis
expose:
  - container: 8000
    name: http
    public: true
"#,
        );

        let catalog = TemplateCatalog::new();
        catalog.load_dir(dir.path()).expect("load");

        let template = catalog.get("backend-python").expect("template");
        assert_eq!(template.base_image, "python:3.12-slim");
        assert_eq!(template.services, vec!["postgres", "redis"]);
        assert_eq!(template.ttl_seconds, 3600);
        assert_eq!(template.resources.cpu_limit, "1");
        assert_eq!(template.resources.memory_limit, "512m");
        assert_eq!(template.expose[0].protocol, "tcp");
        assert!(template.expose[0].public);
    }

    #[test]
    fn ttl_and_resources_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            "big.yaml",
            r#"
name: big
base_image: ubuntu:24.04
ttl: 2h
resources:
  cpu_limit: "4"
  memory_limit: 2g
"#,
        );

        let catalog = TemplateCatalog::new();
        catalog.load_dir(dir.path()).expect("load");

        let template = catalog.get("big").expect("template");
        assert_eq!(template.ttl_seconds, 7200);
        assert_eq!(template.resources.cpu_limit, "4");
        assert_eq!(template.resources.memory_limit, "2g");
    }

    #[test]
    fn invalid_files_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "broken.yaml", ": not yaml [");
        write(dir.path(), "no-image.yaml", "name: incomplete\n");
        write(dir.path(), "ok.yaml", "name: ok\nbase_image: alpine\n");

        let catalog = TemplateCatalog::new();
        catalog.load_dir(dir.path()).expect("load");

        assert_eq!(catalog.list().len(), 1);
        assert!(catalog.get("ok").is_some());
        assert!(catalog.get("incomplete").is_none());
    }

    #[test]
    fn hierarchical_catalog_with_aliases() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            "fintech/domain.yaml",
            "name: Fintech\ndescription: Financial systems\n",
        );
        write(
            dir.path(),
            "fintech/python-trading/template.yaml",
            "name: python-trading-env\ndescription: Trading environment\nbase_image: python:3.12\n",
        );
        write(
            dir.path(),
            "fintech/python-trading/tasks/limit-orders.yaml",
            r#"
title: Implement limit orders
difficulty: medium
required_level: middle
time_limit: 3600
skills: [python, sql]
"#,
        );

        let catalog = TemplateCatalog::new();
        catalog.load_dir(dir.path()).expect("load");

        // Template resolves by its declared name and by its catalog path
        assert!(catalog.get("python-trading-env").is_some());
        assert!(catalog.get("fintech/python-trading").is_some());

        let domains = catalog.domains();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].name, "Fintech");
        assert_eq!(domains[0].projects_count, 1);
        assert_eq!(domains[0].tasks_count, 1);

        let projects = catalog.projects("fintech");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, "fintech/python-trading");

        let tasks = catalog.tasks("fintech/python-trading");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].code, "limit-orders");
        assert_eq!(tasks[0].id, "fintech/python-trading/limit-orders");
        assert_eq!(tasks[0].required_level.as_deref(), Some("middle"));

        assert!(catalog
            .task("fintech/python-trading/limit-orders")
            .is_some());
    }

    #[test]
    fn add_and_remove_programmatically() {
        let catalog = TemplateCatalog::new();
        catalog.add(Template {
            name: "adhoc".to_string(),
            description: String::new(),
            base_image: "alpine".to_string(),
            services: Vec::new(),
            resources: Resources::default(),
            env: HashMap::new(),
            ttl_seconds: 60,
            expose: Vec::new(),
            volumes: Vec::new(),
            commands: Commands::default(),
            labels: HashMap::new(),
        });

        assert!(catalog.get("adhoc").is_some());
        catalog.remove("adhoc");
        assert!(catalog.get("adhoc").is_none());
    }
}
