//! In-memory progress tree for live polling.
//!
//! One [`LabProgress`] per lab being provisioned, each behind its own lock so
//! that polling one lab never contends with another lab's pipeline. The
//! outer map lock is only taken to find, create or drop an entry.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressStep {
    pub name: String,
    pub status: StepStatus,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressStep {
    fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            message: String::new(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProgress {
    pub service_id: String,
    pub name: String,
    pub service_type: String,
    pub status: StepStatus,
    pub percent: u8,
    pub steps: Vec<ProgressStep>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ServiceProgress {
    fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    fn recompute(&mut self) {
        if self.status == StepStatus::Completed {
            self.percent = 100;
            return;
        }
        if self.status == StepStatus::Failed || self.steps.is_empty() {
            return;
        }
        let computed = percent_of(self.completed_steps(), self.steps.len());
        self.percent = self.percent.max(computed);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabProgress {
    pub lab_id: String,
    pub status: StepStatus,
    pub overall_percent: u8,
    pub current_service: Option<String>,
    pub current_step: Option<String>,
    pub message: String,
    pub services: Vec<ServiceProgress>,
    pub logs: VecDeque<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LabProgress {
    fn new(lab_id: &str) -> Self {
        let now = Utc::now();
        Self {
            lab_id: lab_id.to_string(),
            status: StepStatus::Running,
            overall_percent: 0,
            current_service: None,
            current_step: None,
            message: "Provisioning started".to_string(),
            services: Vec::new(),
            logs: VecDeque::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn service(&self, service_id: &str) -> Option<&ServiceProgress> {
        self.services.iter().find(|s| s.service_id == service_id)
    }

    fn service_mut(&mut self, service_id: &str) -> Option<&mut ServiceProgress> {
        self.services.iter_mut().find(|s| s.service_id == service_id)
    }

    pub fn total_steps(&self) -> usize {
        self.services.iter().map(|s| s.steps.len()).sum()
    }

    pub fn completed_steps(&self) -> usize {
        self.services.iter().map(|s| s.completed_steps()).sum()
    }

    /// Overall percentage never moves backwards while running, is pinned to
    /// 100 on success and frozen once the lab has failed.
    fn recompute(&mut self) {
        for service in &mut self.services {
            service.recompute();
        }
        match self.status {
            StepStatus::Completed => self.overall_percent = 100,
            StepStatus::Failed => {}
            StepStatus::Pending | StepStatus::Running => {
                let computed = percent_of(self.completed_steps(), self.total_steps());
                self.overall_percent = self.overall_percent.max(computed);
            }
        }
        self.updated_at = Utc::now();
    }

    fn push_log(&mut self, line: String, limit: usize) {
        self.logs
            .push_back(format!("[{}] {}", Utc::now().format("%H:%M:%S"), line));
        while self.logs.len() > limit {
            self.logs.pop_front();
        }
    }
}

fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total) as u8
}

pub struct ProgressTracker {
    labs: RwLock<HashMap<String, Arc<RwLock<LabProgress>>>>,
    log_limit: usize,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_LIMIT)
    }
}

impl ProgressTracker {
    pub fn new(log_limit: usize) -> Self {
        Self {
            labs: RwLock::new(HashMap::new()),
            log_limit: log_limit.max(1),
        }
    }

    /// Create (or reset) the entry for `lab_id`.
    pub fn start_lab(&self, lab_id: &str) {
        let mut progress = LabProgress::new(lab_id);
        progress.push_log("Provisioning started".to_string(), self.log_limit);
        self.labs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(lab_id.to_string(), Arc::new(RwLock::new(progress)));
    }

    fn entry(&self, lab_id: &str) -> Option<Arc<RwLock<LabProgress>>> {
        self.labs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(lab_id)
            .cloned()
    }

    /// Apply `f` and recompute percentages under the lab's lock.
    fn update<R>(&self, lab_id: &str, f: impl FnOnce(&mut LabProgress, usize) -> R) -> Option<R> {
        let entry = self.entry(lab_id)?;
        let mut progress = entry.write().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut *progress, self.log_limit);
        progress.recompute();
        Some(result)
    }

    pub fn register_service(
        &self,
        lab_id: &str,
        service_id: &str,
        name: &str,
        service_type: &str,
        steps: &[String],
    ) {
        self.update(lab_id, |progress, _| {
            if progress.service(service_id).is_some() {
                return;
            }
            progress.services.push(ServiceProgress {
                service_id: service_id.to_string(),
                name: name.to_string(),
                service_type: service_type.to_string(),
                status: StepStatus::Pending,
                percent: 0,
                steps: steps.iter().map(ProgressStep::pending).collect(),
                error: None,
                started_at: None,
                completed_at: None,
            });
        });
    }

    pub fn start_service(&self, lab_id: &str, service_id: &str) {
        self.update(lab_id, |progress, limit| {
            let Some(service) = progress.service_mut(service_id) else {
                return;
            };
            service.status = StepStatus::Running;
            service.started_at.get_or_insert_with(Utc::now);
            let name = service.name.clone();
            progress.current_service = Some(name.clone());
            progress.current_step = None;
            progress.message = format!("Setting up {name}");
            progress.push_log(format!("Setting up {name}"), limit);
        });
    }

    /// Record a step transition. Unknown steps are appended to the service's
    /// checklist so that implementations may report more than they declared.
    pub fn update_step(
        &self,
        lab_id: &str,
        service_id: &str,
        step: &str,
        status: StepStatus,
        message: &str,
    ) {
        self.update(lab_id, |progress, limit| {
            let Some(service) = progress.service_mut(service_id) else {
                return;
            };
            if service.status == StepStatus::Pending {
                service.status = StepStatus::Running;
                service.started_at.get_or_insert_with(Utc::now);
            }

            let index = match service.steps.iter().position(|s| s.name == step) {
                Some(index) => index,
                None => {
                    service.steps.push(ProgressStep::pending(step));
                    service.steps.len() - 1
                }
            };
            let entry = &mut service.steps[index];
            // A finished step stays finished
            if entry.status.is_terminal() && !status.is_terminal() {
                return;
            }
            let now = Utc::now();
            entry.status = status;
            entry.message = message.to_string();
            if status == StepStatus::Running {
                entry.started_at.get_or_insert(now);
            }
            if status.is_terminal() {
                entry.started_at.get_or_insert(now);
                entry.completed_at = Some(now);
            }

            let service_name = service.name.clone();
            progress.current_service = Some(service_name.clone());
            progress.current_step = Some(step.to_string());
            if !message.is_empty() {
                progress.message = message.to_string();
            }
            let line = if message.is_empty() {
                format!("{service_name}: {step} {status}")
            } else {
                format!("{service_name}: {step} {status} - {message}")
            };
            progress.push_log(line, limit);
        });
    }

    pub fn complete_service(&self, lab_id: &str, service_id: &str) {
        self.update(lab_id, |progress, limit| {
            let Some(service) = progress.service_mut(service_id) else {
                return;
            };
            let now = Utc::now();
            service.status = StepStatus::Completed;
            service.completed_at = Some(now);
            for step in &mut service.steps {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(now);
                }
            }
            let line = format!("{} ready", service.name);
            progress.push_log(line, limit);
        });
    }

    pub fn fail_service(&self, lab_id: &str, service_id: &str, error: &str) {
        self.update(lab_id, |progress, limit| {
            let Some(service) = progress.service_mut(service_id) else {
                return;
            };
            service.status = StepStatus::Failed;
            service.error = Some(error.to_string());
            service.completed_at = Some(Utc::now());
            if let Some(step) = service
                .steps
                .iter_mut()
                .find(|s| s.status == StepStatus::Running)
            {
                step.status = StepStatus::Failed;
                step.message = error.to_string();
                step.completed_at = Some(Utc::now());
            }
            let line = format!("{} failed: {}", service.name, error);
            progress.push_log(line, limit);
        });
    }

    pub fn complete_lab(&self, lab_id: &str, message: &str) {
        self.update(lab_id, |progress, limit| {
            progress.status = StepStatus::Completed;
            progress.completed_at = Some(Utc::now());
            progress.current_step = None;
            progress.message = message.to_string();
            progress.push_log(message.to_string(), limit);
        });
    }

    pub fn fail_lab(&self, lab_id: &str, message: &str) {
        self.update(lab_id, |progress, limit| {
            progress.status = StepStatus::Failed;
            progress.completed_at = Some(Utc::now());
            progress.message = message.to_string();
            progress.push_log(format!("Provisioning failed: {message}"), limit);
        });
    }

    pub fn log(&self, lab_id: &str, line: impl Into<String>) {
        let line = line.into();
        self.update(lab_id, |progress, limit| progress.push_log(line, limit));
    }

    pub fn get(&self, lab_id: &str) -> Option<LabProgress> {
        let entry = self.entry(lab_id)?;
        let progress = entry.read().unwrap_or_else(PoisonError::into_inner);
        Some(progress.clone())
    }

    pub fn contains(&self, lab_id: &str) -> bool {
        self.entry(lab_id).is_some()
    }

    pub fn remove(&self, lab_id: &str) -> bool {
        self.labs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(lab_id)
            .is_some()
    }

    pub fn lab_ids(&self) -> Vec<String> {
        self.labs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
