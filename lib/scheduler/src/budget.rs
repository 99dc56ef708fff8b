//! Concurrency budgets.
//!
//! Three ceilings gate every execution: the agent's own `max_concurrency`,
//! its resource class, and the process-wide total. The agent ceiling is a
//! plain counter inside the agent's ledger; the shared ceilings are
//! semaphores whose permits live as long as the execution does.

use crate::config::SchedulerSettings;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use trendline_pipeline::ResourceClass;

/// Per-agent running counter. Never exceeds its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    ceiling: u32,
    in_use: u32,
}

impl ResourceBudget {
    #[must_use]
    pub fn new(ceiling: u32) -> Self {
        Self { ceiling, in_use: 0 }
    }

    /// Takes a slot if one is free.
    pub fn try_acquire(&mut self) -> bool {
        if self.in_use >= self.ceiling {
            return false;
        }
        self.in_use += 1;
        true
    }

    pub fn release(&mut self) {
        self.in_use = self.in_use.saturating_sub(1);
    }

    #[must_use]
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    #[must_use]
    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    #[must_use]
    pub fn available(&self) -> u32 {
        self.ceiling.saturating_sub(self.in_use)
    }

    /// Applies a reloaded ceiling. Runs already holding slots keep them; a
    /// lowered ceiling just admits nothing new until usage drops below it.
    pub fn set_ceiling(&mut self, ceiling: u32) {
        self.ceiling = ceiling;
    }
}

/// Permits for the shared ceilings, released on drop.
#[derive(Debug)]
pub struct PoolPermits {
    _global: OwnedSemaphorePermit,
    _class: OwnedSemaphorePermit,
}

/// Process-wide and per-class ceilings shared by all agents.
#[derive(Debug, Clone)]
pub struct ResourcePools {
    global: Arc<Semaphore>,
    light: Arc<Semaphore>,
    standard: Arc<Semaphore>,
    heavy: Arc<Semaphore>,
}

impl ResourcePools {
    #[must_use]
    pub fn new(settings: &SchedulerSettings) -> Self {
        let classes = &settings.resource_classes;
        Self {
            global: Arc::new(Semaphore::new(settings.max_running_total)),
            light: Arc::new(Semaphore::new(classes.light)),
            standard: Arc::new(Semaphore::new(classes.standard)),
            heavy: Arc::new(Semaphore::new(classes.heavy)),
        }
    }

    fn class(&self, class: ResourceClass) -> &Arc<Semaphore> {
        match class {
            ResourceClass::Light => &self.light,
            ResourceClass::Standard => &self.standard,
            ResourceClass::Heavy => &self.heavy,
        }
    }

    /// Reserves one class slot and one global slot, or neither.
    #[must_use]
    pub fn try_reserve(&self, class: ResourceClass) -> Option<PoolPermits> {
        let class_permit = Arc::clone(self.class(class)).try_acquire_owned().ok()?;
        let global_permit = Arc::clone(&self.global).try_acquire_owned().ok()?;
        Some(PoolPermits {
            _global: global_permit,
            _class: class_permit,
        })
    }

    #[must_use]
    pub fn available(&self, class: ResourceClass) -> usize {
        self.class(class)
            .available_permits()
            .min(self.global.available_permits())
    }
}
