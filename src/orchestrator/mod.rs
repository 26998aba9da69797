//! Sequential feature-queue orchestrator.
//!
//! One feature at a time, strictly FIFO: assess risk, inject context,
//! dispatch to the collaborator, record the outcome, then run the impact and
//! context engines as their triggers fire. The loop is owned by
//! [`runner::QueueRunner`]; [`QueueHandle`] is the thread-safe control
//! surface handed to signal handlers and embedders.

pub mod runner;

pub use runner::{QueueRunner, RunReport};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Shared control handle over a running queue.
///
/// Cloning is cheap; all clones steer the same run.
#[derive(Clone)]
pub struct QueueHandle {
    paused: Arc<AtomicBool>,
    iteration: Arc<AtomicU32>,
    max_iterations: u32,
}

impl QueueHandle {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            iteration: Arc::new(AtomicU32::new(0)),
            max_iterations,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Request a stop by exhausting the iteration budget. The loop finishes
    /// its current feature and exits at the next top-of-loop check.
    pub fn stop(&self) {
        self.iteration.store(self.max_iterations, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::SeqCst)
    }

    pub(crate) fn next_iteration(&self) -> Option<u32> {
        let current = self.iteration.load(Ordering::SeqCst);
        if current >= self.max_iterations {
            return None;
        }
        Some(self.iteration.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
