//! Periodic job scheduler.
//!
//! All jobs run once at start. After that the scheduler sleeps until the
//! soonest remaining deadline, subtracts the time actually slept from every
//! job, and runs the jobs that reached zero, resetting them to their interval.
//! There is one wake-up per due deadline, not one timer per job.

use std::fmt::Display;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::queue::StopSignal;

pub type Task<E> = Box<dyn FnMut() -> Result<(), E> + Send>;

pub struct Job<E> {
    pub name: &'static str,
    pub interval: Duration,
    remaining: Duration,
    task: Task<E>,
}

impl<E> Job<E> {
    pub fn new(
        name: &'static str,
        interval: Duration,
        task: impl FnMut() -> Result<(), E> + Send + 'static,
    ) -> Self {
        Self {
            name,
            interval,
            remaining: interval,
            task: Box::new(task),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }
}

pub struct Scheduler<E> {
    jobs: Vec<Job<E>>,
}

impl<E: Display> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Display> Scheduler<E> {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    pub fn add(&mut self, job: Job<E>) {
        self.jobs.push(job);
    }

    pub fn jobs(&self) -> &[Job<E>] {
        &self.jobs
    }

    /// Time until the soonest job is due, `None` without jobs.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.jobs.iter().map(|j| j.remaining).min()
    }

    /// Subtract `elapsed` from every job. Jobs that reach zero are reset to
    /// their interval and their indices returned.
    pub fn advance(&mut self, elapsed: Duration) -> Vec<usize> {
        let mut due = Vec::new();
        for (index, job) in self.jobs.iter_mut().enumerate() {
            job.remaining = job.remaining.saturating_sub(elapsed);
            if job.remaining.is_zero() {
                job.remaining = job.interval;
                due.push(index);
            }
        }
        due
    }

    fn run_job(&mut self, index: usize) {
        let Some(job) = self.jobs.get_mut(index) else {
            return;
        };
        debug!(job = job.name, "running job");
        if let Err(err) = (job.task)() {
            warn!(job = job.name, error = %err, "job failed");
        }
    }

    pub fn run_all(&mut self) {
        for index in 0..self.jobs.len() {
            self.run_job(index);
        }
    }

    /// Run until `stop` is raised.
    pub fn run(&mut self, stop: &StopSignal) {
        self.run_all();
        while !stop.is_stopped() {
            let Some(wait) = self.next_deadline() else {
                return;
            };
            let started = Instant::now();
            if !stop.sleep(wait) {
                return;
            }
            for index in self.advance(started.elapsed()) {
                if stop.is_stopped() {
                    return;
                }
                self.run_job(index);
            }
        }
    }
}
