//! Phase-level progress reporting.
//!
//! Generalizes the same `Rc<RefCell<Vec<Rc<dyn Trait>>>>` fan-out used by
//! [`crate::event::EventProvider`] for wire tracing into a
//! `JobPhase -> JobStatus` observation surface. The "execute on UI
//! thread" dispatch idiom is modeled as an
//! injectable `PostToUi` closure; when none is supplied, notifications
//! run inline on whichever thread the engine itself runs on.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// The phases the engine drives the target through, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    DetectBoard,
    BootToIspMode,
    Greeting,
    InstallFlashBootloader,
    FlashGreeting,
    ChangeBaudRate,
    InitializeFlash,
    FlashFirmware,
    Reboot,
}

impl JobPhase {
    pub const ALL: [JobPhase; 9] = [
        JobPhase::DetectBoard,
        JobPhase::BootToIspMode,
        JobPhase::Greeting,
        JobPhase::InstallFlashBootloader,
        JobPhase::FlashGreeting,
        JobPhase::ChangeBaudRate,
        JobPhase::InitializeFlash,
        JobPhase::FlashFirmware,
        JobPhase::Reboot,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    NotStarted,
    Running,
    Finished,
    Error,
}

impl Default for RunningState {
    fn default() -> Self {
        RunningState::NotStarted
    }
}

/// Per-phase progress. Invariants: `progress == 1.0`
/// whenever `running_state == Finished`; `progress == 0.0` on transition
/// to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JobStatus {
    pub running_state: RunningState,
    pub progress: f32,
}

pub trait JobStatusObserver {
    /// The engine has moved on to a new current phase.
    fn current_job_changed(&self, phase: JobPhase);
    /// `phase`'s status changed.
    fn status_changed(&self, phase: JobPhase, status: JobStatus);
}

/// An injectable "run this on the UI thread" capability. Absent, updates
/// run inline.
pub type PostToUi = Rc<dyn Fn(Box<dyn FnOnce()>)>;

pub(crate) struct JobStatusProvider {
    observers: Rc<RefCell<Vec<Rc<dyn JobStatusObserver>>>>,
    statuses: Rc<RefCell<HashMap<JobPhase, JobStatus>>>,
    current: Rc<Cell<Option<JobPhase>>>,
    post_to_ui: Option<PostToUi>,
}

impl JobStatusProvider {
    pub fn new(post_to_ui: Option<PostToUi>) -> Self {
        let mut statuses = HashMap::new();
        for phase in JobPhase::ALL {
            statuses.insert(phase, JobStatus::default());
        }
        JobStatusProvider {
            observers: Rc::new(RefCell::new(Vec::new())),
            statuses: Rc::new(RefCell::new(statuses)),
            current: Rc::new(Cell::new(None)),
            post_to_ui,
        }
    }

    pub fn add_observer(&mut self, observer: Rc<dyn JobStatusObserver>) {
        self.observers.borrow_mut().push(observer);
    }

    pub fn status(&self, phase: JobPhase) -> JobStatus {
        self.statuses.borrow()[&phase]
    }

    pub fn current(&self) -> Option<JobPhase> {
        self.current.get()
    }

    fn dispatch(&self, work: impl FnOnce() + 'static) {
        match &self.post_to_ui {
            Some(post) => post(Box::new(work)),
            None => work(),
        }
    }

    /// Move to `phase` as the current job and reset its status to
    /// `Running` at 0 progress.
    pub fn enter(&self, phase: JobPhase) {
        self.current.set(Some(phase));
        self.statuses.borrow_mut().insert(
            phase,
            JobStatus {
                running_state: RunningState::Running,
                progress: 0.0,
            },
        );
        let observers = Rc::clone(&self.observers);
        self.dispatch(move || {
            for observer in observers.borrow().iter() {
                observer.current_job_changed(phase);
            }
        });
        self.notify_status(phase);
    }

    /// Update `phase`'s progress without changing its running state.
    pub fn set_progress(&self, phase: JobPhase, progress: f32) {
        if let Some(status) = self.statuses.borrow_mut().get_mut(&phase) {
            status.progress = progress.clamp(0.0, 1.0);
        }
        self.notify_status(phase);
    }

    /// Mark `phase` finished, forcing progress to 1.0.
    pub fn finish(&self, phase: JobPhase) {
        self.statuses.borrow_mut().insert(
            phase,
            JobStatus {
                running_state: RunningState::Finished,
                progress: 1.0,
            },
        );
        self.notify_status(phase);
    }

    /// Mark `phase` errored, leaving progress at its last value.
    pub fn error(&self, phase: JobPhase) {
        if let Some(status) = self.statuses.borrow_mut().get_mut(&phase) {
            status.running_state = RunningState::Error;
        }
        self.notify_status(phase);
    }

    fn notify_status(&self, phase: JobPhase) {
        let status = self.status(phase);
        let observers = Rc::clone(&self.observers);
        self.dispatch(move || {
            for observer in observers.borrow().iter() {
                observer.status_changed(phase, status);
            }
        });
    }
}
