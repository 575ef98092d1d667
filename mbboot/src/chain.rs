//! Reusable sequencer of ordered asynchronous steps.
//!
//! An [`OperationChain`] executes heterogeneous [`Step`]s strictly in
//! append order. Each step is an arbitrary asynchronous action with its
//! own success and failure signal sources; the chain is agnostic to what
//! a step actually does. Exactly one step has its signals connected at
//! any time while the chain executes.
//!
//! Cancellation is cooperative: requesting cancel while executing sets a
//! flag that is observed only at the next step boundary — the step in
//! flight always completes before the chain transitions to `Canceled`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::error::Error;
use crate::signal::{Signal, SlotId};

const COMPONENT: &str = "OperationChain";

/// State of an operation chain.
///
/// `Done`, `Canceled` and `Error` are terminal for one execution; the
/// chain may be executed again afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainState {
    /// Not executing.
    #[default]
    Idle,
    /// Steps are being executed.
    Executing,
    /// All steps completed successfully.
    Done,
    /// Execution was canceled at a step boundary.
    Canceled,
    /// A step failed.
    Error,
}

/// One step of a chain: a launch function plus the signal sources that
/// report the launched action's outcome.
///
/// The launch function returns immediately whether the action was
/// started; the outcome arrives later through the signals.
pub struct Step {
    exec: Rc<dyn Fn() -> bool>,
    success: Signal<()>,
    failure: Signal<Error>,
}

impl Step {
    /// Create a step from its outcome signal sources and launch function.
    pub fn new<F>(success: Signal<()>, failure: Signal<Error>, exec: F) -> Self
    where
        F: Fn() -> bool + 'static,
    {
        Self {
            exec: Rc::new(exec),
            success,
            failure,
        }
    }
}

/// Events a chain emits.
#[derive(Debug, Default)]
pub struct ChainEvents {
    /// Every step completed successfully.
    pub success: Signal<()>,
    /// A step failed; carries the step's error.
    pub fail: Signal<Error>,
    /// Execution stopped at a step boundary after a cancel request.
    pub canceled: Signal<()>,
}

struct ChainInner {
    state: ChainState,
    steps: Vec<Step>,
    index: usize,
    need_cancel: bool,
    step_slots: Option<(SlotId, SlotId)>,
}

/// Sequencer of ordered asynchronous steps.
pub struct OperationChain {
    weak_self: Weak<Self>,
    inner: RefCell<ChainInner>,
    events: ChainEvents,
}

impl OperationChain {
    /// Create an empty chain.
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            inner: RefCell::new(ChainInner {
                state: ChainState::Idle,
                steps: Vec::new(),
                index: 0,
                need_cancel: false,
                step_slots: None,
            }),
            events: ChainEvents::default(),
        })
    }

    /// Event channels.
    pub fn events(&self) -> &ChainEvents {
        &self.events
    }

    /// Current state.
    pub fn state(&self) -> ChainState {
        self.inner.borrow().state
    }

    /// Whether the last execution completed all steps.
    pub fn is_done(&self) -> bool {
        self.state() == ChainState::Done
    }

    /// Whether the chain is currently executing.
    pub fn is_executing(&self) -> bool {
        self.state() == ChainState::Executing
    }

    /// Whether the chain has no steps.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().steps.is_empty()
    }

    /// Index of the current step, valid while executing (and, after a
    /// failure, the index of the failed step).
    pub fn current_index(&self) -> usize {
        self.inner.borrow().index
    }

    /// Append a step. Rejected while executing: composition is only legal
    /// while the chain is idle.
    pub fn append(&self, step: Step) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.state == ChainState::Executing {
            return false;
        }
        inner.steps.push(step);
        true
    }

    /// Remove all steps. Rejected while executing.
    pub fn clear(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.state == ChainState::Executing {
            return false;
        }
        inner.steps.clear();
        true
    }

    /// Start executing from the first step. Rejected if already executing
    /// or if the chain is empty.
    pub fn exec(&self) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ChainState::Executing {
                return false;
            }
            if inner.steps.is_empty() {
                return false;
            }

            inner.need_cancel = false;
            inner.state = ChainState::Executing;
            inner.index = 0;
        }

        self.launch_current();

        true
    }

    /// Request cancellation; takes effect at the next step boundary.
    /// Rejected unless the chain is executing with a non-empty step list.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.state != ChainState::Executing {
            return false;
        }
        if inner.steps.is_empty() {
            return false;
        }

        inner.need_cancel = true;
        true
    }

    /// Connect the current step's signals and launch it. A launch
    /// failure is treated as the step itself failing.
    fn launch_current(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.steps.is_empty() {
                warn!("OperationChain: launch with empty chain");
                return;
            }
            if inner.index >= inner.steps.len() {
                warn!("OperationChain: launch with step index out of range");
                return;
            }

            let index = inner.index;
            let weak = self.weak_self.clone();
            let succ_slot = inner.steps[index].success.connect(move |()| {
                if let Some(chain) = weak.upgrade() {
                    chain.on_step_success();
                }
            });
            let weak = self.weak_self.clone();
            let fail_slot = inner.steps[index].failure.connect(move |error| {
                if let Some(chain) = weak.upgrade() {
                    chain.on_step_fail(error.clone());
                }
            });
            inner.step_slots = Some((succ_slot, fail_slot));
        }

        // The launch may complete synchronously and re-enter the chain's
        // handlers, which re-borrow; the launch function is cloned out so
        // no borrow is held while it runs.
        let exec = {
            let inner = self.inner.borrow();
            Rc::clone(&inner.steps[inner.index].exec)
        };

        if !exec() {
            self.on_step_fail(Error::general(COMPONENT, "error executing chain step"));
        }
    }

    fn disconnect_current(inner: &mut ChainInner) {
        if let Some((succ_slot, fail_slot)) = inner.step_slots.take() {
            if let Some(step) = inner.steps.get(inner.index) {
                step.success.disconnect(succ_slot);
                step.failure.disconnect(fail_slot);
            }
        }
    }

    fn on_step_success(&self) {
        enum Next {
            Canceled,
            Done,
            Launch,
        }

        let next = {
            let mut inner = self.inner.borrow_mut();
            if inner.steps.is_empty() {
                warn!("OperationChain: step success with empty chain");
                return;
            }
            if inner.index >= inner.steps.len() {
                warn!("OperationChain: step success with step index out of range");
                return;
            }

            Self::disconnect_current(&mut inner);

            if inner.need_cancel {
                // Cancellation takes priority at the boundary even though
                // the step itself succeeded.
                inner.state = ChainState::Canceled;
                Next::Canceled
            } else {
                inner.index += 1;
                if inner.index >= inner.steps.len() {
                    inner.state = ChainState::Done;
                    Next::Done
                } else {
                    Next::Launch
                }
            }
        };

        match next {
            Next::Canceled => self.events.canceled.emit(&()),
            Next::Done => self.events.success.emit(&()),
            Next::Launch => self.launch_current(),
        }
    }

    fn on_step_fail(&self, error: Error) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.steps.is_empty() {
                warn!("OperationChain: step failure with empty chain");
                return;
            }
            if inner.index >= inner.steps.len() {
                warn!("OperationChain: step failure with step index out of range");
                return;
            }

            debug!(
                "OperationChain: step {} failed: {error}",
                inner.index
            );

            inner.state = ChainState::Error;
            Self::disconnect_current(&mut inner);
        }

        self.events.fail.emit(&error);
    }
}
