//! Template lifecycle state machine.
//!
//! ```text
//! Registering ─┬─► MarkingTemplate ─► Done                         (no clone)
//!              └─► Cloning ─► PoweringOn ─► AwaitingGuestTools
//!                                             ├─► PoweringOff ─► MarkingTemplate
//!                                             │                      └─► DestroyingOriginal ─► Done
//!                                             └─► ForcingPowerOff ─► TimedOut
//! ```
//!
//! The machine only decides transitions. The remote work for each state is
//! performed by [`crate::publish::lifecycle`], which dispatches the matching
//! event once that work has finished.

use statig::prelude::*;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Completion of the remote work for the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Registered,
    Cloned,
    PoweredOn,
    ToolsReady,
    ToolsTimedOut,
    PoweredOff,
    MarkedTemplate,
    OriginalDestroyed,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

pub struct LifecycleMachine {
    pub vm_name: String,
    pub clone_required: bool,
}

impl LifecycleMachine {
    pub fn new(vm_name: impl Into<String>, clone_required: bool) -> Self {
        Self {
            vm_name: vm_name.into(),
            clone_required,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::registering()",
    state(derive(Debug, Clone, PartialEq))
)]
impl LifecycleMachine {
    /// Waiting for the registration task.
    #[state]
    fn registering(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Registered if self.clone_required => Transition(State::cloning()),
            LifecycleEvent::Registered => Transition(State::marking_template()),
            _ => Handled,
        }
    }

    #[state]
    fn cloning(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Cloned => Transition(State::powering_on()),
            _ => Handled,
        }
    }

    #[state]
    fn powering_on(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::PoweredOn => Transition(State::awaiting_guest_tools()),
            _ => Handled,
        }
    }

    /// Polling the clone's guest tools. The only state with two exits.
    #[state(entry_action = "enter_awaiting_guest_tools")]
    fn awaiting_guest_tools(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::ToolsReady => Transition(State::powering_off()),
            LifecycleEvent::ToolsTimedOut => Transition(State::forcing_power_off()),
            _ => Handled,
        }
    }

    #[state]
    fn powering_off(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::PoweredOff => Transition(State::marking_template()),
            _ => Handled,
        }
    }

    /// Compensating power-off after the guest-tools deadline.
    #[state(entry_action = "enter_forcing_power_off")]
    fn forcing_power_off(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::PoweredOff => Transition(State::timed_out()),
            _ => Handled,
        }
    }

    /// Marks the clone when one was made, the registered VM otherwise.
    #[state]
    fn marking_template(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::MarkedTemplate if self.clone_required => {
                Transition(State::destroying_original())
            }
            LifecycleEvent::MarkedTemplate => Transition(State::done()),
            _ => Handled,
        }
    }

    #[state]
    fn destroying_original(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::OriginalDestroyed => Transition(State::done()),
            _ => Handled,
        }
    }

    #[state(entry_action = "enter_done")]
    fn done(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn timed_out(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    #[action]
    fn enter_awaiting_guest_tools(&mut self) {
        info!(target: "lifecycle", vm = %self.vm_name, "Waiting for guest tools");
    }

    #[action]
    fn enter_forcing_power_off(&mut self) {
        warn!(target: "lifecycle", vm = %self.vm_name, "Guest tools deadline passed, forcing power off");
    }

    #[action]
    fn enter_done(&mut self) {
        info!(target: "lifecycle", vm = %self.vm_name, "Template lifecycle complete");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
