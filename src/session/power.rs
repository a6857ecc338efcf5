//! Adapter power control.
//!
//! [`AdapterPowerController::enable`] and [`AdapterPowerController::disable`]
//! return a [`PowerTransition`] that checks the current power state, issues
//! the driver command and then follows the adapter through its transition
//! until it settles ON or OFF.

use std::{
   pin::Pin,
   task::{Context, Poll, ready},
};

use futures::{Stream, StreamExt, stream::FusedStream};
use log::{debug, warn};

use crate::{
   error::{RadioError, Result},
   event::{EventFilter, FIELD_STATE},
   radio::{PowerState, SharedRadio},
   session::RadioContext,
   stream::StateStream,
};

/// Direction of a power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PowerDirection {
   #[strum(serialize = "enable")]
   Enable,
   #[strum(serialize = "disable")]
   Disable,
}

/// Issues power commands and observes adapter power state.
#[derive(Clone)]
pub struct AdapterPowerController {
   ctx: RadioContext,
}

impl AdapterPowerController {
   pub const fn new(ctx: RadioContext) -> Self {
      Self { ctx }
   }

   /// Turns the adapter on.
   ///
   /// Nothing happens until the stream is first polled. The stream fails
   /// with [`RadioError::AlreadyEnabled`] if the adapter is already on, or
   /// [`RadioError::EnableRejected`] if the driver refuses the command.
   /// Otherwise it yields every power state up to and including the first
   /// ON or OFF, then ends.
   pub fn enable(&self) -> PowerTransition {
      PowerTransition::new(PowerDirection::Enable, self)
   }

   /// Turns the adapter off. Mirror image of [`Self::enable`].
   pub fn disable(&self) -> PowerTransition {
      PowerTransition::new(PowerDirection::Disable, self)
   }

   /// Every power state change, indefinitely.
   pub fn observe_state(&self) -> StateStream<PowerState> {
      self.ctx.typed(
         EventFilter::single(self.ctx.names().state_changed.clone()),
         |event| event.field(FIELD_STATE),
      )
   }

   /// Only ON and OFF, with repeats of the same state collapsed.
   pub fn observe_state_on_off(&self) -> SettledStates {
      SettledStates {
         states: self.observe_state(),
         last: None,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
   Pending,
   Observing,
   Done,
}

/// Stream of a single power transition. See [`AdapterPowerController::enable`].
pub struct PowerTransition {
   direction: PowerDirection,
   radio: SharedRadio,
   states: StateStream<PowerState>,
   phase: Phase,
}

impl PowerTransition {
   fn new(direction: PowerDirection, controller: &AdapterPowerController) -> Self {
      Self {
         direction,
         radio: controller.ctx.radio().clone(),
         states: controller.observe_state(),
         phase: Phase::Pending,
      }
   }

   pub const fn direction(&self) -> PowerDirection {
      self.direction
   }

   fn start(&mut self) -> Result<()> {
      let enabled = self.radio.is_enabled();
      match self.direction {
         PowerDirection::Enable if enabled => return Err(RadioError::AlreadyEnabled),
         PowerDirection::Disable if !enabled => return Err(RadioError::AlreadyDisabled),
         _ => {},
      }

      // Listen before commanding so a fast transition cannot slip past
      self.states.activate();
      let accepted = match self.direction {
         PowerDirection::Enable => self.radio.enable(),
         PowerDirection::Disable => self.radio.disable(),
      };
      if !accepted {
         self.states.close();
         warn!("Driver refused to {} the adapter", self.direction);
         return Err(match self.direction {
            PowerDirection::Enable => RadioError::EnableRejected,
            PowerDirection::Disable => RadioError::DisableRejected,
         });
      }

      debug!("Power {} command accepted", self.direction);
      Ok(())
   }

   fn finish(&mut self) {
      self.phase = Phase::Done;
      self.states.close();
   }
}

impl Stream for PowerTransition {
   type Item = Result<PowerState>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      match this.phase {
         Phase::Done => return Poll::Ready(None),
         Phase::Pending => {
            this.phase = Phase::Observing;
            if let Err(e) = this.start() {
               this.finish();
               return Poll::Ready(Some(Err(e)));
            }
         },
         Phase::Observing => {},
      }

      let item = match ready!(this.states.poll_next_unpin(cx)) {
         Some(Ok(state)) => {
            if state.is_settled() {
               debug!("Power {} settled {state}", this.direction);
               this.finish();
            }
            Ok(state)
         },
         Some(Err(e)) => {
            this.finish();
            Err(e)
         },
         None => {
            this.finish();
            Err(RadioError::SourceClosed)
         },
      };
      Poll::Ready(Some(item))
   }
}

impl FusedStream for PowerTransition {
   fn is_terminated(&self) -> bool {
      self.phase == Phase::Done
   }
}

/// Settled power states without repeats. See
/// [`AdapterPowerController::observe_state_on_off`].
pub struct SettledStates {
   states: StateStream<PowerState>,
   last: Option<PowerState>,
}

impl Stream for SettledStates {
   type Item = Result<PowerState>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      loop {
         match ready!(this.states.poll_next_unpin(cx)) {
            Some(Ok(state)) if !state.is_settled() || this.last == Some(state) => continue,
            Some(Ok(state)) => {
               this.last = Some(state);
               return Poll::Ready(Some(Ok(state)));
            },
            other => return Poll::Ready(other),
         }
      }
   }
}
