//! Device bonding (pairing).
//!
//! Per device the bond state moves NONE → BONDING → BONDED or back to
//! NONE. [`BondingSession::bond`] checks the current state once, starts
//! listening for that device, and only then asks the driver to bond.

use std::{
   pin::Pin,
   task::{Context, Poll, ready},
};

use futures::{Stream, StreamExt, stream::FusedStream};
use log::{debug, info, warn};
use smol_str::SmolStr;

use crate::{
   error::{RadioError, Result},
   event::{Event, EventFilter, FIELD_BOND_STATE, FIELD_DEVICE},
   radio::{BondState, DiscoveredDevice, SharedRadio},
   session::RadioContext,
   stream::StateStream,
};

/// Starts and observes bonding attempts.
#[derive(Clone)]
pub struct BondingSession {
   ctx: RadioContext,
}

impl BondingSession {
   pub const fn new(ctx: RadioContext) -> Self {
      Self { ctx }
   }

   /// Progress of the next bonding attempt with `address`.
   ///
   /// States reported before BONDING (a completion left over from an
   /// earlier attempt) are skipped; then states are yielded up to and
   /// including BONDED or NONE.
   pub fn observe_bonding(&self, address: impl Into<SmolStr>) -> BondingProgress {
      BondingProgress {
         address: address.into(),
         updates: self.ctx.typed(
            EventFilter::single(self.ctx.names().bond_state_changed.clone()),
            |event| {
               let device: DiscoveredDevice = event.field(FIELD_DEVICE)?;
               Ok((device.address, event.clone()))
            },
         ),
         started: false,
      }
   }

   /// Bonds with `address`.
   ///
   /// Nothing happens until the stream is first polled. The device's bond
   /// state is read once: BONDED fails with [`RadioError::AlreadyBonded`]
   /// and BONDING with [`RadioError::AlreadyBonding`], without issuing a
   /// command. Otherwise the stream yields what
   /// [`Self::observe_bonding`] would. A driver error from the bond
   /// command is yielded through the stream.
   pub fn bond(&self, address: impl Into<SmolStr>) -> Bonding {
      let progress = self.observe_bonding(address);
      Bonding {
         radio: self.ctx.radio().clone(),
         progress,
         phase: Phase::Pending,
      }
   }
}

/// Progress of one bonding attempt. See [`BondingSession::observe_bonding`].
pub struct BondingProgress {
   address: SmolStr,
   updates: StateStream<(SmolStr, Event)>,
   started: bool,
}

impl BondingProgress {
   pub fn activate(&mut self) {
      self.updates.activate();
   }

   pub fn address(&self) -> &str {
      &self.address
   }

   fn close(&mut self) {
      self.updates.close();
   }
}

impl Stream for BondingProgress {
   type Item = Result<BondState>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      if this.updates.is_terminated() {
         return Poll::Ready(None);
      }
      loop {
         let item = match ready!(this.updates.poll_next_unpin(cx)) {
            // Other devices' bond states are never decoded
            Some(Ok((address, _))) if address != this.address => continue,
            Some(Ok((_, event))) => match event.field::<BondState>(FIELD_BOND_STATE) {
               Ok(state) if !this.started && state != BondState::Bonding => {
                  debug!("Skipping stale bond state {state} for {}", this.address);
                  continue;
               },
               Ok(state) => {
                  this.started = true;
                  if state.is_settled() {
                     info!("Bonding with {} ended: {state}", this.address);
                     this.close();
                  }
                  Ok(state)
               },
               Err(e) => {
                  this.close();
                  Err(e)
               },
            },
            Some(Err(e)) => Err(e),
            None => Err(RadioError::SourceClosed),
         };
         return Poll::Ready(Some(item));
      }
   }
}

impl FusedStream for BondingProgress {
   fn is_terminated(&self) -> bool {
      self.updates.is_terminated()
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
   Pending,
   Running,
   Done,
}

/// Stream of a bonding attempt. See [`BondingSession::bond`].
pub struct Bonding {
   radio: SharedRadio,
   progress: BondingProgress,
   phase: Phase,
}

impl Bonding {
   pub fn address(&self) -> &str {
      self.progress.address()
   }

   fn start(&mut self) -> Result<()> {
      let address = self.progress.address.clone();
      match self.radio.bond_state(&address) {
         BondState::Bonded => return Err(RadioError::AlreadyBonded(address)),
         BondState::Bonding => return Err(RadioError::AlreadyBonding(address)),
         BondState::None => {},
      }

      self.progress.activate();
      if let Err(e) = self.radio.create_bond(&address) {
         warn!("Bond request for {address} failed: {e}");
         return Err(e);
      }
      debug!("Bond request for {address} submitted");
      Ok(())
   }

   fn finish(&mut self) {
      self.phase = Phase::Done;
      self.progress.close();
   }
}

impl Stream for Bonding {
   type Item = Result<BondState>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      match this.phase {
         Phase::Done => return Poll::Ready(None),
         Phase::Pending => {
            this.phase = Phase::Running;
            if let Err(e) = this.start() {
               this.finish();
               return Poll::Ready(Some(Err(e)));
            }
         },
         Phase::Running => {},
      }

      let item = ready!(this.progress.poll_next_unpin(cx));
      if item.is_none() || this.progress.is_terminated() {
         this.phase = Phase::Done;
      }
      Poll::Ready(item)
   }
}

impl FusedStream for Bonding {
   fn is_terminated(&self) -> bool {
      self.phase == Phase::Done
   }
}
