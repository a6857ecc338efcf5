//! Device discovery.
//!
//! A discovery round is announced on the bus by a STARTED event, any
//! number of device-found events, and a FINISHED event. The streams here
//! slice that lifecycle into per-subscriber sequences with their own
//! dedup and termination state.

use std::{
   collections::HashSet,
   pin::Pin,
   task::{Context, Poll, ready},
};

use futures::{Stream, StreamExt, stream::FusedStream};
use log::{debug, warn};
use smol_str::SmolStr;

use crate::{
   error::{RadioError, Result},
   event::{Event, EventFilter, EventNames, FIELD_DEVICE},
   radio::{DiscoveredDevice, DiscoveryPhase, SharedRadio},
   session::RadioContext,
   stream::StateStream,
};

/// Starts discovery rounds and observes their lifecycle.
#[derive(Clone)]
pub struct DiscoverySession {
   ctx: RadioContext,
}

impl DiscoverySession {
   pub const fn new(ctx: RadioContext) -> Self {
      Self { ctx }
   }

   /// Devices found for as long as the stream lives, each address at most
   /// once.
   pub fn observe_discovered_devices(&self) -> DiscoveredDevices {
      DiscoveredDevices {
         devices: self.ctx.typed(
            EventFilter::single(self.ctx.names().device_found.clone()),
            |event| event.field(FIELD_DEVICE),
         ),
         seen: HashSet::new(),
      }
   }

   /// STARTED and FINISHED signals of every round, indefinitely.
   pub fn observe_discovery_phase(&self) -> StateStream<DiscoveryPhase> {
      let names = self.ctx.names().clone();
      self.ctx.typed(
         EventFilter::new([
            names.discovery_started.clone(),
            names.discovery_finished.clone(),
         ]),
         move |event| decode_phase(&names, event),
      )
   }

   /// The next complete round: leading FINISHED signals left over from an
   /// earlier round are skipped, then phases are yielded up to and
   /// including the next FINISHED.
   pub fn observe_discovery_window(&self) -> DiscoveryWindow {
      DiscoveryWindow {
         phases: self.observe_discovery_phase(),
         skipping: true,
      }
   }

   /// The first FINISHED after the stream is first polled.
   ///
   /// A FINISHED from an earlier round is accepted too, so the stream
   /// should be polled (or activated) before the round is started.
   pub fn observe_discovery_finish(&self) -> DiscoveryFinish {
      DiscoveryFinish {
         phases: self.observe_discovery_phase(),
      }
   }

   /// Starts a discovery round and yields each device found during it.
   ///
   /// On first poll the stream starts listening for found and FINISHED
   /// events and only then issues the start command, so a driver that
   /// reports results immediately is still observed. The stream ends when
   /// the round finishes; the FINISHED signal itself is not yielded.
   pub fn start_discovery(&self) -> Discovery {
      let names = self.ctx.names().clone();
      let events = self.ctx.typed(
         EventFilter::new([names.device_found.clone(), names.discovery_finished.clone()]),
         move |event| {
            if event.name == names.discovery_finished {
               Ok(RoundEvent::Finished)
            } else {
               event.field(FIELD_DEVICE).map(RoundEvent::Found)
            }
         },
      );
      Discovery {
         radio: self.ctx.radio().clone(),
         events,
         seen: HashSet::new(),
         phase: Phase::Pending,
      }
   }
}

fn decode_phase(names: &EventNames, event: &Event) -> Result<DiscoveryPhase> {
   if event.name == names.discovery_started {
      Ok(DiscoveryPhase::Started)
   } else if event.name == names.discovery_finished {
      Ok(DiscoveryPhase::Finished)
   } else {
      Err(RadioError::InvalidField {
         event: event.name.clone(),
         field: "name",
         reason: "not a discovery phase event".to_string(),
      })
   }
}

/// Discovered devices without repeats. See
/// [`DiscoverySession::observe_discovered_devices`].
pub struct DiscoveredDevices {
   devices: StateStream<DiscoveredDevice>,
   seen: HashSet<SmolStr>,
}

impl DiscoveredDevices {
   pub fn activate(&mut self) {
      self.devices.activate();
   }
}

impl Stream for DiscoveredDevices {
   type Item = Result<DiscoveredDevice>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      loop {
         match ready!(this.devices.poll_next_unpin(cx)) {
            Some(Ok(device)) if !this.seen.insert(device.address.clone()) => continue,
            other => return Poll::Ready(other),
         }
      }
   }
}

/// One discovery round. See [`DiscoverySession::observe_discovery_window`].
pub struct DiscoveryWindow {
   phases: StateStream<DiscoveryPhase>,
   skipping: bool,
}

impl DiscoveryWindow {
   pub fn activate(&mut self) {
      self.phases.activate();
   }
}

impl Stream for DiscoveryWindow {
   type Item = Result<DiscoveryPhase>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      if this.phases.is_terminated() {
         return Poll::Ready(None);
      }
      loop {
         let item = match ready!(this.phases.poll_next_unpin(cx)) {
            Some(Ok(DiscoveryPhase::Finished)) if this.skipping => continue,
            Some(Ok(phase)) => {
               this.skipping = false;
               if phase == DiscoveryPhase::Finished {
                  this.phases.close();
               }
               Ok(phase)
            },
            Some(Err(e)) => Err(e),
            None => Err(RadioError::SourceClosed),
         };
         return Poll::Ready(Some(item));
      }
   }
}

impl FusedStream for DiscoveryWindow {
   fn is_terminated(&self) -> bool {
      self.phases.is_terminated()
   }
}

/// First FINISHED signal. See [`DiscoverySession::observe_discovery_finish`].
pub struct DiscoveryFinish {
   phases: StateStream<DiscoveryPhase>,
}

impl DiscoveryFinish {
   pub fn activate(&mut self) {
      self.phases.activate();
   }
}

impl Stream for DiscoveryFinish {
   type Item = Result<DiscoveryPhase>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      if this.phases.is_terminated() {
         return Poll::Ready(None);
      }
      loop {
         let item = match ready!(this.phases.poll_next_unpin(cx)) {
            Some(Ok(DiscoveryPhase::Started)) => continue,
            Some(Ok(DiscoveryPhase::Finished)) => {
               this.phases.close();
               Ok(DiscoveryPhase::Finished)
            },
            Some(Err(e)) => Err(e),
            None => Err(RadioError::SourceClosed),
         };
         return Poll::Ready(Some(item));
      }
   }
}

impl FusedStream for DiscoveryFinish {
   fn is_terminated(&self) -> bool {
      self.phases.is_terminated()
   }
}

enum RoundEvent {
   Found(DiscoveredDevice),
   Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
   Pending,
   Running,
   Done,
}

/// Devices found during one discovery round. See
/// [`DiscoverySession::start_discovery`].
///
/// Found and FINISHED events share a single subscription so the round
/// boundary is observed in bus order relative to the devices.
pub struct Discovery {
   radio: SharedRadio,
   events: StateStream<RoundEvent>,
   seen: HashSet<SmolStr>,
   phase: Phase,
}

impl Discovery {
   fn start(&mut self) -> Result<()> {
      self.events.activate();
      if let Err(e) = self.radio.start_discovery() {
         warn!("Failed to start discovery: {e}");
         return Err(e);
      }
      debug!("Discovery started");
      Ok(())
   }

   fn finish(&mut self) {
      self.phase = Phase::Done;
      self.events.close();
   }

   /// Number of distinct devices yielded so far.
   pub fn found_count(&self) -> usize {
      self.seen.len()
   }
}

impl Stream for Discovery {
   type Item = Result<DiscoveredDevice>;

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

      loop {
         let item = match ready!(this.events.poll_next_unpin(cx)) {
            Some(Ok(RoundEvent::Found(device))) => {
               if !this.seen.insert(device.address.clone()) {
                  continue;
               }
               Ok(device)
            },
            Some(Ok(RoundEvent::Finished)) => {
               debug!("Discovery finished with {} devices", this.seen.len());
               this.finish();
               return Poll::Ready(None);
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
         return Poll::Ready(Some(item));
      }
   }
}

impl FusedStream for Discovery {
   fn is_terminated(&self) -> bool {
      self.phase == Phase::Done
   }
}

#[cfg(test)]
mod tests {
   use futures::FutureExt;

   use super::*;
   use crate::{
      event::EventBus,
      testing::{Call, finished_event, fixture, found_event, started_event},
   };

   fn addresses(devices: Vec<Result<DiscoveredDevice>>) -> Vec<SmolStr> {
      devices.into_iter().map(|d| d.unwrap().address).collect()
   }

   #[tokio::test]
   async fn test_discovered_devices_dedup_by_address() {
      let (hub, _radio, ctx) = fixture();
      let mut devices = ctx.discovery().observe_discovered_devices();
      devices.activate();

      for address in ["A", "B", "A", "C"] {
         hub.emit(found_event(address));
      }

      let found: Vec<_> = (&mut devices).take(3).collect().await;
      assert_eq!(addresses(found), ["A", "B", "C"]);
      assert!(devices.next().now_or_never().is_none());
   }

   #[tokio::test]
   async fn test_dedup_state_is_per_subscription() {
      let (hub, _radio, ctx) = fixture();
      let session = ctx.discovery();
      let mut first = session.observe_discovered_devices();
      first.activate();
      hub.emit(found_event("A"));
      assert_eq!(first.next().await.unwrap().unwrap().address, "A");

      let mut second = session.observe_discovered_devices();
      second.activate();
      hub.emit(found_event("A"));
      assert_eq!(second.next().await.unwrap().unwrap().address, "A");
      assert!(first.next().now_or_never().is_none());
   }

   #[tokio::test]
   async fn test_phase_stream_never_terminates() {
      let (hub, _radio, ctx) = fixture();
      let mut phases = ctx.discovery().observe_discovery_phase();
      phases.activate();

      for event in [started_event(), finished_event(), started_event(), finished_event()] {
         hub.emit(event);
      }

      let seen: Vec<_> = (&mut phases).take(4).map(Result::unwrap).collect().await;
      assert_eq!(
         seen,
         [
            DiscoveryPhase::Started,
            DiscoveryPhase::Finished,
            DiscoveryPhase::Started,
            DiscoveryPhase::Finished,
         ]
      );
      assert!(phases.next().now_or_never().is_none());
   }

   #[tokio::test]
   async fn test_window_skips_stale_finish() {
      let (hub, _radio, ctx) = fixture();
      let mut window = ctx.discovery().observe_discovery_window();
      window.activate();

      for event in [
         finished_event(),
         finished_event(),
         started_event(),
         finished_event(),
         started_event(),
      ] {
         hub.emit(event);
      }

      let seen: Vec<_> = (&mut window).map(Result::unwrap).collect().await;
      assert_eq!(seen, [DiscoveryPhase::Started, DiscoveryPhase::Finished]);
      assert!(window.is_terminated());
      assert_eq!(hub.listener_count(), 0);
   }

   #[tokio::test]
   async fn test_finish_accepts_first_finished() {
      let (hub, _radio, ctx) = fixture();
      let mut finish = ctx.discovery().observe_discovery_finish();
      finish.activate();

      hub.emit(started_event());
      hub.emit(finished_event());
      hub.emit(finished_event());

      assert_eq!(finish.next().await.unwrap().unwrap(), DiscoveryPhase::Finished);
      assert!(finish.next().await.is_none());
      assert_eq!(hub.listener_count(), 0);
   }

   #[tokio::test]
   async fn test_finish_reports_closed_source() {
      let (hub, _radio, ctx) = fixture();
      let mut finish = ctx.discovery().observe_discovery_finish();
      finish.activate();
      hub.shutdown();

      assert!(matches!(
         finish.next().await,
         Some(Err(RadioError::SourceClosed))
      ));
      assert!(finish.next().await.is_none());
   }

   #[tokio::test]
   async fn test_start_discovery_sees_synchronous_results() {
      let (hub, radio, ctx) = fixture();
      radio.on(
         Call::StartDiscovery,
         vec![
            started_event(),
            found_event("A"),
            found_event("B"),
            found_event("A"),
            finished_event(),
            found_event("C"),
         ],
      );

      let mut discovery = ctx.discovery().start_discovery();
      let found: Vec<_> = (&mut discovery).collect().await;
      assert_eq!(addresses(found), ["A", "B"]);
      assert_eq!(discovery.found_count(), 2);
      assert_eq!(radio.calls(), [Call::StartDiscovery]);
      assert_eq!(hub.listener_count(), 0);
   }

   #[tokio::test]
   async fn test_start_discovery_is_lazy() {
      let (hub, radio, ctx) = fixture();
      let mut discovery = ctx.discovery().start_discovery();
      assert!(radio.calls().is_empty());
      assert_eq!(hub.listener_count(), 0);

      assert!(discovery.next().now_or_never().is_none());
      assert_eq!(radio.calls(), [Call::StartDiscovery]);
      assert_eq!(hub.listener_count(), 1);

      hub.emit(found_event("A"));
      assert_eq!(discovery.next().await.unwrap().unwrap().address, "A");
      hub.emit(finished_event());
      assert!(discovery.next().await.is_none());
      assert!(discovery.is_terminated());
   }

   #[tokio::test]
   async fn test_start_discovery_forwards_driver_error() {
      let (hub, radio, ctx) = fixture();
      radio.fail_discovery("adapter busy");

      let mut discovery = ctx.discovery().start_discovery();
      assert!(matches!(
         discovery.next().await,
         Some(Err(RadioError::DiscoveryFailed(_)))
      ));
      assert!(discovery.next().await.is_none());
      assert_eq!(hub.listener_count(), 0);
   }

   #[tokio::test]
   async fn test_malformed_device_fails_discovery() {
      let (hub, _radio, ctx) = fixture();
      let mut discovery = ctx.discovery().start_discovery();
      assert!(discovery.next().now_or_never().is_none());

      hub.emit(Event::new(ctx.names().device_found.clone()));
      assert!(matches!(
         discovery.next().await,
         Some(Err(RadioError::MissingField { field: "device", .. }))
      ));
      assert!(discovery.next().await.is_none());
   }

   #[tokio::test]
   async fn test_dropping_discovery_releases_subscription() {
      let (hub, _radio, ctx) = fixture();
      let mut discovery = ctx.discovery().start_discovery();
      assert!(discovery.next().now_or_never().is_none());
      assert_eq!(hub.listener_count(), 1);

      drop(discovery);
      assert_eq!(hub.listener_count(), 0);
   }
}
