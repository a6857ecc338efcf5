//! ACL link notifications.

use smol_str::SmolStr;

use crate::{
   event::{EventFilter, FIELD_DEVICE},
   radio::DiscoveredDevice,
   session::RadioContext,
   stream::StateStream,
};

/// Observes devices whose link to the adapter comes up or goes down.
#[derive(Clone)]
pub struct ConnectionObserver {
   ctx: RadioContext,
}

impl ConnectionObserver {
   pub const fn new(ctx: RadioContext) -> Self {
      Self { ctx }
   }

   /// Every device that connects, indefinitely.
   pub fn observe_connections(&self) -> StateStream<DiscoveredDevice> {
      self.devices(self.ctx.names().acl_connected.clone())
   }

   /// Every device that disconnects, indefinitely.
   pub fn observe_disconnections(&self) -> StateStream<DiscoveredDevice> {
      self.devices(self.ctx.names().acl_disconnected.clone())
   }

   fn devices(&self, name: SmolStr) -> StateStream<DiscoveredDevice> {
      self
         .ctx
         .typed(EventFilter::single(name), |event| event.field(FIELD_DEVICE))
   }
}
