//! Typed event streams.
//!
//! [`StateStream`] is the single seam through which raw bus events enter
//! the sessions: it owns one filtered subscription and decodes each event
//! into a typed value. It neither filters nor terminates on its own.

use std::{
   pin::Pin,
   sync::Arc,
   task::{Context, Poll, ready},
};

use futures::{Stream, StreamExt, stream::FusedStream};

use crate::{
   error::Result,
   event::{Event, EventFilter, SharedSource, Subscription},
};

/// Extracts a typed value from a raw event.
pub type Decoder<T> = Arc<dyn Fn(&Event) -> Result<T> + Send + Sync>;

enum Activation {
   Idle,
   Live(Subscription),
   Closed,
}

/// Lazy, restartable stream of decoded event values.
///
/// The bus subscription is made on first poll, or earlier through
/// [`StateStream::activate`]. A decode failure is yielded as an `Err` and
/// closes the stream; closing releases the subscription.
pub struct StateStream<T> {
   source: SharedSource,
   filter: EventFilter,
   decode: Decoder<T>,
   state: Activation,
}

/// Builds a [`StateStream`] over the events matched by `filter`.
pub fn subscribe_typed<T, F>(
   source: SharedSource,
   filter: EventFilter,
   extract: F,
) -> StateStream<T>
where
   F: Fn(&Event) -> Result<T> + Send + Sync + 'static,
{
   StateStream {
      source,
      filter,
      decode: Arc::new(extract),
      state: Activation::Idle,
   }
}

impl<T> StateStream<T> {
   /// Registers the bus subscription now instead of on first poll.
   ///
   /// Every event emitted after this returns will be observed. Has no
   /// effect on a stream that is already live or closed.
   pub fn activate(&mut self) {
      if matches!(self.state, Activation::Idle) {
         self.state = Activation::Live(self.source.subscribe(self.filter.clone()));
      }
   }

   pub const fn is_active(&self) -> bool {
      matches!(self.state, Activation::Live(_))
   }

   /// Releases the subscription. The stream yields nothing afterwards.
   pub fn close(&mut self) {
      self.state = Activation::Closed;
   }

   /// A fresh, inactive stream over the same events.
   #[must_use]
   pub fn restart(&self) -> Self {
      Self {
         source: self.source.clone(),
         filter: self.filter.clone(),
         decode: self.decode.clone(),
         state: Activation::Idle,
      }
   }

   pub const fn filter(&self) -> &EventFilter {
      &self.filter
   }
}

impl<T> Stream for StateStream<T> {
   type Item = Result<T>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      this.activate();

      let Activation::Live(subscription) = &mut this.state else {
         return Poll::Ready(None);
      };

      match ready!(subscription.poll_next_unpin(cx)) {
         Some(event) => {
            let decoded = (this.decode)(&event);
            if decoded.is_err() {
               this.close();
            }
            Poll::Ready(Some(decoded))
         },
         None => {
            this.close();
            Poll::Ready(None)
         },
      }
   }
}

impl<T> FusedStream for StateStream<T> {
   fn is_terminated(&self) -> bool {
      matches!(self.state, Activation::Closed)
   }
}
