//! Event delivery.
//!
//! Every stream sends its confirmed transitions into one mpsc channel. A single
//! dispatcher thread drains that channel and hands each event to the sink exactly
//! once. A failed delivery is logged and the event is dropped: the engine never
//! retries, and a slow or broken sink never stalls a stream.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::error::SlotError;
use crate::OccupancyEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Destination for confirmed transitions.
///
/// Implementations should tolerate a "Vacant" with no prior "Occupied" and a
/// repeated "Occupied" for the same slot.
pub trait EventSink: Send {
    fn deliver(&mut self, event: &OccupancyEvent) -> Result<()>;
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn deliver(&mut self, event: &OccupancyEvent) -> Result<()> {
        (**self).deliver(event)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub dropped: u64,
}

pub struct Dispatcher<S: EventSink + 'static> {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<(S, DispatchStats)>>,
}

impl<S: EventSink + 'static> Dispatcher<S> {
    pub fn spawn(mut sink: S, events: Receiver<OccupancyEvent>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let join = std::thread::Builder::new()
            .name("event-dispatch".to_string())
            .spawn(move || {
                let mut stats = DispatchStats::default();
                loop {
                    match events.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => match deliver_once(&mut sink, &event) {
                            Ok(()) => stats.delivered += 1,
                            Err(err) => {
                                stats.dropped += 1;
                                log::warn!(
                                    "[{}] {}, dropping {} -> {}",
                                    event.stream_id,
                                    err,
                                    event.slot_label,
                                    event.new_status
                                );
                            }
                        },
                        Err(RecvTimeoutError::Timeout) => {
                            if stop_flag.load(Ordering::SeqCst) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                (sink, stats)
            })?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    /// Deliver whatever is still queued, then stop and hand the sink back.
    pub fn stop(mut self) -> Result<(S, DispatchStats)> {
        self.stop.store(true, Ordering::SeqCst);
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("dispatcher already stopped"))?;
        join.join()
            .map_err(|_| anyhow!("event dispatcher thread panicked"))
    }
}

/// One attempt. A panicking sink costs the event, not the dispatcher.
fn deliver_once<S: EventSink>(sink: &mut S, event: &OccupancyEvent) -> Result<(), SlotError> {
    match panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SlotError::SinkDelivery(format!("{:#}", e))),
        Err(_) => Err(SlotError::SinkDelivery("sink panicked".to_string())),
    }
}
