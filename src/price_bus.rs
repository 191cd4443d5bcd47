// =============================================================================
// Price Bus — fans completed bars out to the position book and trailing
// =============================================================================
//
// The aggregator's completion callback publishes (symbol, close, timestamp)
// for every completed bar of the smallest target timeframe. A dedicated
// fanout task consumes the channel and, for each event, calls
// `PositionBook::update_price` and then `TrailingController::evaluate` — in
// that order, so the trailing controller always sees a fresh mark.
//
// The channel decouples the aggregator's symbol mutex from journal and
// indicator I/O: publishing is a non-blocking send, and the slow work
// happens on the consumer side.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::market_data::{AggregatedBar, Timeframe};
use crate::position_book::PositionBook;
use crate::trailing::TrailingController;

/// One completed-bar price event.
#[derive(Debug, Clone)]
pub struct PriceEvent {
    pub symbol: String,
    pub close: f64,
    /// Wall-clock moment the bar boundary was crossed; drives the position
    /// book's stale-tick ordering.
    pub timestamp: DateTime<Utc>,
}

/// Publishing half of the bus. Cheap to clone into the aggregator callback.
#[derive(Clone)]
pub struct PriceBus {
    tx: mpsc::UnboundedSender<PriceEvent>,
    /// Only bars of this timeframe are forwarded.
    drive_timeframe: Timeframe,
}

impl PriceBus {
    /// Create the bus and its consumer half.
    pub fn new(drive_timeframe: Timeframe) -> (Self, PriceFanout) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                drive_timeframe,
            },
            PriceFanout { rx },
        )
    }

    /// Publish a completed bar. Bars of other timeframes are ignored; a
    /// closed channel (engine shutting down) is a silent no-op.
    pub fn publish(&self, symbol: &str, timeframe: Timeframe, bar: &AggregatedBar) {
        if timeframe != self.drive_timeframe {
            return;
        }
        let event = PriceEvent {
            symbol: symbol.to_string(),
            close: bar.close,
            timestamp: Utc::now(),
        };
        let _ = self.tx.send(event);
    }
}

/// Consuming half of the bus; owned by the fanout task.
pub struct PriceFanout {
    rx: mpsc::UnboundedReceiver<PriceEvent>,
}

impl PriceFanout {
    /// Drain events until every publisher is dropped. Spawned once at engine
    /// startup.
    pub async fn run(mut self, book: Arc<PositionBook>, trailing: Arc<TrailingController>) {
        info!("price fanout started");
        while let Some(event) = self.rx.recv().await {
            debug!(
                symbol = %event.symbol,
                close = event.close,
                "price event"
            );
            book.update_price(&event.symbol, event.close, event.timestamp);
            trailing.evaluate(&event.symbol, event.close);
        }
        info!("price fanout stopped");
    }

    /// Synchronously drain everything currently queued. Test hook.
    #[cfg(test)]
    fn drain_now(&mut self, book: &PositionBook, trailing: &TrailingController) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            book.update_price(&event.symbol, event.close, event.timestamp);
            trailing.evaluate(&event.symbol, event.close);
            handled += 1;
        }
        handled
    }
}
