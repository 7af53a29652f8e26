use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::order::OrderContext;
use crate::venue::{FillHook, OrderStatus, StatusHook, VenueClient};

/// A callback that arrived before its order context was registered.
enum QueuedEvent {
    Fill {
        quantity: Decimal,
        price: Decimal,
    },
    Cancel {
        filled_size: Decimal,
    },
    Status {
        status: OrderStatus,
        total_filled: Decimal,
        price: Option<Decimal>,
    },
}

/// Routes per-order websocket callbacks to the owning [`OrderContext`].
///
/// Installed batch-scoped on every participating venue; originals are
/// captured at install time and restored by [`RouterGuard`] on drop, so
/// restoration happens whether the batch succeeds, fails, or panics.
///
/// Callbacks for order ids that are not registered yet are buffered per id
/// and replayed, in arrival order, on registration.
pub struct WebsocketRouter {
    self_ref: Weak<WebsocketRouter>,
    registry: Mutex<HashMap<String, Arc<OrderContext>>>,
    pending: Mutex<HashMap<String, Vec<QueuedEvent>>>,
}

impl WebsocketRouter {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            registry: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Install fill/status hooks on each venue, capturing the previous
    /// hooks in the returned guard.
    pub fn install(&self, venues: &[Arc<dyn VenueClient>]) -> RouterGuard {
        let mut saved = Vec::with_capacity(venues.len());
        for venue in venues {
            let fill_router = {
                let router = self.self_ref.clone();
                Arc::new(move |order_id: &str, price: Decimal, incremental: Decimal, _seq: Option<u64>| {
                    if let Some(router) = router.upgrade() {
                        router.on_fill(order_id, price, incremental);
                    }
                }) as FillHook
            };
            let status_router = {
                let router = self.self_ref.clone();
                Arc::new(move |order_id: &str, status: OrderStatus, total: Decimal, price: Option<Decimal>| {
                    if let Some(router) = router.upgrade() {
                        router.on_status(order_id, status, total, price);
                    }
                }) as StatusHook
            };

            let original_fill = venue.swap_fill_hook(Some(fill_router));
            let original_status = venue.swap_status_hook(Some(status_router));
            debug!("[WS] installed callback router on {}", venue.name());
            saved.push((venue.clone(), original_fill, original_status));
        }
        RouterGuard { saved }
    }

    /// Map an order id (client or venue-server alias) to its context and
    /// replay anything that queued up before registration.
    pub fn register(&self, order_id: &str, ctx: Arc<OrderContext>) {
        if order_id.is_empty() {
            return;
        }
        self.registry.lock().insert(order_id.to_string(), ctx.clone());

        let queued = self.pending.lock().remove(order_id);
        if let Some(events) = queued {
            debug!(
                "[WS] replaying {} queued callback(s) for {order_id}",
                events.len()
            );
            for event in events {
                Self::deliver(&ctx, order_id, event);
            }
        }
    }

    /// Register and then consult the venue's websocket cache: a
    /// cancellation that landed before registration must not be lost.
    pub async fn register_checked(&self, order_id: &str, ctx: &Arc<OrderContext>) {
        self.register(order_id, ctx.clone());
        match ctx.spec.venue.get_order_info(order_id, false).await {
            Ok(Some(info)) if info.status == OrderStatus::Canceled => {
                ctx.on_websocket_cancel(order_id, info.filled_size);
            }
            Ok(_) => {}
            Err(err) => debug!("[WS] cache check failed for {order_id}: {err}"),
        }
    }

    fn on_fill(&self, order_id: &str, price: Decimal, incremental: Decimal) {
        match self.lookup(order_id) {
            Some(ctx) => ctx.on_websocket_fill(order_id, incremental, Some(price)),
            None => {
                debug!("[WS] queued fill callback for unregistered order {order_id}");
                self.queue(order_id, QueuedEvent::Fill { quantity: incremental, price });
            }
        }
    }

    fn on_status(&self, order_id: &str, status: OrderStatus, total_filled: Decimal, price: Option<Decimal>) {
        match self.lookup(order_id) {
            Some(ctx) => Self::deliver(
                &ctx,
                order_id,
                QueuedEvent::Status {
                    status,
                    total_filled,
                    price,
                },
            ),
            None => {
                debug!("[WS] queued {status} status callback for unregistered order {order_id}");
                self.queue(
                    order_id,
                    QueuedEvent::Status {
                        status,
                        total_filled,
                        price,
                    },
                );
            }
        }
    }

    fn deliver(ctx: &Arc<OrderContext>, order_id: &str, event: QueuedEvent) {
        match event {
            QueuedEvent::Fill { quantity, price } => {
                ctx.on_websocket_fill(order_id, quantity, Some(price))
            }
            QueuedEvent::Cancel { filled_size } => ctx.on_websocket_cancel(order_id, filled_size),
            QueuedEvent::Status {
                status,
                total_filled,
                price,
            } => match status {
                OrderStatus::Canceled => ctx.on_websocket_cancel(order_id, total_filled),
                OrderStatus::Filled => ctx.on_websocket_total(order_id, total_filled, price),
                _ => {}
            },
        }
    }

    /// Entry point for venues that surface cancellation on a dedicated
    /// channel rather than the status stream.
    pub fn route_cancel(&self, order_id: &str, filled_size: Decimal) {
        match self.lookup(order_id) {
            Some(ctx) => ctx.on_websocket_cancel(order_id, filled_size),
            None => {
                warn!("[WS] queued cancel callback for unregistered order {order_id}");
                self.queue(order_id, QueuedEvent::Cancel { filled_size });
            }
        }
    }

    fn lookup(&self, order_id: &str) -> Option<Arc<OrderContext>> {
        self.registry.lock().get(order_id).cloned()
    }

    fn queue(&self, order_id: &str, event: QueuedEvent) {
        self.pending.lock().entry(order_id.to_string()).or_default().push(event);
    }
}

/// Restores the venues' original callbacks when dropped.
pub struct RouterGuard {
    saved: Vec<(Arc<dyn VenueClient>, Option<FillHook>, Option<StatusHook>)>,
}

impl Drop for RouterGuard {
    fn drop(&mut self) {
        for (venue, fill, status) in self.saved.drain(..) {
            venue.swap_fill_hook(fill);
            venue.swap_status_hook(status);
            debug!("[WS] restored original callbacks on {}", venue.name());
        }
    }
}
