use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::ConfirmConfig;
use crate::venue::{OrderInfo, VenueClient};

/// Waits for a market order to reach a terminal state.
///
/// Websocket-first: the venue's cache is checked for a short window before
/// falling back to steady cache polling and one final REST refresh. If the
/// order never turns terminal, the last known state is returned.
pub struct ConfirmationWaiter {
    cfg: ConfirmConfig,
}

impl ConfirmationWaiter {
    pub fn new(cfg: ConfirmConfig) -> Self {
        Self { cfg }
    }

    pub async fn wait_for_confirmation(
        &self,
        venue: &Arc<dyn VenueClient>,
        order_id: Option<&str>,
    ) -> Option<OrderInfo> {
        let order_id = order_id?;
        let deadline = Instant::now() + self.cfg.timeout();
        let mut last_known: Option<OrderInfo> = None;

        // Phase 1: short websocket-cache window. Market orders usually land
        // here within a couple of cache updates.
        let ws_deadline = Instant::now() + self.cfg.ws_wait();
        while Instant::now() < ws_deadline {
            if let Ok(Some(info)) = venue.get_order_info(order_id, false).await {
                if info.status.is_terminal() {
                    return Some(info);
                }
                last_known = Some(info);
            }
            sleep(self.cfg.poll_interval()).await;
        }

        // Phase 2: keep polling the cache until the overall timeout.
        while Instant::now() < deadline {
            match venue.get_order_info(order_id, false).await {
                Ok(Some(info)) => {
                    if info.status.is_terminal() {
                        return Some(info);
                    }
                    last_known = Some(info);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("[CONFIRM] poll failed for {order_id} on {}: {err}", venue.name());
                }
            }
            sleep(self.cfg.poll_interval()).await;
        }

        // Phase 3: one forced REST refresh; the fill may have landed
        // between polls.
        match venue.get_order_info(order_id, true).await {
            Ok(Some(info)) => Some(info),
            _ => last_known,
        }
    }
}
