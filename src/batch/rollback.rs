use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::RollbackConfig;
use crate::error::ExecError;
use crate::order::{OrderContext, Side};
use crate::venue::VenueClient;

/// One filled leg handed to the rollback path.
#[derive(Clone)]
pub struct FilledLeg {
    pub venue: Arc<dyn VenueClient>,
    pub symbol: String,
    pub side: Side,
    pub filled_quantity: Decimal,
    pub fill_price: Option<Decimal>,
    pub order_id: Option<String>,
    pub reduce_only: bool,
    pub spec_quantity: Option<Decimal>,
}

/// A position discovered during rollback, with the side that flattens it.
struct CloseTarget {
    venue: Arc<dyn VenueClient>,
    symbol: String,
    close_side: Side,
    quantity: Decimal,
    entry_price: Decimal,
}

/// Emergency close of filled exposure, with verification.
///
/// Four stages: cancel open orders, discover actual exposure, close it with
/// reduce-only market orders, verify the venues report flat.
pub struct RollbackManager {
    cfg: RollbackConfig,
    fill_sanity_cap: Decimal,
}

impl RollbackManager {
    pub fn new(cfg: RollbackConfig, fill_sanity_cap: Decimal) -> Self {
        Self {
            cfg,
            fill_sanity_cap,
        }
    }

    /// Roll back a set of filled legs. Returns the total cost in USD
    /// (`|exit − entry| × qty` summed over closed legs).
    pub async fn rollback(&self, legs: &[FilledLeg]) -> Decimal {
        // A close operation is detected from the reduce_only flags: undoing
        // a close must query live positions, never "reverse" the close.
        let is_close = legs.iter().any(|leg| leg.reduce_only);
        if is_close {
            warn!(
                "[ROLLBACK] emergency rollback (close operation): querying live positions \
                 for {} leg(s)",
                legs.len()
            );
        } else {
            warn!(
                "[ROLLBACK] emergency rollback (open operation): closing {} filled leg(s)",
                legs.len()
            );
        }

        info!("[ROLLBACK] step 1/4: cancelling open orders");
        self.cancel_open_orders(legs).await;

        info!("[ROLLBACK] step 2/4: discovering actual exposure");
        let targets = if is_close {
            self.discover_close_exposure(legs).await
        } else {
            self.discover_open_exposure(legs).await
        };

        info!("[ROLLBACK] step 3/4: closing {} position(s)", targets.len());
        let total_cost = self.close_positions(&targets).await;

        info!("[ROLLBACK] step 4/4: verifying positions are closed");
        self.verify_closed(&targets).await;

        warn!("[ROLLBACK] complete; total cost ${total_cost:.2}");
        total_cost
    }

    /// Build the payload from contexts, run [`rollback`](Self::rollback),
    /// then zero the context fills so a second invocation closes nothing.
    pub async fn emergency_rollback(
        &self,
        contexts: &[Arc<OrderContext>],
        reason: &str,
        imbalance_tokens: Decimal,
        imbalance_pct: Decimal,
    ) -> Decimal {
        let mut payload = Vec::new();
        for ctx in contexts {
            let filled = ctx.filled_quantity();
            if filled <= Decimal::ZERO {
                continue;
            }
            let Some(report) = ctx.report() else { continue };

            // Sanity: a context claiming more than spec x cap is tracking a
            // bug, not a position. Closing it would create new exposure.
            if let Some(spec_qty) = ctx.spec.quantity {
                if filled > spec_qty * self.fill_sanity_cap {
                    error!(
                        "[ROLLBACK] skipping {} {} ({}): filled_quantity {filled} exceeds \
                         spec {spec_qty} beyond the sanity cap",
                        ctx.spec.venue_name(),
                        ctx.spec.symbol,
                        ctx.spec.side
                    );
                    continue;
                }
            }

            payload.push(FilledLeg {
                venue: ctx.spec.venue.clone(),
                symbol: ctx.spec.symbol.clone(),
                side: ctx.spec.side,
                filled_quantity: filled,
                fill_price: report.fill_price,
                order_id: report.order_id,
                reduce_only: ctx.spec.reduce_only,
                spec_quantity: ctx.spec.quantity,
            });
        }

        let cost = self.rollback(&payload).await;
        warn!(
            "[ROLLBACK] emergency rollback ({reason}) done; cost ${cost:.4}; \
             prevented {imbalance_tokens:.6} tokens ({:.2}%) imbalance",
            imbalance_pct * Decimal::from(100)
        );

        // Prevent any later path from re-triggering a rollback on the same
        // fills.
        for ctx in contexts {
            ctx.reset_fills();
        }
        cost
    }

    async fn cancel_open_orders(&self, legs: &[FilledLeg]) {
        let cancels = legs.iter().filter_map(|leg| {
            let order_id = leg.order_id.clone()?;
            let venue = leg.venue.clone();
            Some(async move {
                if let Err(err) = venue.cancel(&order_id).await {
                    warn!("[ROLLBACK] cancel failed for {order_id}: {err}");
                }
            })
        });
        join_all(cancels).await;
        sleep(self.cfg.cancel_settle()).await;
    }

    /// Close operation: the truth is whatever is still open at the venue.
    async fn discover_close_exposure(&self, legs: &[FilledLeg]) -> Vec<CloseTarget> {
        let mut targets = Vec::new();
        for leg in legs {
            match leg.venue.get_position_snapshot(&leg.symbol).await {
                Ok(Some(snapshot)) => {
                    let size = snapshot.quantity.abs();
                    if size <= self.cfg.residual_tolerance {
                        info!(
                            "[ROLLBACK] [{}] {}: no open position (already closed)",
                            leg.venue.name(),
                            leg.symbol
                        );
                        continue;
                    }
                    let close_side = if snapshot.quantity > Decimal::ZERO {
                        Side::Sell
                    } else {
                        Side::Buy
                    };
                    info!(
                        "[ROLLBACK] [{}] {}: open position {size} tokens, closing via {close_side}",
                        leg.venue.name(),
                        leg.symbol
                    );
                    targets.push(CloseTarget {
                        venue: leg.venue.clone(),
                        symbol: leg.symbol.clone(),
                        close_side,
                        quantity: size,
                        entry_price: snapshot.entry_price.unwrap_or(Decimal::ZERO),
                    });
                }
                Ok(None) => {
                    info!(
                        "[ROLLBACK] [{}] {}: no position snapshot (likely flat)",
                        leg.venue.name(),
                        leg.symbol
                    );
                }
                Err(err) => {
                    error!(
                        "[ROLLBACK] [{}] position query failed for {}: {err}",
                        leg.venue.name(),
                        leg.symbol
                    );
                    // Fall back to the reported fill; reverse the close leg.
                    if leg.filled_quantity > Decimal::ZERO {
                        warn!(
                            "[ROLLBACK] falling back to reported fill {} for {}",
                            leg.filled_quantity, leg.symbol
                        );
                        targets.push(CloseTarget {
                            venue: leg.venue.clone(),
                            symbol: leg.symbol.clone(),
                            close_side: leg.side.opposite(),
                            quantity: leg.filled_quantity,
                            entry_price: leg.fill_price.unwrap_or(Decimal::ZERO),
                        });
                    }
                }
            }
        }
        targets
    }

    /// Open operation: undo reported fills, then sweep snapshots for
    /// anything the payload missed.
    async fn discover_open_exposure(&self, legs: &[FilledLeg]) -> Vec<CloseTarget> {
        let mut targets: Vec<CloseTarget> = Vec::new();

        for leg in legs {
            // Reject bogus payload entries outright.
            if let Some(spec_qty) = leg.spec_quantity {
                if leg.filled_quantity > spec_qty * self.fill_sanity_cap {
                    error!(
                        "[ROLLBACK] rejecting payload entry for {}: quantity {} exceeds \
                         spec {spec_qty} beyond the sanity cap",
                        leg.symbol, leg.filled_quantity
                    );
                    continue;
                }
            }

            // One verification read against the order ledger.
            let mut actual_quantity = leg.filled_quantity;
            if let Some(order_id) = &leg.order_id {
                match leg.venue.get_order_info(order_id, false).await {
                    Ok(Some(info)) if info.filled_size > Decimal::ZERO => {
                        if (info.filled_size - leg.filled_quantity).abs()
                            > self.cfg.residual_tolerance
                        {
                            warn!(
                                "[ROLLBACK] fill amount changed for {}: {} -> {}",
                                leg.symbol, leg.filled_quantity, info.filled_size
                            );
                        }
                        actual_quantity = info.filled_size;
                    }
                    Ok(_) => {
                        if leg.filled_quantity > Decimal::ZERO {
                            warn!(
                                "[ROLLBACK] venue reported 0 filled for {} after cancel; \
                                 using tracked quantity {}",
                                leg.symbol, leg.filled_quantity
                            );
                        }
                    }
                    Err(err) => {
                        warn!("[ROLLBACK] order info lookup failed for {}: {err}", leg.symbol)
                    }
                }
            }
            if actual_quantity <= Decimal::ZERO {
                warn!("[ROLLBACK] skipping close for {}: no filled quantity", leg.symbol);
                continue;
            }

            targets.push(CloseTarget {
                venue: leg.venue.clone(),
                symbol: leg.symbol.clone(),
                close_side: leg.side.opposite(),
                quantity: actual_quantity,
                entry_price: leg.fill_price.unwrap_or(Decimal::ZERO),
            });
        }

        // Defense in depth: any open position the payload does not account
        // for gets closed too, and snapshots win quantity disagreements.
        let mut checked: HashSet<(String, String)> = HashSet::new();
        for leg in legs {
            let key = (leg.venue.name().to_string(), leg.symbol.clone());
            if !checked.insert(key) {
                continue;
            }
            let snapshot = match leg.venue.get_position_snapshot(&leg.symbol).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(err) => {
                    debug!(
                        "[ROLLBACK] [{}] snapshot sweep failed for {}: {err}",
                        leg.venue.name(),
                        leg.symbol
                    );
                    continue;
                }
            };
            let size = snapshot.quantity.abs();
            if size <= self.cfg.residual_tolerance {
                continue;
            }
            let close_side = if snapshot.quantity > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            };

            match targets
                .iter_mut()
                .find(|t| t.symbol == leg.symbol && t.venue.name() == leg.venue.name())
            {
                Some(existing) => {
                    if (size - existing.quantity).abs() > self.cfg.residual_tolerance {
                        warn!(
                            "[ROLLBACK] [{}] position size mismatch for {}: tracked {}, \
                             actual {size}; using the snapshot",
                            leg.venue.name(),
                            leg.symbol,
                            existing.quantity
                        );
                        existing.quantity = size;
                    }
                }
                None => {
                    warn!(
                        "[ROLLBACK] [{}] safety catch: untracked {close_side}-closable position \
                         of {size} tokens for {} not in rollback payload",
                        leg.venue.name(),
                        leg.symbol
                    );
                    targets.push(CloseTarget {
                        venue: leg.venue.clone(),
                        symbol: leg.symbol.clone(),
                        close_side,
                        quantity: size,
                        entry_price: snapshot.entry_price.unwrap_or(Decimal::ZERO),
                    });
                }
            }
        }

        targets
    }

    /// Close all targets concurrently with reduce-only market orders and
    /// price the damage.
    async fn close_positions(&self, targets: &[CloseTarget]) -> Decimal {
        let closes = targets.iter().map(|target| {
            let venue = target.venue.clone();
            let symbol = target.symbol.clone();
            let side = target.close_side;
            let quantity = target.quantity;
            async move {
                let contract_id = venue.resolve_contract_id(&symbol);
                info!(
                    "[ROLLBACK] closing {symbol} on {}: {side} {quantity} @ market (reduce-only)",
                    venue.name()
                );
                venue.place_market(&contract_id, quantity, side, true).await
            }
        });
        let results = join_all(closes).await;
        sleep(self.cfg.close_settle()).await;

        let mut total_cost = Decimal::ZERO;
        for (target, result) in targets.iter().zip(results) {
            let ack = match result {
                Ok(ack) if ack.success => ack,
                Ok(ack) => {
                    warn!(
                        "[ROLLBACK] close order refused for {}: {}",
                        target.symbol,
                        ack.error_message.as_deref().unwrap_or("unknown")
                    );
                    continue;
                }
                Err(err) => {
                    warn!("[ROLLBACK] close order failed for {}: {err}", target.symbol);
                    continue;
                }
            };

            // One forced refresh for the true exit price; the placement ack
            // often carries none.
            let mut exit_price = ack.price;
            if let Some(order_id) = &ack.order_id {
                if let Ok(Some(info)) = target.venue.get_order_info(order_id, true).await {
                    if let Some(price) = info.price.filter(|p| *p > Decimal::ZERO) {
                        exit_price = Some(price);
                    }
                }
            }
            let exit_price = match exit_price {
                Some(price) => price,
                None => {
                    warn!(
                        "[ROLLBACK] [{}] could not determine exit price for {}; \
                         using entry (cost may be inaccurate)",
                        target.venue.name(),
                        target.symbol
                    );
                    target.entry_price
                }
            };

            let cost = (exit_price - target.entry_price).abs() * target.quantity;
            total_cost += cost;
            warn!(
                "[ROLLBACK] cost for {}: ${cost:.2} (entry ${}, exit ${exit_price})",
                target.symbol, target.entry_price
            );
        }
        total_cost
    }

    /// Re-query each affected position; anything still open gets one
    /// emergency reduce-only close and a fatal-anomaly log.
    async fn verify_closed(&self, targets: &[CloseTarget]) {
        for target in targets {
            let snapshot = match target.venue.get_position_snapshot(&target.symbol).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(
                        "[ROLLBACK] [{}] could not verify closure for {}: {err}",
                        target.venue.name(),
                        target.symbol
                    );
                    continue;
                }
            };
            let Some(snapshot) = snapshot else {
                debug!(
                    "[ROLLBACK] [{}] {}: no snapshot (likely closed)",
                    target.venue.name(),
                    target.symbol
                );
                continue;
            };

            let residual = snapshot.quantity.abs();
            if residual <= self.cfg.residual_tolerance {
                info!(
                    "[ROLLBACK] [{}] {}: position verified closed",
                    target.venue.name(),
                    target.symbol
                );
                continue;
            }

            error!(
                "[ROLLBACK] [{}] {}",
                target.venue.name(),
                ExecError::RollbackAnomaly(format!(
                    "{} still shows {} tokens after close; placing emergency close",
                    target.symbol, snapshot.quantity
                ))
            );
            let close_side = if snapshot.quantity > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            };
            let contract_id = target.venue.resolve_contract_id(&target.symbol);
            match target
                .venue
                .place_market(&contract_id, residual, close_side, true)
                .await
            {
                Ok(ack) if ack.success => info!(
                    "[ROLLBACK] [{}] emergency close placed: {}",
                    target.venue.name(),
                    ack.order_id.as_deref().unwrap_or("?")
                ),
                Ok(ack) => error!(
                    "[ROLLBACK] [{}] emergency close refused: {}",
                    target.venue.name(),
                    ack.error_message.as_deref().unwrap_or("unknown")
                ),
                Err(err) => error!(
                    "[ROLLBACK] [{}] emergency close failed: {err}",
                    target.venue.name()
                ),
            }
        }
    }
}
