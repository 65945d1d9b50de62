//! Local view of in-flight orders and the position-flip split policy.
//!
//! Two parties touch order state. The control loop submits through an
//! [`OrderRouter`]; the broker stream side runs a [`Reconciler`] that applies
//! trade updates. They share only the [`OpenOrders`] table and talk over an
//! unbounded channel of [`ReconcileMsg`]. Pending second legs of split orders
//! are owned by the reconciler alone.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::{
    asset::Asset,
    backend::{TradeEvent, TradeUpdate},
    error::Result,
    order::{Order, OrderId, OrderStyle},
};

/// Where orders physically go.
pub trait OrderGateway: Send + Sync {
    fn submit(&self, id: OrderId, asset: &Asset, amount: i64, style: &OrderStyle) -> Result<Order>;
    fn cancel(&self, id: &OrderId) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPlan {
    Direct(i64),
    /// Flatten first, then the remainder once the first leg fills.
    Split { first: i64, remainder: i64 },
}

pub fn plan_split(position: i64, requested: i64, flip_compatible: bool) -> SplitPlan {
    let crosses_zero = requested.signum() * position.signum() < 0;
    if flip_compatible && crosses_zero && requested.abs() > position.abs() {
        SplitPlan::Split {
            first: -position,
            remainder: requested + position,
        }
    } else {
        SplitPlan::Direct(requested)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSplit {
    pub asset: Asset,
    pub amount: i64,
    pub style: OrderStyle,
}

#[derive(Debug)]
pub enum ReconcileMsg {
    SplitRegistered { id: OrderId, leg: PendingSplit },
    SplitAbandoned(OrderId),
    Trade(TradeUpdate),
}

#[derive(Debug, Default)]
struct OpenOrdersInner {
    orders: FxHashMap<OrderId, Order>,
    /// Ids that reached a terminal state; late snapshots must not reopen them.
    closed: FxHashSet<OrderId>,
}

/// Orders believed open at the broker.
#[derive(Debug, Clone, Default)]
pub struct OpenOrders {
    inner: Arc<Mutex<OpenOrdersInner>>,
}

impl OpenOrders {
    fn lock(&self) -> MutexGuard<'_, OpenOrdersInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a freshly submitted order.
    pub fn insert(&self, order: Order) {
        let mut inner = self.lock();
        if inner.closed.contains(&order.id) {
            return;
        }
        if order.open() {
            inner.orders.insert(order.id.clone(), order);
        } else {
            inner.orders.remove(&order.id);
            inner.closed.insert(order.id);
        }
    }

    pub fn apply(&self, update: &TradeUpdate) {
        let mut inner = self.lock();
        let id = &update.order.id;
        if update.event.is_terminal() {
            inner.orders.remove(id);
            inner.closed.insert(id.clone());
        } else if !inner.closed.contains(id) {
            inner.orders.insert(id.clone(), update.order.clone());
        }
    }

    /// Replaces the table with the broker's own list of open orders.
    ///
    /// Tombstones survive only for ids the snapshot still lists.
    pub fn reset(&self, broker_open: impl IntoIterator<Item = Order>) {
        let mut inner = self.lock();
        let OpenOrdersInner { orders, closed } = &mut *inner;
        orders.clear();
        let mut seen = FxHashSet::default();
        for order in broker_open {
            seen.insert(order.id.clone());
            if !closed.contains(&order.id) && order.open() {
                orders.insert(order.id.clone(), order);
            }
        }
        closed.retain(|id| seen.contains(id));
    }

    #[cfg(test)]
    fn closed_len(&self) -> usize {
        self.lock().closed.len()
    }

    pub fn get(&self, id: &OrderId) -> Option<Order> {
        self.lock().orders.get(id).cloned()
    }

    pub fn contains(&self, id: &OrderId) -> bool {
        self.lock().orders.contains_key(id)
    }

    pub fn snapshot(&self) -> FxHashMap<OrderId, Order> {
        self.lock().orders.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn submit_logged(gateway: &dyn OrderGateway, open: &OpenOrders, id: OrderId, asset: &Asset, amount: i64, style: &OrderStyle) -> Option<Order> {
    match gateway.submit(id.clone(), asset, amount, style) {
        Ok(order) => {
            open.insert(order.clone());
            Some(order)
        }
        Err(e) => {
            tracing::warn!("Order {id} for {amount} {} was not accepted: {e}", asset.symbol);
            None
        }
    }
}

/// Control-loop side of order submission.
#[derive(Clone)]
pub struct OrderRouter {
    gateway: Arc<dyn OrderGateway>,
    open_orders: OpenOrders,
    tx: UnboundedSender<ReconcileMsg>,
}

impl OrderRouter {
    pub fn new(gateway: Arc<dyn OrderGateway>, open_orders: OpenOrders, tx: UnboundedSender<ReconcileMsg>) -> Self {
        Self {
            gateway,
            open_orders,
            tx,
        }
    }

    pub fn open_orders(&self) -> &OpenOrders {
        &self.open_orders
    }

    fn send(&self, msg: ReconcileMsg) {
        if let Err(e) = self.tx.send(msg) {
            tracing::error!("Reconciler is gone, dropping {:?}", e.0);
        }
    }

    /// Submits `amount` given the current `position`. Returns the first
    /// physical order, or `None` when the broker refused it.
    pub fn submit(
        &self,
        asset: &Asset,
        amount: i64,
        style: &OrderStyle,
        position: i64,
        flip_compatible: bool,
    ) -> Option<Order> {
        match plan_split(position, amount, flip_compatible) {
            SplitPlan::Direct(amount) => submit_logged(
                self.gateway.as_ref(),
                &self.open_orders,
                OrderId::generate(),
                asset,
                amount,
                style,
            ),
            SplitPlan::Split { first, remainder } => {
                let id = OrderId::generate();
                tracing::info!(
                    "Splitting {amount} {} against position {position}: {first} now, {remainder} after fill",
                    asset.symbol
                );
                // registered before submitting so a fast fill finds it
                self.send(ReconcileMsg::SplitRegistered {
                    id: id.clone(),
                    leg: PendingSplit {
                        asset: asset.clone(),
                        amount: remainder,
                        style: *style,
                    },
                });
                let order = submit_logged(self.gateway.as_ref(), &self.open_orders, id.clone(), asset, first, style);
                if order.is_none() {
                    self.send(ReconcileMsg::SplitAbandoned(id));
                }
                order
            }
        }
    }

    pub fn cancel(&self, id: &OrderId) -> Result<()> {
        self.gateway.cancel(id)
    }
}

/// Broker-stream side: applies trade updates and replays split remainders.
pub struct Reconciler {
    gateway: Arc<dyn OrderGateway>,
    open_orders: OpenOrders,
    pending: FxHashMap<OrderId, PendingSplit>,
    rx: UnboundedReceiver<ReconcileMsg>,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn OrderGateway>, open_orders: OpenOrders, rx: UnboundedReceiver<ReconcileMsg>) -> Self {
        Self {
            gateway,
            open_orders,
            pending: FxHashMap::default(),
            rx,
        }
    }

    pub fn pending(&self) -> &FxHashMap<OrderId, PendingSplit> {
        &self.pending
    }

    pub fn handle(&mut self, msg: ReconcileMsg) {
        match msg {
            ReconcileMsg::SplitRegistered { id, leg } => {
                self.pending.insert(id, leg);
            }
            ReconcileMsg::SplitAbandoned(id) => {
                self.pending.remove(&id);
            }
            ReconcileMsg::Trade(update) => self.on_trade(update),
        }
    }

    fn on_trade(&mut self, update: TradeUpdate) {
        tracing::debug!("Trade update {:?} for order {}", update.event, update.order.id);
        self.open_orders.apply(&update);
        let id = &update.order.id;
        match update.event {
            TradeEvent::Fill => {
                if let Some(leg) = self.pending.remove(id) {
                    tracing::info!("Order {id} filled, submitting remaining {} {}", leg.amount, leg.asset.symbol);
                    submit_logged(
                        self.gateway.as_ref(),
                        &self.open_orders,
                        OrderId::generate(),
                        &leg.asset,
                        leg.amount,
                        &leg.style,
                    );
                }
            }
            TradeEvent::Canceled | TradeEvent::Rejected => {
                if let Some(leg) = self.pending.remove(id) {
                    tracing::info!(
                        "Order {id} ended as {:?}, dropping remaining {} {}",
                        update.event,
                        leg.amount,
                        leg.asset.symbol
                    );
                }
            }
            TradeEvent::New | TradeEvent::PartialFill | TradeEvent::Held => {}
        }
    }

    /// Handles whatever is queued without waiting. Returns the number of messages.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    self.handle(msg);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return handled,
            }
        }
    }

    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg);
        }
        tracing::info!("Trade update stream closed with {} pending splits", self.pending.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::Utc;
    use tokio::sync::mpsc;

    /// Accepts everything unless told to fail, remembering what it saw.
    #[derive(Default)]
    struct RecordingGateway {
        submitted: Mutex<Vec<(OrderId, i64)>>,
        fail: Mutex<bool>,
    }

    impl OrderGateway for RecordingGateway {
        fn submit(&self, id: OrderId, asset: &Asset, amount: i64, style: &OrderStyle) -> Result<Order> {
            if *self.fail.lock().unwrap() {
                return Err(Error::Http {
                    status: 403,
                    message: "insufficient buying power".into(),
                });
            }
            self.submitted.lock().unwrap().push((id.clone(), amount));
            Ok(Order::new(id, Utc::now(), asset.clone(), amount, *style))
        }

        fn cancel(&self, _id: &OrderId) -> Result<()> {
            Ok(())
        }
    }

    fn create_test_pair() -> (Arc<RecordingGateway>, OrderRouter, Reconciler) {
        let gateway = Arc::new(RecordingGateway::default());
        let open = OpenOrders::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let router = OrderRouter::new(gateway.clone(), open.clone(), tx);
        let reconciler = Reconciler::new(gateway.clone(), open, rx);
        (gateway, router, reconciler)
    }

    fn update(event: TradeEvent, order: &Order) -> ReconcileMsg {
        let mut order = order.clone();
        match event {
            TradeEvent::Fill => {
                order.apply_fill(order.amount.unsigned_abs());
            }
            TradeEvent::Canceled => order.set_broker_status(crate::order::OrderStatus::Cancelled),
            TradeEvent::Rejected => order.set_broker_status(crate::order::OrderStatus::Rejected),
            _ => {}
        }
        ReconcileMsg::Trade(TradeUpdate { event, order })
    }

    #[test]
    fn test_plan_split() {
        assert_eq!(plan_split(10, -15, true), SplitPlan::Split { first: -10, remainder: -5 });
        assert_eq!(plan_split(-4, 9, true), SplitPlan::Split { first: 4, remainder: 5 });
        assert_eq!(plan_split(10, -15, false), SplitPlan::Direct(-15));
        assert_eq!(plan_split(10, -10, true), SplitPlan::Direct(-10));
        assert_eq!(plan_split(10, 5, true), SplitPlan::Direct(5));
        assert_eq!(plan_split(0, -5, true), SplitPlan::Direct(-5));
    }

    #[test]
    fn test_split_replays_remainder_on_fill() {
        let (gateway, router, mut reconciler) = create_test_pair();
        let asset = Asset::new(1, "AAPL");

        let first = router.submit(&asset, -15, &OrderStyle::Market, 10, true).unwrap();
        assert_eq!(first.amount, -10);
        reconciler.drain();
        assert_eq!(reconciler.pending()[&first.id].amount, -5);
        assert!(router.open_orders().contains(&first.id));

        reconciler.handle(update(TradeEvent::Fill, &first));
        assert!(reconciler.pending().is_empty());
        assert!(!router.open_orders().contains(&first.id));

        let submitted = gateway.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].1, -5);
        assert!(router.open_orders().contains(&submitted[1].0));
    }

    #[test]
    fn test_split_dropped_on_cancel_or_reject() {
        for event in [TradeEvent::Canceled, TradeEvent::Rejected] {
            let (gateway, router, mut reconciler) = create_test_pair();
            let asset = Asset::new(1, "AAPL");
            let first = router.submit(&asset, 20, &OrderStyle::Market, -5, true).unwrap();
            assert_eq!(first.amount, 5);
            reconciler.drain();

            reconciler.handle(update(event, &first));
            assert!(reconciler.pending().is_empty());
            assert!(router.open_orders().is_empty());
            assert_eq!(gateway.submitted.lock().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_failed_first_leg_abandons_split() {
        let (gateway, router, mut reconciler) = create_test_pair();
        *gateway.fail.lock().unwrap() = true;
        let asset = Asset::new(1, "AAPL");
        assert!(router.submit(&asset, -15, &OrderStyle::Market, 10, true).is_none());
        assert_eq!(reconciler.drain(), 2);
        assert!(reconciler.pending().is_empty());
        assert!(router.open_orders().is_empty());
    }

    #[test]
    fn test_failed_replay_is_not_retried() {
        let (gateway, router, mut reconciler) = create_test_pair();
        let asset = Asset::new(1, "AAPL");
        let first = router.submit(&asset, -15, &OrderStyle::Market, 10, true).unwrap();
        reconciler.drain();
        *gateway.fail.lock().unwrap() = true;
        reconciler.handle(update(TradeEvent::Fill, &first));
        assert!(reconciler.pending().is_empty());
        assert!(router.open_orders().is_empty());
        assert_eq!(gateway.submitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_partial_fill_updates_snapshot() {
        let (_gateway, router, mut reconciler) = create_test_pair();
        let asset = Asset::new(1, "AAPL");
        let order = router.submit(&asset, 10, &OrderStyle::Market, 0, true).unwrap();
        let mut partial = order.clone();
        partial.apply_fill(4);
        reconciler.handle(ReconcileMsg::Trade(TradeUpdate {
            event: TradeEvent::PartialFill,
            order: partial,
        }));
        assert_eq!(router.open_orders().get(&order.id).unwrap().filled, 4);
    }

    #[test]
    fn test_terminal_update_before_insert_does_not_resurrect() {
        let open = OpenOrders::default();
        let order = Order::new(OrderId::generate(), Utc::now(), Asset::new(1, "AAPL"), 10, OrderStyle::Market);
        let mut filled = order.clone();
        filled.apply_fill(10);
        open.apply(&TradeUpdate {
            event: TradeEvent::Fill,
            order: filled,
        });
        open.insert(order.clone());
        assert!(!open.contains(&order.id));
        open.reset([order.clone()]);
        assert!(open.is_empty());
    }

    #[test]
    fn test_resync_prunes_tombstones() {
        let open = OpenOrders::default();
        let asset = Asset::new(1, "AAPL");
        let orders: Vec<Order> = (0..50)
            .map(|_| Order::new(OrderId::generate(), Utc::now(), asset.clone(), 10, OrderStyle::Market))
            .collect();
        for order in &orders {
            open.insert(order.clone());
            let mut filled = order.clone();
            filled.apply_fill(10);
            open.apply(&TradeUpdate {
                event: TradeEvent::Fill,
                order: filled,
            });
        }
        assert_eq!(open.closed_len(), 50);

        // a stale snapshot still listing one finished order keeps its tombstone
        open.reset([orders[0].clone()]);
        assert_eq!(open.closed_len(), 1);
        assert!(open.is_empty());

        open.reset([]);
        assert_eq!(open.closed_len(), 0);
    }

    #[tokio::test]
    async fn test_reconciler_task_replays_from_stream() {
        let (gateway, router, reconciler) = create_test_pair();
        let asset = Asset::new(1, "AAPL");
        let first = router.submit(&asset, -15, &OrderStyle::Market, 10, true).unwrap();
        let tx = router.tx.clone();
        let handle = tokio::spawn(reconciler.run());
        tx.send(update(TradeEvent::Fill, &first)).unwrap();
        drop(tx);
        drop(router);
        handle.await.unwrap();
        assert_eq!(gateway.submitted.lock().unwrap().len(), 2);
    }
}
