//! Maintenance loop: refresh, revalidation, database snapshots and shutdown.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace};

use super::Table;
use crate::domain::{COPY_NODES_INTERVAL, REFRESH_INTERVAL, REVALIDATE_INTERVAL};

impl Table {
    /// Scheduler task. Exits on a close request.
    pub(super) async fn run(
        self: Arc<Self>,
        mut refresh_req: mpsc::Receiver<oneshot::Sender<()>>,
        mut close_req: mpsc::Receiver<()>,
    ) {
        let (refresh_done_tx, mut refresh_done) = mpsc::channel::<()>(1);
        let (revalidate_done_tx, mut revalidate_done) = mpsc::channel::<()>(1);

        let start = Instant::now();
        let mut refresh = time::interval_at(start + REFRESH_INTERVAL, REFRESH_INTERVAL);
        let mut copy_nodes = time::interval_at(start + COPY_NODES_INTERVAL, COPY_NODES_INTERVAL);
        let revalidate = time::sleep(self.next_revalidate_time());
        tokio::pin!(revalidate);
        let mut revalidating = false;

        // Callers blocked in `refresh()` until the running refresh ends.
        let mut waiting: Vec<oneshot::Sender<()>> = Vec::new();
        let mut refreshing: Option<JoinHandle<()>> =
            Some(self.spawn_refresh(refresh_done_tx.clone()));

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    self.seed_rand();
                    if refreshing.is_none() {
                        refreshing = Some(self.spawn_refresh(refresh_done_tx.clone()));
                    }
                }
                Some(req) = refresh_req.recv() => {
                    waiting.push(req);
                    if refreshing.is_none() {
                        refreshing = Some(self.spawn_refresh(refresh_done_tx.clone()));
                    }
                }
                Some(()) = refresh_done.recv() => {
                    refreshing = None;
                    self.init_done.send_replace(true);
                    for w in waiting.drain(..) {
                        let _ = w.send(());
                    }
                }
                () = &mut revalidate, if !revalidating => {
                    revalidating = true;
                    let tab = Arc::clone(&self);
                    let done = revalidate_done_tx.clone();
                    tokio::spawn(async move {
                        tab.do_revalidate().await;
                        let _ = done.send(()).await;
                    });
                }
                Some(()) = revalidate_done.recv() => {
                    revalidating = false;
                    revalidate
                        .as_mut()
                        .reset(Instant::now() + self.next_revalidate_time());
                }
                _ = copy_nodes.tick() => {
                    let tab = Arc::clone(&self);
                    tokio::task::spawn_blocking(move || tab.copy_bonded_nodes());
                }
                _ = close_req.recv() => break,
            }
        }

        self.net.close();
        if let Some(handle) = refreshing.take() {
            let _ = handle.await;
        }
        self.init_done.send_replace(true);
        for w in waiting.drain(..) {
            let _ = w.send(());
        }
        self.db.close();
        self.closed.send_replace(true);
        info!(table = %self.table_name(), "Discovery table closed");
    }

    fn spawn_refresh(self: &Arc<Self>, done: mpsc::Sender<()>) -> JoinHandle<()> {
        let tab = Arc::clone(self);
        tokio::spawn(async move {
            tab.do_refresh().await;
            let _ = done.send(()).await;
        })
    }

    /// Ask the scheduler for a refresh and wait until one completes.
    ///
    /// Returns immediately once the table is closed.
    pub(crate) async fn refresh(&self) {
        if *self.closed.borrow() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.refresh_req.send(tx).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Reload seeds, then let every store discover.
    async fn do_refresh(&self) {
        trace!("Refreshing discovery table");
        self.load_seed_nodes().await;
        for s in self.all_storages() {
            s.do_refresh(self).await;
        }
        debug!(entries = self.len(), "Refresh done");
    }

    async fn do_revalidate(&self) {
        for s in self.all_storages() {
            s.do_revalidate(self).await;
        }
    }

    fn copy_bonded_nodes(&self) {
        for s in self.all_storages() {
            s.copy_bonded_nodes();
        }
    }

    fn next_revalidate_time(&self) -> Duration {
        let max = REVALIDATE_INTERVAL.as_nanos() as u64;
        self.with_rand(|rng| Duration::from_nanos(rng.gen_range(0..max)))
    }

    /// Request shutdown and wait for the scheduler to finish it.
    pub(super) async fn shutdown(&self) {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return;
        }
        // A full queue means a close is already requested.
        let _ = self.close_req.try_send(());
        loop {
            let done = *closed.borrow_and_update();
            if done {
                return;
            }
            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}
