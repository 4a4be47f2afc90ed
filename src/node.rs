//! The gossip control loop.
//!
//! One cooperative task per participant: a heartbeat drives the sync pull
//! and eager-sync push, incoming RPCs and submitted transactions arrive on
//! channels, and the consensus engine runs to completion between messages.
use crate::config::Config;
use crate::core::Core;
use crate::error::Error;
use crate::net::{
    EagerSyncRequest, EagerSyncResponse, InmemTransport, Request, Response, Rpc, SyncRequest,
    SyncResponse,
};
use crate::peers::{PeerSelector, RandomPeerSelector};
use crate::proxy::AppProxy;
use crate::store::Store;
use async_std::channel::Receiver;
use async_std::task;
use futures::FutureExt;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    Babbling,
    CatchingUp,
    Shutdown,
}

enum Input {
    HeartbeatTick,
    Rpc(Rpc),
    Submit(Vec<u8>),
    Shutdown,
}

pub struct Node<S: Store> {
    id: String,
    core: Core<S>,
    selector: RandomPeerSelector,
    transport: InmemTransport,
    rpc_rx: Receiver<Rpc>,
    shutdown_rx: Receiver<()>,
    proxy: AppProxy,
    heartbeat: Duration,
    sync_limit: i64,
    state: NodeState,
    submit_backlog: VecDeque<Vec<u8>>,
}

impl<S: Store> Node<S> {
    pub fn new(
        core: Core<S>,
        selector: RandomPeerSelector,
        transport: InmemTransport,
        rpc_rx: Receiver<Rpc>,
        shutdown_rx: Receiver<()>,
        proxy: AppProxy,
        config: &Config,
    ) -> Self {
        let id = core.id().to_string();
        Self {
            id,
            core,
            selector,
            transport,
            rpc_rx,
            shutdown_rx,
            proxy,
            heartbeat: config.heartbeat,
            sync_limit: config.sync_limit,
            state: NodeState::Babbling,
            submit_backlog: VecDeque::new(),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Drive the main loop until shutdown.
    pub async fn run(mut self) -> Result<(), Error> {
        info!("{}: starting", self.id);
        loop {
            let input = {
                let heartbeat = task::sleep(self.heartbeat).fuse();
                let rpc = self.rpc_rx.recv().fuse();
                let submit = self.proxy.recv_submit().fuse();
                let shutdown = self.shutdown_rx.recv().fuse();
                futures::pin_mut!(heartbeat, rpc, submit, shutdown);
                futures::select! {
                    _ = heartbeat => Input::HeartbeatTick,
                    rpc = rpc => match rpc {
                        Ok(rpc) => Input::Rpc(rpc),
                        Err(_) => Input::Shutdown,
                    },
                    tx = submit => match tx {
                        Ok(tx) => Input::Submit(tx),
                        Err(_) => Input::Shutdown,
                    },
                    _ = shutdown => Input::Shutdown,
                }
            };
            match input {
                Input::HeartbeatTick => {
                    self.retry_submit_backlog().await;
                    if let Err(e) = self.commit_pending().await {
                        warn!("{}: commit retry failed: {}", self.id, e);
                    }
                    if let Err(e) = self.gossip().await {
                        debug!("{}: gossip round failed: {}", self.id, e);
                    }
                }
                Input::Rpc(rpc) => self.handle_rpc(rpc).await,
                Input::Submit(tx) => self.handle_submit(tx).await,
                Input::Shutdown => {
                    self.state = NodeState::Shutdown;
                    break;
                }
            }
        }
        info!("{}: stopped", self.id);
        Ok(())
    }

    /// One heartbeat: pull from a random peer, ingest, then push back what
    /// the peer is missing.
    async fn gossip(&mut self) -> Result<(), Error> {
        let peer = match self.selector.next() {
            Some(peer) => peer,
            None => return Ok(()),
        };
        let request = SyncRequest {
            from_id: self.id.clone(),
            known: self.core.known_events(),
        };
        let response = self.transport.sync(&peer.id, request).await?;
        self.selector.update_last(&peer.id);

        if response.sync_limit {
            warn!("{}: too far behind {}, catch-up required", self.id, peer.id);
            self.state = NodeState::CatchingUp;
            return Ok(());
        }
        if !response.events.is_empty() {
            debug!(
                "{}: pulled {} events from {}",
                self.id,
                response.events.len(),
                peer.id
            );
            self.core.sync(&response.events)?;
            self.run_consensus().await?;
        }
        self.state = NodeState::Babbling;

        let diff = self.core.event_diff(&response.known)?;
        if !diff.is_empty() {
            let events = self.core.to_wire(&diff)?;
            let request = EagerSyncRequest {
                from_id: self.id.clone(),
                events,
            };
            let response = self.transport.eager_sync(&peer.id, request).await?;
            if !response.success {
                warn!("{}: eager sync rejected by {}", self.id, peer.id);
            }
        }
        Ok(())
    }

    async fn handle_rpc(&mut self, rpc: Rpc) {
        match rpc.request {
            Request::Sync(request) => {
                let response = self.handle_sync_request(request);
                let _ = rpc.resp.send(Response::Sync(response)).await;
            }
            Request::EagerSync(request) => {
                let response = self.handle_eager_sync_request(request).await;
                let _ = rpc.resp.send(Response::EagerSync(response)).await;
            }
        }
    }

    fn handle_sync_request(&mut self, request: SyncRequest) -> SyncResponse {
        let known = self.core.known_events();
        if self.core.over_sync_limit(&request.known, self.sync_limit) {
            return SyncResponse {
                from_id: self.id.clone(),
                sync_limit: true,
                events: Vec::new(),
                known,
            };
        }
        let events = self
            .core
            .event_diff(&request.known)
            .and_then(|diff| self.core.to_wire(&diff));
        match events {
            Ok(events) => SyncResponse {
                from_id: self.id.clone(),
                sync_limit: false,
                events,
                known,
            },
            Err(e) => {
                // the requester's window fell behind our cache
                warn!("{}: cannot serve diff for {}: {}", self.id, request.from_id, e);
                SyncResponse {
                    from_id: self.id.clone(),
                    sync_limit: true,
                    events: Vec::new(),
                    known,
                }
            }
        }
    }

    async fn handle_eager_sync_request(&mut self, request: EagerSyncRequest) -> EagerSyncResponse {
        let success = match self.core.sync(&request.events) {
            Ok(()) => match self.run_consensus().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("{}: consensus after eager sync failed: {}", self.id, e);
                    true
                }
            },
            Err(e) => {
                warn!(
                    "{}: rejecting {} events from {}: {}",
                    self.id,
                    request.events.len(),
                    request.from_id,
                    e
                );
                false
            }
        };
        EagerSyncResponse {
            from_id: self.id.clone(),
            success,
        }
    }

    async fn handle_submit(&mut self, tx: Vec<u8>) {
        match self.proxy.validate_tx(tx.clone()).await {
            Ok(true) => self.core.add_transactions(vec![tx]),
            Ok(false) => warn!("{}: transaction rejected by the application", self.id),
            Err(_) => {
                // validation deadline missed, retry on the next tick
                self.submit_backlog.push_back(tx);
            }
        }
    }

    async fn retry_submit_backlog(&mut self) {
        for _ in 0..self.submit_backlog.len() {
            if let Some(tx) = self.submit_backlog.pop_front() {
                self.handle_submit(tx).await;
            }
        }
    }

    /// Run the engine to completion, then push any finalized blocks to the
    /// application. A timed-out commit leaves the block queued.
    async fn run_consensus(&mut self) -> Result<(), Error> {
        self.core.run_consensus()?;
        self.commit_pending().await
    }

    async fn commit_pending(&mut self) -> Result<(), Error> {
        while let Some(block) = self.core.next_pending_block() {
            let block = block.clone();
            let index = block.index();
            match self.proxy.commit_block(block).await {
                Ok(state_hash) => {
                    info!("{}: committed block {}", self.id, index);
                    self.core.block_committed(state_hash)?;
                }
                Err(Error::ProxyTimeout) => {
                    warn!("{}: commit of block {} timed out", self.id, index);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
