//! Application proxy.
//!
//! The consensus side and the application talk over two unidirectional
//! channels (submit in, commit out) plus request/response pairs with an
//! explicit deadline for `CommitBlock` and `ValidateTx`.
use crate::block::Block;
use crate::error::Error;
use crate::hash::Hasher;
use async_std::channel::{bounded, Receiver, Sender};
use async_std::future::timeout;
use async_std::task;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CHANNEL_DEPTH: usize = 128;

/// A finalized block on its way to the application, with a reply channel
/// for the resulting state hash.
#[derive(Debug)]
pub struct Commit {
    pub block: Block,
    resp: Sender<Vec<u8>>,
}

impl Commit {
    pub async fn respond(self, state_hash: Vec<u8>) {
        let _ = self.resp.send(state_hash).await;
    }
}

/// A transaction validation request from the consensus side.
#[derive(Debug)]
pub struct Validate {
    pub tx: Vec<u8>,
    resp: Sender<bool>,
}

impl Validate {
    pub async fn respond(self, valid: bool) {
        let _ = self.resp.send(valid).await;
    }
}

/// Consensus-side handle.
pub struct AppProxy {
    submit_rx: Receiver<Vec<u8>>,
    commit_tx: Sender<Commit>,
    validate_tx: Sender<Validate>,
    timeout: Duration,
}

impl AppProxy {
    /// Next transaction submitted by the application.
    pub async fn recv_submit(&self) -> Result<Vec<u8>, Error> {
        self.submit_rx.recv().await.map_err(|_| Error::Shutdown)
    }

    /// Push a finalized block to the application and wait for its state
    /// hash within the configured deadline.
    pub async fn commit_block(&self, block: Block) -> Result<Vec<u8>, Error> {
        let (tx, rx) = bounded(1);
        self.commit_tx
            .send(Commit { block, resp: tx })
            .await
            .map_err(|_| Error::Shutdown)?;
        match timeout(self.timeout, rx.recv()).await {
            Ok(Ok(state_hash)) => Ok(state_hash),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::ProxyTimeout),
        }
    }

    /// Ask the application whether a submitted payload is acceptable.
    pub async fn validate_tx(&self, tx: Vec<u8>) -> Result<bool, Error> {
        let (reply_tx, reply_rx) = bounded(1);
        self.validate_tx
            .send(Validate {
                tx,
                resp: reply_tx,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        match timeout(self.timeout, reply_rx.recv()).await {
            Ok(Ok(valid)) => Ok(valid),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::ProxyTimeout),
        }
    }
}

/// Application-side handle.
pub struct AppHandle {
    submit_tx: Sender<Vec<u8>>,
    pub commit_rx: Receiver<Commit>,
    pub validate_rx: Receiver<Validate>,
}

impl AppHandle {
    /// Submit an opaque transaction payload for ordering.
    pub async fn submit_tx(&self, tx: Vec<u8>) -> Result<(), Error> {
        self.submit_tx.send(tx).await.map_err(|_| Error::Shutdown)
    }
}

/// Build a connected proxy/handle pair.
pub fn pair(proxy_timeout: Duration) -> (AppProxy, AppHandle) {
    let (submit_tx, submit_rx) = bounded(CHANNEL_DEPTH);
    let (commit_tx, commit_rx) = bounded(CHANNEL_DEPTH);
    let (validate_tx, validate_rx) = bounded(CHANNEL_DEPTH);
    (
        AppProxy {
            submit_rx,
            commit_tx,
            validate_tx,
            timeout: proxy_timeout,
        },
        AppHandle {
            submit_tx,
            commit_rx,
            validate_rx,
        },
    )
}

/// Minimal application: accepts every transaction and folds committed
/// payloads into a running SHA-256 state.
#[derive(Clone)]
pub struct InmemApp {
    submit_tx: Sender<Vec<u8>>,
    committed: Arc<Mutex<Vec<Block>>>,
}

impl InmemApp {
    /// Serve an [`AppHandle`] on a background task.
    pub fn spawn(handle: AppHandle) -> Self {
        let committed = Arc::new(Mutex::new(Vec::new()));
        let app = Self {
            submit_tx: handle.submit_tx.clone(),
            committed: committed.clone(),
        };
        let commit_rx = handle.commit_rx;
        let validate_rx = handle.validate_rx;

        task::spawn(async move {
            while let Ok(validate) = validate_rx.recv().await {
                validate.respond(true).await;
            }
        });
        task::spawn(async move {
            let mut state = Vec::new();
            while let Ok(commit) = commit_rx.recv().await {
                let mut hasher = Hasher::new();
                hasher.write(&state);
                for tx in commit.block.transactions() {
                    hasher.write(tx);
                }
                state = hasher.sum().to_vec();
                debug!(
                    "committing block {} ({} txs)",
                    commit.block.index(),
                    commit.block.transactions().len()
                );
                let mut block = commit.block.clone();
                block.set_state_hash(state.clone());
                committed.lock().unwrap().push(block);
                commit.respond(state.clone()).await;
            }
        });
        app
    }

    pub async fn submit_tx(&self, tx: Vec<u8>) -> Result<(), Error> {
        self.submit_tx.send(tx).await.map_err(|_| Error::Shutdown)
    }

    pub fn committed_blocks(&self) -> Vec<Block> {
        self.committed.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn commit_round_trip() {
        let (proxy, handle) = pair(Duration::from_secs(1));
        let app = InmemApp::spawn(handle);

        let block = Block::new(0, 1, vec![b"tx".to_vec()]);
        let state_hash = proxy.commit_block(block).await.unwrap();
        assert!(!state_hash.is_empty());

        let committed = app.committed_blocks();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].state_hash(), &state_hash[..]);
    }

    #[async_std::test]
    async fn validate_and_submit() {
        let (proxy, handle) = pair(Duration::from_secs(1));
        let app = InmemApp::spawn(handle);

        assert!(proxy.validate_tx(b"tx".to_vec()).await.unwrap());
        app.submit_tx(b"tx".to_vec()).await.unwrap();
        assert_eq!(proxy.recv_submit().await.unwrap(), b"tx".to_vec());
    }

    #[async_std::test]
    async fn commit_times_out_without_an_app() {
        let (proxy, _handle) = pair(Duration::from_millis(50));
        let block = Block::new(0, 1, vec![]);
        assert!(matches!(
            proxy.commit_block(block).await,
            Err(Error::ProxyTimeout)
        ));
    }
}
