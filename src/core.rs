//! Per-participant state and the graph insertion policy.
use crate::block::{Block, BlockSignature};
use crate::config::Config;
use crate::error::Error;
use crate::event::{Event, EventBody, WireEvent};
use crate::hash::{Hash, EMPTY_HASH};
use crate::hashgraph::Hashgraph;
use crate::identity::Identity;
use crate::store::Store;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::mem;

/// Local participant facade over the store and the consensus engine.
///
/// Owns the identity key, the growing head of the self-chain, the pool of
/// transactions waiting for the next self-event, and the pool of block
/// signatures waiting to be gossiped.
pub struct Core<S: Store> {
    id: String,
    identity: Identity,
    hg: Hashgraph<S>,
    head: Hash,
    seq: i64,
    transaction_pool: Vec<Vec<u8>>,
    block_signature_pool: Vec<BlockSignature>,
    pending_blocks: VecDeque<Block>,
}

impl<S: Store> Core<S> {
    pub fn new(identity: Identity, store: S, config: &Config) -> Result<Self, Error> {
        let id = identity.id();
        if !config.participants.contains(&id) {
            return Err(Error::UnknownParticipant(id));
        }
        let head = store.get_root(&id)?.head;
        let hg = Hashgraph::new(
            config.participants.clone(),
            store,
            config.coin_round_period,
            config.block_size,
        );
        Ok(Self {
            id,
            identity,
            hg,
            head,
            seq: -1,
            transaction_pool: Vec::new(),
            block_signature_pool: Vec::new(),
            pending_blocks: VecDeque::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pub_key(&self) -> Vec<u8> {
        self.identity.public_bytes()
    }

    /// Hash of the latest self-event.
    pub fn head(&self) -> Hash {
        self.head
    }

    pub fn hashgraph(&self) -> &Hashgraph<S> {
        &self.hg
    }

    /// Create and insert the self-chain's index-0 event.
    pub fn init(&mut self) -> Result<(), Error> {
        self.sign_and_insert_self_event(EMPTY_HASH)?;
        Ok(())
    }

    /// Build the next self-event on top of `head`, draining the pending
    /// transactions and block signatures into it.
    pub fn sign_and_insert_self_event(&mut self, other_parent: Hash) -> Result<Hash, Error> {
        let transactions = mem::take(&mut self.transaction_pool);
        let block_signatures = mem::take(&mut self.block_signature_pool);
        let body = EventBody::new(
            transactions,
            block_signatures,
            self.head,
            other_parent,
            self.identity.public_bytes(),
            self.seq + 1,
        );
        let event = Event::sign(body, &self.identity)?;
        self.insert_event(event)
    }

    /// Insert a signed event, advancing the head when it is our own.
    pub fn insert_event(&mut self, event: Event) -> Result<Hash, Error> {
        let is_self = event.creator_id() == self.id;
        let index = event.index();
        let hash = self.hg.insert_event(event)?;
        if is_self {
            self.head = hash;
            self.seq = index;
        }
        Ok(hash)
    }

    pub fn add_transactions(&mut self, payloads: Vec<Vec<u8>>) {
        self.transaction_pool.extend(payloads);
    }

    pub fn get_event(&self, hash: &Hash) -> Result<&Event, Error> {
        self.hg.store().get_event(hash)
    }

    /// participant id -> highest held index.
    pub fn known_events(&self) -> HashMap<String, i64> {
        self.hg.store().known()
    }

    /// Events the caller has not seen, in an order safe for insertion.
    pub fn event_diff(&self, known: &HashMap<String, i64>) -> Result<Vec<Event>, Error> {
        let mut unknown = Vec::new();
        for (participant, &cutoff) in known {
            for hash in self.hg.store().participant_events(participant, cutoff)? {
                unknown.push(self.hg.store().get_event(&hash)?.clone());
            }
        }
        unknown.sort_by_key(|e| e.topological_index);
        Ok(unknown)
    }

    pub fn to_wire(&self, events: &[Event]) -> Result<Vec<WireEvent>, Error> {
        events.iter().map(|e| self.hg.to_wire(e)).collect()
    }

    /// Ingest wire events in arrival order, then record the receipt with a
    /// new self-event whose other-parent is the last event inserted.
    pub fn sync(&mut self, wire_events: &[WireEvent]) -> Result<(), Error> {
        debug!("{}: syncing {} events", self.id, wire_events.len());
        let mut other_head = None;
        for wire in wire_events {
            let event = self.hg.read_wire_info(wire)?;
            let hash = self.insert_event(event)?;
            other_head = Some(hash);
        }
        if let Some(other_head) = other_head {
            self.sign_and_insert_self_event(other_head)?;
        }
        Ok(())
    }

    /// True when the caller is more than `limit` events behind us in total.
    pub fn over_sync_limit(&self, known: &HashMap<String, i64>, limit: i64) -> bool {
        let mut total = 0;
        for (participant, local) in self.known_events() {
            let theirs = known.get(&participant).copied().unwrap_or(-1);
            if local > theirs {
                total += local - theirs;
            }
        }
        total > limit
    }

    /// Advance the engine; newly finalized blocks queue up for commit.
    pub fn run_consensus(&mut self) -> Result<(), Error> {
        let blocks = self.hg.run_consensus()?;
        self.pending_blocks.extend(blocks);
        Ok(())
    }

    /// Oldest finalized block still waiting for the application's state
    /// hash. Stays queued until [`Core::block_committed`] is called, so a
    /// timed-out commit is retried.
    pub fn next_pending_block(&self) -> Option<&Block> {
        self.pending_blocks.front()
    }

    /// Attach the state hash returned by the application, sign the block,
    /// and queue our signature for gossip.
    pub fn block_committed(&mut self, state_hash: Vec<u8>) -> Result<(), Error> {
        let mut block = self.pending_blocks.pop_front().ok_or(Error::Empty)?;
        block.set_state_hash(state_hash);
        let signature = block.sign(&self.identity)?;
        let pub_bytes = self.identity.public_bytes();
        block.add_signature(&signature, &pub_bytes)?;
        self.hg.store_mut().set_block(block);
        self.block_signature_pool.push(signature);
        Ok(())
    }

    /// Finalized events in consensus order.
    pub fn get_consensus_events(&self) -> Vec<Hash> {
        self.hg.consensus_events().to_vec()
    }

    pub fn last_consensus_round(&self) -> Option<i64> {
        self.hg.last_consensus_round()
    }

    pub fn get_block(&self, index: i64) -> Result<&Block, Error> {
        self.hg.get_block(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Participants;
    use crate::store::InmemStore;

    struct Cluster {
        cores: Vec<Core<InmemStore>>,
        identities: Vec<Identity>,
        names: HashMap<Hash, String>,
    }

    impl Cluster {
        fn name(&mut self, hash: Hash, name: &str) {
            self.names.insert(hash, name.to_string());
        }

        fn lookup(&self, hash: &Hash) -> String {
            self.names
                .get(hash)
                .cloned()
                .unwrap_or_else(|| format!("{:?}", hash))
        }
    }

    fn init_cores(n: usize) -> Cluster {
        let identities: Vec<_> = (0..n).map(|_| Identity::generate()).collect();
        let mut participants = Participants::new();
        for identity in &identities {
            participants.add(&identity.public_bytes());
        }
        let mut config = Config::with_participants(participants.clone());
        config.cache_size = 1000;

        let mut cores = Vec::new();
        let mut names = HashMap::new();
        for (i, identity) in identities.iter().enumerate() {
            let store = InmemStore::new(participants.clone(), config.cache_size);
            let mut core = Core::new(identity.clone(), store, &config).unwrap();
            core.init().unwrap();
            names.insert(core.head(), format!("e{}", i));
            cores.push(core);
        }
        Cluster {
            cores,
            identities,
            names,
        }
    }

    fn foreign_event(
        cluster: &Cluster,
        creator: usize,
        self_parent: Hash,
        other_parent: Hash,
        index: i64,
        payload: Vec<Vec<u8>>,
    ) -> Event {
        let body = EventBody::new(
            payload,
            vec![],
            self_parent,
            other_parent,
            cluster.identities[creator].public_bytes(),
            index,
        );
        Event::sign(body, &cluster.identities[creator]).unwrap()
    }

    fn synchronize(cluster: &mut Cluster, from: usize, to: usize, payload: Vec<Vec<u8>>) {
        let known_by_to = cluster.cores[to].known_events();
        let unknown = cluster.cores[from].event_diff(&known_by_to).unwrap();
        let wire = cluster.cores[from].to_wire(&unknown).unwrap();
        cluster.cores[to].add_transactions(payload);
        cluster.cores[to].sync(&wire).unwrap();
    }

    fn sync_and_run_consensus(cluster: &mut Cluster, from: usize, to: usize, payload: &[u8]) {
        synchronize(cluster, from, to, vec![payload.to_vec()]);
        cluster.cores[to].run_consensus().unwrap();
    }

    #[test]
    fn init_creates_the_genesis_event() {
        let cluster = init_cores(1);
        let core = &cluster.cores[0];
        let head = core.get_event(&core.head()).unwrap();
        assert_eq!(head.index(), 0);
        assert_eq!(head.creator_id(), core.id());
        assert_eq!(core.known_events()[core.id()], 0);
    }

    /// Builds the documented base graph on core 0:
    ///
    /// ```text
    /// |  e12  |
    /// |   | \ |
    /// |   |   e20
    /// |   | / |
    /// |   /   |
    /// | / |   |
    /// e01 |   |
    /// | \ |   |
    /// e0  e1  e2
    /// 0   1   2
    /// ```
    fn init_hashgraph(cluster: &mut Cluster) {
        let heads: Vec<Hash> = cluster.cores.iter().map(|c| c.head()).collect();
        for i in 1..3 {
            let event = cluster.cores[i].get_event(&heads[i]).unwrap().clone();
            cluster.cores[0].insert_event(event).unwrap();
        }

        let e01 = cluster.cores[0].sign_and_insert_self_event(heads[1]).unwrap();
        cluster.name(e01, "e01");

        let e20 = foreign_event(cluster, 2, heads[2], e01, 1, vec![]);
        let e20 = cluster.cores[0].insert_event(e20).unwrap();
        cluster.name(e20, "e20");

        let e12 = foreign_event(cluster, 1, heads[1], e20, 1, vec![]);
        let e12 = cluster.cores[0].insert_event(e12).unwrap();
        cluster.name(e12, "e12");
    }

    #[test]
    fn event_diff_after_partial_gossip() {
        let mut cluster = init_cores(3);
        init_hashgraph(&mut cluster);

        let known_by_1 = cluster.cores[1].known_events();
        let unknown_by_1 = cluster.cores[0].event_diff(&known_by_1).unwrap();
        assert_eq!(unknown_by_1.len(), 5);

        let expected = ["e0", "e2", "e01", "e20", "e12"];
        for (i, event) in unknown_by_1.iter().enumerate() {
            assert_eq!(
                cluster.lookup(event.hash()),
                expected[i],
                "element {} out of order",
                i
            );
        }
    }

    #[test]
    fn three_way_sync() {
        let mut cluster = init_cores(3);
        let e0 = cluster.cores[0].head();
        let e1 = cluster.cores[1].head();
        let e2 = cluster.cores[2].head();

        // core 1 tells core 0 everything it knows
        synchronize(&mut cluster, 1, 0, vec![]);

        let ids: Vec<String> = cluster.cores.iter().map(|c| c.id().to_string()).collect();
        let known_by_0 = cluster.cores[0].known_events();
        assert_eq!(known_by_0[&ids[0]], 1);
        assert_eq!(known_by_0[&ids[1]], 0);
        assert_eq!(known_by_0[&ids[2]], -1);
        let head0 = cluster.cores[0].get_event(&cluster.cores[0].head()).unwrap();
        assert_eq!(head0.self_parent(), e0);
        assert_eq!(head0.other_parent(), e1);
        let e01 = *head0.hash();

        // core 0 tells core 2 everything it knows
        synchronize(&mut cluster, 0, 2, vec![]);

        let known_by_2 = cluster.cores[2].known_events();
        assert_eq!(known_by_2[&ids[0]], 1);
        assert_eq!(known_by_2[&ids[1]], 0);
        assert_eq!(known_by_2[&ids[2]], 1);
        let head2 = cluster.cores[2].get_event(&cluster.cores[2].head()).unwrap();
        assert_eq!(head2.self_parent(), e2);
        assert_eq!(head2.other_parent(), e01);
        let e20 = *head2.hash();

        // core 2 tells core 1 everything it knows
        synchronize(&mut cluster, 2, 1, vec![]);

        let known_by_1 = cluster.cores[1].known_events();
        assert_eq!(known_by_1[&ids[0]], 1);
        assert_eq!(known_by_1[&ids[1]], 1);
        assert_eq!(known_by_1[&ids[2]], 1);
        let head1 = cluster.cores[1].get_event(&cluster.cores[1].head()).unwrap();
        assert_eq!(head1.self_parent(), e1);
        assert_eq!(head1.other_parent(), e20);
    }

    /// The 18-step playbook driving three rounds of witnesses.
    fn consensus_playbook() -> Vec<(usize, usize, &'static [u8])> {
        vec![
            (0, 1, b"e10"),
            (1, 2, b"e21"),
            (2, 0, b"e02"),
            (0, 1, b"f1"),
            (1, 0, b"f0"),
            (1, 2, b"f2"),
            (0, 1, b"f10"),
            (1, 2, b"f21"),
            (2, 0, b"f02"),
            (0, 1, b"g1"),
            (1, 0, b"g0"),
            (1, 2, b"g2"),
            (0, 1, b"g10"),
            (1, 2, b"g21"),
            (2, 0, b"g02"),
            (0, 1, b"h1"),
            (1, 0, b"h0"),
            (1, 2, b"h2"),
        ]
    }

    fn init_consensus_hashgraph() -> Cluster {
        let mut cluster = init_cores(3);
        for (from, to, payload) in consensus_playbook() {
            sync_and_run_consensus(&mut cluster, from, to, payload);
        }
        cluster
    }

    #[test]
    fn consensus_on_the_playbook() {
        let cluster = init_consensus_hashgraph();

        let consensus0 = cluster.cores[0].get_consensus_events();
        assert_eq!(consensus0.len(), 6);

        for core in &cluster.cores[1..] {
            assert_eq!(core.get_consensus_events(), consensus0);
        }

        // round 0 closed into one block carrying the three payloads
        let block = cluster.cores[0].get_block(0).unwrap();
        assert_eq!(block.index(), 0);
        assert_eq!(block.round_received(), 1);
        assert_eq!(block.transactions().len(), 3);
        let mut payloads = block.transactions().to_vec();
        payloads.sort();
        assert_eq!(payloads, vec![b"e02".to_vec(), b"e10".to_vec(), b"e21".to_vec()]);
        for core in &cluster.cores[1..] {
            assert_eq!(core.get_block(0).unwrap(), block);
        }

        // block closure: emitted transactions never exceed accepted ones
        let emitted: usize = (0..=cluster.cores[0].hashgraph().store().last_block_index())
            .map(|i| cluster.cores[0].get_block(i).unwrap().transactions().len())
            .sum();
        assert!(emitted <= 18);
    }

    #[test]
    fn over_sync_limit_thresholds() {
        let cluster = init_consensus_hashgraph();
        let core = &cluster.cores[0];
        let ids: Vec<String> = cluster.cores.iter().map(|c| c.id().to_string()).collect();
        let sync_limit = 10;

        let known: HashMap<String, i64> = ids.iter().map(|id| (id.clone(), 1)).collect();
        assert!(core.over_sync_limit(&known, sync_limit));

        let known: HashMap<String, i64> = ids.iter().map(|id| (id.clone(), 6)).collect();
        assert!(!core.over_sync_limit(&known, sync_limit));

        let known: HashMap<String, i64> = vec![
            (ids[0].clone(), 2),
            (ids[1].clone(), 3),
            (ids[2].clone(), 3),
        ]
        .into_iter()
        .collect();
        assert!(!core.over_sync_limit(&known, sync_limit));
    }

    #[test]
    fn equivocation_does_not_disturb_consensus() {
        let mut cluster = init_consensus_hashgraph();

        let consensus1 = cluster.cores[1].get_consensus_events();
        let consensus2 = cluster.cores[2].get_consensus_events();
        assert_eq!(consensus1, consensus2);

        // two index-1 events by participant 0 with distinct other-parents
        let e0 = cluster.cores[1]
            .hashgraph()
            .store()
            .participant_event(cluster.cores[0].id(), 0)
            .unwrap();
        let e1 = cluster.cores[1]
            .hashgraph()
            .store()
            .participant_event(cluster.cores[1].id(), 0)
            .unwrap();
        let e2 = cluster.cores[1]
            .hashgraph()
            .store()
            .participant_event(cluster.cores[2].id(), 0)
            .unwrap();
        let fork_a = foreign_event(&cluster, 0, e0, e1, 1, vec![b"fork-a".to_vec()]);
        let fork_b = foreign_event(&cluster, 0, e0, e2, 1, vec![b"fork-b".to_vec()]);

        for i in 1..3 {
            cluster.cores[i].insert_event(fork_a.clone()).unwrap();
            cluster.cores[i].insert_event(fork_b.clone()).unwrap();
            cluster.cores[i].run_consensus().unwrap();
        }

        assert_eq!(cluster.cores[1].get_consensus_events(), consensus1);
        assert_eq!(cluster.cores[2].get_consensus_events(), consensus2);
        assert_eq!(
            cluster.cores[1].get_consensus_events(),
            cluster.cores[2].get_consensus_events()
        );
    }

    /// The 14-step fast-forward playbook on four participants. Core 0
    /// drops out after the first exchange and never sees later rounds.
    fn fast_forward_playbook() -> Vec<(usize, usize, &'static [u8])> {
        vec![
            (0, 1, b"e10"),
            (1, 2, b"e21"),
            (2, 3, b"e32"),
            (3, 1, b"w11"),
            (1, 2, b"w12"),
            (2, 3, b"w13"),
            (3, 1, b"f13"),
            (1, 2, b"w22"),
            (2, 3, b"w23"),
            (3, 1, b"w21"),
            (1, 2, b"g21"),
            (2, 3, b"w33"),
            (3, 2, b"w32"),
            (2, 1, b"w31"),
        ]
    }

    #[test]
    fn consensus_with_a_lagging_participant() {
        let mut cluster = init_cores(4);
        for (from, to, payload) in fast_forward_playbook() {
            sync_and_run_consensus(&mut cluster, from, to, payload);
        }

        assert_eq!(cluster.cores[0].last_consensus_round(), None);
        assert!(cluster.cores[0].get_consensus_events().is_empty());

        for core in &cluster.cores[1..] {
            assert_eq!(core.last_consensus_round(), Some(1), "core {}", core.id());
        }
        let consensus1 = cluster.cores[1].get_consensus_events();
        assert_eq!(consensus1.len(), 7);
        for core in &cluster.cores[2..] {
            assert_eq!(core.get_consensus_events(), consensus1);
        }
    }
}
