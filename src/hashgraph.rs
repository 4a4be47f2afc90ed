//! The consensus engine: rounds, witnesses, fame and total order.
//!
//! Ancestry predicates are memoised in hash-keyed caches; the participant
//! set is fixed at init so the caches are never invalidated.
use crate::block::Block;
use crate::error::Error;
use crate::event::{Event, EventBody, WireBody, WireEvent};
use crate::hash::{Hash, EMPTY_HASH};
use crate::identity::{Participants, SIGNATURE_LENGTH};
use crate::store::Store;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};

pub struct Hashgraph<S: Store> {
    participants: Participants,
    store: S,
    coin_round_period: i64,
    block_size: usize,
    /// Events not yet assigned a round received, in insertion order.
    undetermined_events: Vec<Hash>,
    last_consensus_round: Option<i64>,
    topological_index: i64,
    ancestor_cache: HashMap<(Hash, Hash), bool>,
    strongly_sees_cache: HashMap<(Hash, Hash), bool>,
    fork_cache: HashMap<(Hash, String), bool>,
    round_cache: HashMap<Hash, i64>,
}

impl<S: Store> Hashgraph<S> {
    pub fn new(participants: Participants, store: S, coin_round_period: i64, block_size: usize) -> Self {
        Self {
            participants,
            store,
            coin_round_period,
            block_size,
            undetermined_events: Vec::new(),
            last_consensus_round: None,
            topological_index: 0,
            ancestor_cache: HashMap::new(),
            strongly_sees_cache: HashMap::new(),
            fork_cache: HashMap::new(),
            round_cache: HashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn participants(&self) -> &Participants {
        &self.participants
    }

    pub fn last_consensus_round(&self) -> Option<i64> {
        self.last_consensus_round
    }
}

// Insertion
impl<S: Store> Hashgraph<S> {
    /// Validate and insert a signed event.
    ///
    /// Equivocations are not rejected: a second event at an occupied index
    /// inserts cleanly and is excluded from quorums by `sees`.
    pub fn insert_event(&mut self, mut event: Event) -> Result<Hash, Error> {
        // a concurrent gossip exchange can hand us an event twice
        if self.store.get_event(event.hash()).is_ok() {
            return Ok(*event.hash());
        }
        event.verify().map_err(|_| Error::InvalidSignature)?;
        self.check_self_parent(&event)?;
        self.check_other_parent(&event)?;

        event.topological_index = self.topological_index;
        self.topological_index += 1;
        event.round = None;
        event.witness = None;
        event.round_received = None;
        event.consensus_timestamp = None;

        let hash = *event.hash();
        let block_signatures = event.block_signatures().to_vec();
        self.store.set_event(event)?;
        self.undetermined_events.push(hash);

        for bs in &block_signatures {
            if let Err(e) = self.absorb_block_signature(bs) {
                debug!("dropping block signature for block {}: {}", bs.index, e);
            }
        }
        Ok(hash)
    }

    fn check_self_parent(&self, event: &Event) -> Result<(), Error> {
        let creator = event.creator_id();
        let root = self.store.get_root(creator)?;
        let self_parent = event.self_parent();
        if event.index() == 0 {
            if self_parent == root.head {
                return Ok(());
            }
            return Err(Error::SelfParentIndexMismatch(event.hash().to_hex()));
        }
        let parent = self
            .store
            .get_event(&self_parent)
            .map_err(|_| Error::UnknownParent(self_parent.to_hex()))?;
        if parent.creator_id() == creator && parent.index() == event.index() - 1 {
            Ok(())
        } else {
            Err(Error::SelfParentIndexMismatch(event.hash().to_hex()))
        }
    }

    fn check_other_parent(&self, event: &Event) -> Result<(), Error> {
        let other_parent = event.other_parent();
        if other_parent.is_empty() {
            return Ok(());
        }
        self.store
            .get_event(&other_parent)
            .map_err(|_| Error::UnknownParent(other_parent.to_hex()))?;
        Ok(())
    }

    fn absorb_block_signature(&mut self, bs: &crate::block::BlockSignature) -> Result<(), Error> {
        let pub_bytes = self.participants.pub_key(&bs.validator)?.to_vec();
        let mut block = self.store.get_block(bs.index)?.clone();
        block.add_signature(bs, &pub_bytes)?;
        self.store.set_block(block);
        Ok(())
    }
}

// Ancestry predicates
impl<S: Store> Hashgraph<S> {
    fn parent_hashes(&self, hash: &Hash) -> Vec<Hash> {
        let mut parents = Vec::with_capacity(2);
        if let Ok(event) = self.store.get_event(hash) {
            let sp = event.self_parent();
            let op = event.other_parent();
            if !sp.is_empty() && self.store.get_event(&sp).is_ok() {
                parents.push(sp);
            }
            if !op.is_empty() && self.store.get_event(&op).is_ok() {
                parents.push(op);
            }
        }
        parents
    }

    /// All events reachable from `x` by parent edges, `x` included.
    fn ancestors_of(&self, x: &Hash) -> Vec<Hash> {
        let mut visited = HashSet::new();
        let mut stack = vec![*x];
        let mut out = Vec::new();
        while let Some(h) = stack.pop() {
            if !visited.insert(h) {
                continue;
            }
            out.push(h);
            stack.extend(self.parent_hashes(&h));
        }
        out
    }

    /// y is reachable from x by repeatedly following either parent, or x = y.
    pub fn ancestor(&mut self, x: &Hash, y: &Hash) -> bool {
        if x == y {
            return true;
        }
        if let Some(&v) = self.ancestor_cache.get(&(*x, *y)) {
            return v;
        }
        let mut found = false;
        let mut visited = HashSet::new();
        let mut stack = vec![*x];
        while let Some(h) = stack.pop() {
            if !visited.insert(h) {
                continue;
            }
            if h == *y {
                found = true;
                break;
            }
            stack.extend(self.parent_hashes(&h));
        }
        self.ancestor_cache.insert((*x, *y), found);
        found
    }

    /// y is reachable from x using only self-parent links.
    pub fn self_ancestor(&mut self, x: &Hash, y: &Hash) -> bool {
        let mut cur = *x;
        loop {
            if cur == *y {
                return true;
            }
            match self.store.get_event(&cur) {
                Ok(event) => {
                    let sp = event.self_parent();
                    if sp.is_empty() || self.store.get_event(&sp).is_err() {
                        return false;
                    }
                    cur = sp;
                }
                Err(_) => return false,
            }
        }
    }

    /// True if two events by `creator` at the same index are both reachable
    /// from `x` — the observable form of an equivocation.
    fn fork_visible(&mut self, x: &Hash, creator: &str) -> bool {
        if let Some(&v) = self.fork_cache.get(&(*x, creator.to_string())) {
            return v;
        }
        let mut indices = HashSet::new();
        let mut fork = false;
        for h in self.ancestors_of(x) {
            if let Ok(event) = self.store.get_event(&h) {
                if event.creator_id() == creator && !indices.insert(event.index()) {
                    fork = true;
                    break;
                }
            }
        }
        self.fork_cache.insert((*x, creator.to_string()), fork);
        fork
    }

    /// `ancestor(x, y)` and x observes no equivocation by y's creator.
    pub fn sees(&mut self, x: &Hash, y: &Hash) -> Result<bool, Error> {
        if !self.ancestor(x, y) {
            return Ok(false);
        }
        let creator = self.store.get_event(y)?.creator_id().to_string();
        Ok(!self.fork_visible(x, &creator))
    }

    /// `sees(x, y)` through events of more than 2n/3 distinct creators.
    pub fn strongly_sees(&mut self, x: &Hash, y: &Hash) -> Result<bool, Error> {
        if let Some(&v) = self.strongly_sees_cache.get(&(*x, *y)) {
            return Ok(v);
        }
        let result = self.strongly_sees_uncached(x, y)?;
        self.strongly_sees_cache.insert((*x, *y), result);
        Ok(result)
    }

    fn strongly_sees_uncached(&mut self, x: &Hash, y: &Hash) -> Result<bool, Error> {
        if !self.sees(x, y)? {
            return Ok(false);
        }
        let supermajority = self.participants.supermajority();
        let mut counted: HashSet<String> = HashSet::new();
        for z in self.ancestors_of(x) {
            let creator = match self.store.get_event(&z) {
                Ok(event) => event.creator_id().to_string(),
                Err(_) => continue,
            };
            if counted.contains(&creator) {
                continue;
            }
            if self.sees(x, &z)? && self.sees(&z, y)? {
                counted.insert(creator);
                if counted.len() >= supermajority {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

// Round assignment
impl<S: Store> Hashgraph<S> {
    /// Max of the parent rounds, with a flag set when the deciding parent
    /// is a root.
    fn parent_round_info(&mut self, x: &Hash) -> Result<(i64, bool), Error> {
        let event = self.store.get_event(x)?;
        let creator = event.creator_id().to_string();
        let self_parent = event.self_parent();
        let other_parent = event.other_parent();
        let root = self.store.get_root(&creator)?;

        let (mut round, mut is_root) = if self_parent == root.head {
            (root.round, true)
        } else {
            (self.round(&self_parent)?, false)
        };
        if !other_parent.is_empty() && self.store.get_event(&other_parent).is_ok() {
            let other_round = self.round(&other_parent)?;
            if other_round > round {
                round = other_round;
                is_root = false;
            }
        }
        Ok((round, is_root))
    }

    /// Round of an event: the parent round, incremented when the event
    /// strongly sees a supermajority of that round's witnesses (or when
    /// the parent round comes from a root).
    pub fn round(&mut self, x: &Hash) -> Result<i64, Error> {
        if let Some(&r) = self.round_cache.get(x) {
            return Ok(r);
        }
        let (parent_round, is_root) = self.parent_round_info(x)?;
        let inc = if is_root {
            true
        } else {
            let witnesses = self.store.round_witnesses(parent_round);
            let supermajority = self.participants.supermajority();
            let mut count = 0;
            for w in witnesses {
                if self.strongly_sees(x, &w)? {
                    count += 1;
                    if count >= supermajority {
                        break;
                    }
                }
            }
            count >= supermajority
        };
        let round = if inc { parent_round + 1 } else { parent_round };
        self.round_cache.insert(*x, round);
        Ok(round)
    }

    /// First event of a round for its creator.
    pub fn witness(&mut self, x: &Hash) -> Result<bool, Error> {
        let event = self.store.get_event(x)?;
        let creator = event.creator_id().to_string();
        let self_parent = event.self_parent();
        let root = self.store.get_root(&creator)?;
        if self_parent == root.head {
            return Ok(true);
        }
        Ok(self.round(x)? > self.round(&self_parent)?)
    }

    fn divide_rounds(&mut self) -> Result<(), Error> {
        for x in self.undetermined_events.clone() {
            if self.store.get_event(&x)?.round().is_some() {
                continue;
            }
            let round = self.round(&x)?;
            let witness = self.witness(&x)?;
            let mut info = self
                .store
                .get_round(round)
                .map(Clone::clone)
                .unwrap_or_default();
            info.add_event(x, witness);
            self.store.set_round(round, info);
            let event = self.store.get_event_mut(&x)?;
            event.round = Some(round);
            event.witness = Some(witness);
            trace!("event {:?} in round {} witness {}", x, round, witness);
        }
        Ok(())
    }
}

// Fame
impl<S: Store> Hashgraph<S> {
    fn coin_flip(&self, witness: &Hash) -> Result<bool, Error> {
        let sig = self.store.get_event(witness)?.signature().to_bytes();
        Ok((sig[SIGNATURE_LENGTH / 2] & 1) == 1)
    }

    fn decide_fame(&mut self) -> Result<(), Error> {
        let supermajority = self.participants.supermajority();
        let period = self.coin_round_period;
        let mut votes: HashMap<(Hash, Hash), bool> = HashMap::new();
        let last_round = self.store.last_round();

        for i in 0..last_round {
            let witnesses_i = self.store.round_witnesses(i);
            for x in witnesses_i {
                if self
                    .store
                    .get_round(i)
                    .map(|r| r.is_decided(&x))
                    .unwrap_or(false)
                {
                    continue;
                }
                'election: for j in (i + 1)..=last_round {
                    for y in self.store.round_witnesses(j) {
                        let diff = j - i;
                        if diff == 1 {
                            let vote = self.sees(&y, &x)?;
                            votes.insert((y, x), vote);
                            continue;
                        }
                        let mut yays = 0;
                        let mut nays = 0;
                        for w in self.store.round_witnesses(j - 1) {
                            if self.strongly_sees(&y, &w)? {
                                if votes.get(&(w, x)).copied().unwrap_or(false) {
                                    yays += 1;
                                } else {
                                    nays += 1;
                                }
                            }
                        }
                        let (vote, tally) = if yays >= nays {
                            (true, yays)
                        } else {
                            (false, nays)
                        };
                        if diff % period != 0 {
                            if tally >= supermajority {
                                let mut info = self.store.get_round(i)?.clone();
                                info.set_fame(&x, vote);
                                self.store.set_round(i, info);
                                votes.insert((y, x), vote);
                                debug!("witness {:?} of round {} decided famous={}", x, i, vote);
                                break 'election;
                            }
                            votes.insert((y, x), vote);
                        } else if tally >= supermajority {
                            votes.insert((y, x), vote);
                        } else {
                            // coin round
                            votes.insert((y, x), self.coin_flip(&y)?);
                        }
                    }
                }
            }
            let decided = self
                .store
                .get_round(i)
                .map(|r| r.witnesses_decided())
                .unwrap_or(false);
            if decided && self.last_consensus_round.map_or(true, |r| i > r) {
                self.last_consensus_round = Some(i);
            }
        }
        Ok(())
    }
}

// Order
impl<S: Store> Hashgraph<S> {
    /// Walk x's self-parent chain down to the earliest event that still
    /// sees y.
    fn oldest_self_ancestor_to_see(&mut self, x: &Hash, y: &Hash) -> Result<Hash, Error> {
        let mut cur = *x;
        loop {
            let self_parent = self.store.get_event(&cur)?.self_parent();
            if self_parent.is_empty() || self.store.get_event(&self_parent).is_err() {
                return Ok(cur);
            }
            if self.sees(&self_parent, y)? {
                cur = self_parent;
            } else {
                return Ok(cur);
            }
        }
    }

    fn decide_round_received(&mut self) -> Result<(), Error> {
        let last_round = self.store.last_round();
        for x in self.undetermined_events.clone() {
            let round = self.round(&x)?;
            for i in (round + 1)..=last_round {
                let info = match self.store.get_round(i) {
                    Ok(info) => info,
                    Err(_) => continue,
                };
                if !info.witnesses_decided() {
                    continue;
                }
                let famous = info.famous_witnesses();
                if famous.is_empty() {
                    continue;
                }
                let mut seen_by_all = true;
                for w in &famous {
                    if !self.sees(w, &x)? {
                        seen_by_all = false;
                        break;
                    }
                }
                if !seen_by_all {
                    continue;
                }
                let mut timestamps = Vec::with_capacity(famous.len());
                for w in &famous {
                    let first = self.oldest_self_ancestor_to_see(w, &x)?;
                    timestamps.push(self.store.get_event(&first)?.timestamp());
                }
                timestamps.sort_unstable();
                let median = timestamps[timestamps.len() / 2];
                let event = self.store.get_event_mut(&x)?;
                event.round_received = Some(i);
                event.consensus_timestamp = Some(median);
                break;
            }
        }
        Ok(())
    }

    /// XOR of the signatures of a round's famous witnesses, used to whiten
    /// the tie-breaking comparison.
    fn round_mask(&self, round: i64) -> Result<[u8; SIGNATURE_LENGTH], Error> {
        let mut mask = [0u8; SIGNATURE_LENGTH];
        if let Ok(info) = self.store.get_round(round) {
            for w in info.famous_witnesses() {
                let sig = self.store.get_event(&w)?.signature().to_bytes();
                for (m, s) in mask.iter_mut().zip(sig.iter()) {
                    *m ^= s;
                }
            }
        }
        Ok(mask)
    }

    fn find_order(&mut self) -> Result<Vec<Block>, Error> {
        self.decide_round_received()?;

        let mut newly_received = Vec::new();
        let mut undetermined = Vec::new();
        for x in self.undetermined_events.clone() {
            if self.store.get_event(&x)?.round_received().is_some() {
                newly_received.push(x);
            } else {
                undetermined.push(x);
            }
        }
        self.undetermined_events = undetermined;
        if newly_received.is_empty() {
            return Ok(Vec::new());
        }

        let mut keyed = Vec::with_capacity(newly_received.len());
        let mut masks: HashMap<i64, [u8; SIGNATURE_LENGTH]> = HashMap::new();
        for x in newly_received {
            let (round_received, timestamp, signature) = {
                let event = self.store.get_event(&x)?;
                (
                    event.round_received().unwrap_or_default(),
                    event.consensus_timestamp().unwrap_or_default(),
                    event.signature().to_bytes(),
                )
            };
            if !masks.contains_key(&round_received) {
                masks.insert(round_received, self.round_mask(round_received)?);
            }
            let mask = &masks[&round_received];
            let mut whitened = [0u8; SIGNATURE_LENGTH];
            for (w, (s, m)) in whitened.iter_mut().zip(signature.iter().zip(mask.iter())) {
                *w = s ^ m;
            }
            keyed.push((round_received, timestamp, whitened, x));
        }
        keyed.sort();

        for (round_received, _, _, x) in &keyed {
            self.store.add_consensus_event(*x);
            debug!("event {:?} reached consensus in round {}", x, round_received);
        }

        let mut blocks = Vec::new();
        let mut i = 0;
        while i < keyed.len() {
            let round_received = keyed[i].0;
            let mut transactions: Vec<Vec<u8>> = Vec::new();
            while i < keyed.len() && keyed[i].0 == round_received {
                transactions.extend(self.store.get_event(&keyed[i].3)?.transactions().to_vec());
                i += 1;
            }
            for chunk in transactions.chunks(self.block_size) {
                let index = self.store.last_block_index() + 1;
                let block = Block::new(index, round_received, chunk.to_vec());
                self.store.set_block(block.clone());
                debug!(
                    "block {} assembled: round {} txs {}",
                    index,
                    round_received,
                    block.transactions().len()
                );
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// Advance fame decisions and emit any newly finalized blocks.
    pub fn run_consensus(&mut self) -> Result<Vec<Block>, Error> {
        self.divide_rounds()?;
        self.decide_fame()?;
        self.find_order()
    }
}

// Wire conversion
impl<S: Store> Hashgraph<S> {
    /// Reconstruct a full event from its wire form; both parents must
    /// already be resolvable through the store.
    pub fn read_wire_info(&self, wire: &WireEvent) -> Result<Event, Error> {
        let creator_id = &wire.body.creator_id;
        let creator = self.participants.pub_key(creator_id)?.to_vec();
        let root = self.store.get_root(creator_id)?;
        let self_parent = if wire.body.self_parent_index < 0 {
            root.head
        } else {
            self.store
                .participant_event(creator_id, wire.body.self_parent_index)
                .map_err(|_| {
                    Error::UnknownParent(format!(
                        "{}:{}",
                        creator_id, wire.body.self_parent_index
                    ))
                })?
        };
        let other_parent = if wire.body.other_parent_index < 0 {
            EMPTY_HASH
        } else {
            self.store
                .participant_event(
                    &wire.body.other_parent_creator_id,
                    wire.body.other_parent_index,
                )
                .map_err(|_| {
                    Error::UnknownParent(format!(
                        "{}:{}",
                        wire.body.other_parent_creator_id, wire.body.other_parent_index
                    ))
                })?
        };
        let body = EventBody {
            transactions: wire.body.transactions.clone(),
            block_signatures: wire.body.block_signatures.clone(),
            self_parent,
            other_parent,
            creator,
            index: wire.body.index,
            timestamp: wire.body.timestamp,
        };
        Event::new(body, wire.signature.clone())
    }

    /// Coordinate form of an event for gossip.
    pub fn to_wire(&self, event: &Event) -> Result<WireEvent, Error> {
        let (other_parent_creator_id, other_parent_index) = if event.other_parent().is_empty() {
            (String::new(), -1)
        } else {
            let other = self.store.get_event(&event.other_parent())?;
            (other.creator_id().to_string(), other.index())
        };
        Ok(WireEvent {
            body: WireBody {
                transactions: event.transactions().to_vec(),
                block_signatures: event.block_signatures().to_vec(),
                self_parent_index: event.index() - 1,
                other_parent_creator_id,
                other_parent_index,
                creator_id: event.creator_id().to_string(),
                index: event.index(),
                timestamp: event.timestamp(),
            },
            signature: event.signature().clone(),
        })
    }
}

// Consensus output
impl<S: Store> Hashgraph<S> {
    pub fn consensus_events(&self) -> &[Hash] {
        self.store.consensus_events()
    }

    pub fn get_block(&self, index: i64) -> Result<&Block, Error> {
        self.store.get_block(index)
    }

    /// Drop all derived state and replayable events, keeping the
    /// participant set.
    pub fn reset(&mut self) {
        self.store.reset();
        self.undetermined_events.clear();
        self.last_consensus_round = None;
        self.topological_index = 0;
        self.ancestor_cache.clear();
        self.strongly_sees_cache.clear();
        self.fork_cache.clear();
        self.round_cache.clear();
    }
}
