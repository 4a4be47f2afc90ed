//! Graph storage.
use crate::block::Block;
use crate::error::Error;
use crate::event::Event;
use crate::hash::{Hash, Hasher};
use crate::identity::Participants;
use crate::rolling::RollingIndexMap;
use std::collections::{BTreeMap, HashMap};

/// Synthetic predecessor of a participant's first event, so genesis
/// self-parent links are well-formed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Root {
    /// Pseudo-hash standing in for the event before index 0.
    pub head: Hash,
    pub index: i64,
    pub round: i64,
}

impl Root {
    pub fn for_participant(id: &str) -> Self {
        Self {
            head: Hasher::digest(id.as_bytes()),
            index: -1,
            round: -1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct RoundEvent {
    witness: bool,
    famous: Option<bool>,
}

/// Derived per-round state: which events landed in the round, which are
/// witnesses, and how their fame was decided.
#[derive(Clone, Debug, Default)]
pub struct RoundInfo {
    events: BTreeMap<Hash, RoundEvent>,
}

impl RoundInfo {
    /// Record an event in this round. Existing entries are left alone so
    /// fame decisions survive repeated division passes.
    pub fn add_event(&mut self, hash: Hash, witness: bool) {
        self.events
            .entry(hash)
            .or_insert(RoundEvent {
                witness,
                famous: None,
            });
    }

    pub fn witnesses(&self) -> Vec<Hash> {
        self.events
            .iter()
            .filter(|(_, e)| e.witness)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn famous_witnesses(&self) -> Vec<Hash> {
        self.events
            .iter()
            .filter(|(_, e)| e.witness && e.famous == Some(true))
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn event_hashes(&self) -> Vec<Hash> {
        self.events.keys().copied().collect()
    }

    pub fn is_decided(&self, witness: &Hash) -> bool {
        self.events
            .get(witness)
            .map(|e| e.witness && e.famous.is_some())
            .unwrap_or(false)
    }

    /// Decisions are final; a decided witness is never overwritten.
    pub fn set_fame(&mut self, witness: &Hash, famous: bool) {
        if let Some(e) = self.events.get_mut(witness) {
            if e.witness && e.famous.is_none() {
                e.famous = Some(famous);
            }
        }
    }

    pub fn witnesses_decided(&self) -> bool {
        self.events
            .values()
            .filter(|e| e.witness)
            .all(|e| e.famous.is_some())
    }
}

/// Storage contract of the consensus engine. The in-memory variant is the
/// reference; a persistent backend must expose exactly this surface and
/// replay inserts in original order on restart.
pub trait Store {
    fn cache_size(&self) -> usize;

    fn get_event(&self, hash: &Hash) -> Result<&Event, Error>;
    fn get_event_mut(&mut self, hash: &Hash) -> Result<&mut Event, Error>;
    fn set_event(&mut self, event: Event) -> Result<(), Error>;

    /// Hashes of a participant's events with index > `skip`, oldest first.
    fn participant_events(&self, participant: &str, skip: i64) -> Result<Vec<Hash>, Error>;
    fn participant_event(&self, participant: &str, index: i64) -> Result<Hash, Error>;
    /// Hash of the participant's latest event, falling back to its root.
    fn last_from(&self, participant: &str) -> Result<Hash, Error>;
    /// participant id -> highest held index (-1 if none).
    fn known(&self) -> HashMap<String, i64>;

    fn consensus_events(&self) -> &[Hash];
    fn add_consensus_event(&mut self, hash: Hash);

    fn get_round(&self, index: i64) -> Result<&RoundInfo, Error>;
    fn set_round(&mut self, index: i64, round: RoundInfo);
    /// Highest round created, -1 if none.
    fn last_round(&self) -> i64;
    fn round_witnesses(&self, index: i64) -> Vec<Hash>;

    fn get_root(&self, participant: &str) -> Result<Root, Error>;

    fn get_block(&self, index: i64) -> Result<&Block, Error>;
    fn set_block(&mut self, block: Block);
    /// Highest block index emitted, -1 if none.
    fn last_block_index(&self) -> i64;

    /// Drop all derived and event state, keeping participants and roots.
    fn reset(&mut self);
}

/// Volatile store backing a single participant.
#[derive(Clone, Debug)]
pub struct InmemStore {
    cache_size: usize,
    participants: Participants,
    events: HashMap<Hash, Event>,
    participant_events: RollingIndexMap<Hash>,
    roots: HashMap<String, Root>,
    rounds: BTreeMap<i64, RoundInfo>,
    blocks: BTreeMap<i64, Block>,
    consensus_events: Vec<Hash>,
}

impl InmemStore {
    pub fn new(participants: Participants, cache_size: usize) -> Self {
        let ids = participants.ids();
        let roots = ids
            .iter()
            .map(|id| (id.clone(), Root::for_participant(id)))
            .collect();
        Self {
            cache_size,
            participants,
            events: HashMap::new(),
            participant_events: RollingIndexMap::new(cache_size, &ids),
            roots,
            rounds: BTreeMap::new(),
            blocks: BTreeMap::new(),
            consensus_events: Vec::new(),
        }
    }
}

impl Store for InmemStore {
    fn cache_size(&self) -> usize {
        self.cache_size
    }

    fn get_event(&self, hash: &Hash) -> Result<&Event, Error> {
        self.events
            .get(hash)
            .ok_or_else(|| Error::KeyNotFound(hash.to_hex()))
    }

    fn get_event_mut(&mut self, hash: &Hash) -> Result<&mut Event, Error> {
        self.events
            .get_mut(hash)
            .ok_or_else(|| Error::KeyNotFound(hash.to_hex()))
    }

    fn set_event(&mut self, event: Event) -> Result<(), Error> {
        let creator = event.creator_id().to_string();
        if !self.participants.contains(&creator) {
            return Err(Error::UnknownParticipant(creator));
        }
        let hash = *event.hash();
        self.participant_events
            .set(&creator, hash, event.index())?;
        self.events.insert(hash, event);
        Ok(())
    }

    fn participant_events(&self, participant: &str, skip: i64) -> Result<Vec<Hash>, Error> {
        match self.participant_events.get(participant, skip) {
            Ok(hashes) => Ok(hashes),
            Err(Error::Empty) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn participant_event(&self, participant: &str, index: i64) -> Result<Hash, Error> {
        self.participant_events.get_item(participant, index)
    }

    fn last_from(&self, participant: &str) -> Result<Hash, Error> {
        match self.participant_events.get_last(participant) {
            Ok(hash) => Ok(hash),
            Err(Error::Empty) => self.get_root(participant).map(|r| r.head),
            Err(e) => Err(e),
        }
    }

    fn known(&self) -> HashMap<String, i64> {
        self.participant_events.known()
    }

    fn consensus_events(&self) -> &[Hash] {
        &self.consensus_events
    }

    fn add_consensus_event(&mut self, hash: Hash) {
        self.consensus_events.push(hash);
    }

    fn get_round(&self, index: i64) -> Result<&RoundInfo, Error> {
        self.rounds
            .get(&index)
            .ok_or_else(|| Error::KeyNotFound(format!("round {}", index)))
    }

    fn set_round(&mut self, index: i64, round: RoundInfo) {
        self.rounds.insert(index, round);
    }

    fn last_round(&self) -> i64 {
        self.rounds.keys().next_back().copied().unwrap_or(-1)
    }

    fn round_witnesses(&self, index: i64) -> Vec<Hash> {
        self.rounds
            .get(&index)
            .map(|r| r.witnesses())
            .unwrap_or_default()
    }

    fn get_root(&self, participant: &str) -> Result<Root, Error> {
        self.roots
            .get(participant)
            .copied()
            .ok_or_else(|| Error::UnknownParticipant(participant.to_string()))
    }

    fn get_block(&self, index: i64) -> Result<&Block, Error> {
        self.blocks
            .get(&index)
            .ok_or_else(|| Error::KeyNotFound(format!("block {}", index)))
    }

    fn set_block(&mut self, block: Block) {
        self.blocks.insert(block.index(), block);
    }

    fn last_block_index(&self) -> i64 {
        self.blocks.keys().next_back().copied().unwrap_or(-1)
    }

    fn reset(&mut self) {
        self.events.clear();
        self.participant_events.reset();
        self.rounds.clear();
        self.blocks.clear();
        self.consensus_events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;
    use crate::hash::EMPTY_HASH;
    use crate::identity::Identity;

    fn setup(n: usize) -> (Vec<Identity>, Participants, InmemStore) {
        let identities: Vec<_> = (0..n).map(|_| Identity::generate()).collect();
        let mut participants = Participants::new();
        for id in &identities {
            participants.add(&id.public_bytes());
        }
        let store = InmemStore::new(participants.clone(), 100);
        (identities, participants, store)
    }

    fn event(identity: &Identity, self_parent: Hash, index: i64) -> Event {
        let body = EventBody::new(
            vec![],
            vec![],
            self_parent,
            EMPTY_HASH,
            identity.public_bytes(),
            index,
        );
        Event::sign(body, identity).unwrap()
    }

    #[test]
    fn events_by_hash_and_coordinate() {
        let (ids, _, mut store) = setup(2);
        let root = store.get_root(&ids[0].id()).unwrap();
        let e0 = event(&ids[0], root.head, 0);
        let h0 = *e0.hash();
        store.set_event(e0).unwrap();
        let e1 = event(&ids[0], h0, 1);
        let h1 = *e1.hash();
        store.set_event(e1).unwrap();

        assert_eq!(*store.get_event(&h0).unwrap().hash(), h0);
        assert_eq!(store.participant_event(&ids[0].id(), 1).unwrap(), h1);
        assert_eq!(store.last_from(&ids[0].id()).unwrap(), h1);
        assert_eq!(
            store.participant_events(&ids[0].id(), -1).unwrap(),
            vec![h0, h1]
        );

        let known = store.known();
        assert_eq!(known[&ids[0].id()], 1);
        assert_eq!(known[&ids[1].id()], -1);
    }

    #[test]
    fn unknown_creator_is_rejected() {
        let (_, _, mut store) = setup(1);
        let stranger = Identity::generate();
        let e = event(&stranger, EMPTY_HASH, 0);
        assert!(matches!(
            store.set_event(e),
            Err(Error::UnknownParticipant(_))
        ));
    }

    #[test]
    fn last_from_falls_back_to_root() {
        let (ids, _, store) = setup(1);
        let root = store.get_root(&ids[0].id()).unwrap();
        assert_eq!(store.last_from(&ids[0].id()).unwrap(), root.head);
    }

    #[test]
    fn rounds_and_fame() {
        let (ids, _, mut store) = setup(1);
        let root = store.get_root(&ids[0].id()).unwrap();
        let e = event(&ids[0], root.head, 0);
        let h = *e.hash();
        store.set_event(e).unwrap();

        let mut round = RoundInfo::default();
        round.add_event(h, true);
        store.set_round(0, round);
        assert_eq!(store.last_round(), 0);
        assert_eq!(store.round_witnesses(0), vec![h]);

        let mut round = store.get_round(0).unwrap().clone();
        assert!(!round.witnesses_decided());
        round.set_fame(&h, true);
        store.set_round(0, round);
        let round = store.get_round(0).unwrap();
        assert!(round.witnesses_decided());
        assert_eq!(round.famous_witnesses(), vec![h]);
    }

    #[test]
    fn reset_clears_derived_state() {
        let (ids, _, mut store) = setup(1);
        let root = store.get_root(&ids[0].id()).unwrap();
        let e = event(&ids[0], root.head, 0);
        let h = *e.hash();
        store.set_event(e).unwrap();
        store.add_consensus_event(h);
        store.set_round(0, RoundInfo::default());

        store.reset();
        assert!(store.get_event(&h).is_err());
        assert_eq!(store.known()[&ids[0].id()], -1);
        assert_eq!(store.last_round(), -1);
        assert!(store.consensus_events().is_empty());
        // roots survive a reset
        assert_eq!(store.get_root(&ids[0].id()).unwrap(), root);
    }
}
