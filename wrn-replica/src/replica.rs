use crate::log::ReplicaLog;
use crate::message::{
    entries_size, AckMode, Entry, GroupConfig, Message, MsgType, Role, SpeedLevel, NO_CONFLICT,
    NO_NODE,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use wrn_core::{Result, WrenError};

/// Group lifecycle status. A follower that changed terms with a non-empty
/// log sits in `LogConflictCheck` until the leader confirms (or fixes) its
/// tail; no sync requests are issued meanwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    LogConflictCheck,
}

/// Construction parameters for one replication group.
#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub node_id: u64,
    /// Group tag used in log lines, e.g. `slot-3` or `channel-g1:2`.
    pub group: String,
    /// Full replica set, self included. Empty means single-node.
    pub replicas: Vec<u64>,
    pub learners: Vec<u64>,
    /// Whether this group elects its own leader. Slot groups do; channel
    /// groups take their leader from slot configuration instead.
    pub election_on: bool,
    pub election_interval_tick: u64,
    pub heartbeat_interval_tick: u64,
    pub sync_interval_tick: u64,
    pub leader_timeout_max_tick: u64,
    pub max_uncommitted_log_size: u64,
    pub sync_limit_size: u64,
    pub learner_to_follower_min_log_gap: u64,
    pub auto_role_switch: bool,
    pub ack_mode: AckMode,
    pub is_committed_after_applied: bool,
    /// Restored log position.
    pub last_index: u64,
    pub last_term: u32,
    pub applied_index: u64,
    pub term: u32,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            node_id: 0,
            group: String::new(),
            replicas: Vec::new(),
            learners: Vec::new(),
            election_on: true,
            election_interval_tick: 10,
            heartbeat_interval_tick: 1,
            sync_interval_tick: 2,
            leader_timeout_max_tick: 25,
            max_uncommitted_log_size: 32 * 1024 * 1024,
            sync_limit_size: 4 * 1024 * 1024,
            learner_to_follower_min_log_gap: 100,
            auto_role_switch: true,
            ack_mode: AckMode::Majority,
            is_committed_after_applied: false,
            last_index: 0,
            last_term: 0,
            applied_index: 0,
            term: 1,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct SyncInfo {
    /// Next index the replica asked for; it holds everything below it.
    last_sync_index: u64,
}

/// The per-group replication state machine.
pub struct Replica {
    opts: ReplicaOptions,
    node_id: u64,
    role: Role,
    status: Status,
    term: u32,
    leader: u64,
    vote_for: u64,
    votes: HashMap<u64, bool>,
    cfg: GroupConfig,

    election_elapsed: u64,
    randomized_election_tick: u64,
    heartbeat_elapsed: u64,
    conflict_elapsed: u64,

    sync_tick: u64,
    sync_interval_tick: u64,
    syncing: bool,
    syncing_elapsed: u64,
    speed_level: SpeedLevel,
    sync_info: HashMap<u64, SyncInfo>,

    uncommitted_size: u64,
    /// First index appended under each term, for conflict resolution.
    term_start_index: BTreeMap<u32, u64>,
    last_log_term: u32,
    read_only: bool,

    pub log: ReplicaLog,
    msgs: Vec<Message>,
}

impl Replica {
    #[must_use]
    pub fn new(opts: ReplicaOptions) -> Self {
        let node_id = opts.node_id;
        let mut replicas = opts.replicas.clone();
        if replicas.is_empty() {
            replicas.push(node_id);
        }
        let cfg = GroupConfig {
            version: 0,
            term: opts.term,
            leader: NO_NODE,
            replicas,
            learners: opts.learners.clone(),
            migrate_from: NO_NODE,
            migrate_to: NO_NODE,
        };
        let log = ReplicaLog::new(opts.last_index, opts.applied_index);
        let sync_interval_tick = opts.sync_interval_tick.max(1);
        let (term, last_log_term) = (opts.term.max(1), opts.last_term);
        let mut replica = Self {
            opts,
            node_id,
            role: Role::Follower,
            status: Status::Ready,
            term,
            leader: NO_NODE,
            vote_for: NO_NODE,
            votes: HashMap::new(),
            cfg,
            election_elapsed: 0,
            randomized_election_tick: 0,
            heartbeat_elapsed: 0,
            conflict_elapsed: 0,
            sync_tick: 0,
            sync_interval_tick,
            syncing: false,
            syncing_elapsed: 0,
            speed_level: SpeedLevel::Normal,
            sync_info: HashMap::new(),
            uncommitted_size: 0,
            term_start_index: BTreeMap::new(),
            last_log_term,
            read_only: false,
            log,
            msgs: Vec::new(),
        };
        replica.randomized_election_tick = replica.jittered_election_tick();
        if replica.cfg.learners.contains(&node_id) {
            replica.role = Role::Learner;
        } else if replica.is_single_node() {
            let term = replica.term;
            replica.become_leader(term);
        }
        replica
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    #[must_use]
    pub fn term(&self) -> u32 {
        self.term
    }

    #[inline]
    #[must_use]
    pub fn leader(&self) -> u64 {
        self.leader
    }

    #[inline]
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader)
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.cfg
    }

    #[must_use]
    pub fn is_single_node(&self) -> bool {
        self.cfg.replicas.len() <= 1
    }

    fn quorum(&self) -> usize {
        self.cfg.replicas.len() / 2 + 1
    }

    fn is_learner(&self, node: u64) -> bool {
        self.cfg.learners.contains(&node)
    }

    /// Everyone we ping: replicas and learners, minus self.
    fn ping_targets(&self) -> Vec<u64> {
        self.cfg
            .replicas
            .iter()
            .chain(self.cfg.learners.iter())
            .copied()
            .filter(|id| *id != self.node_id)
            .collect()
    }

    fn jittered_election_tick(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::time::SystemTime::now().hash(&mut hasher);
        self.node_id.hash(&mut hasher);
        let base = self.opts.election_interval_tick;
        base + hasher.finish() % base.max(1)
    }

    // =========================================================================
    // Propose
    // =========================================================================

    /// Append a batch of payloads as new log entries. Returns the index
    /// assigned to the last entry.
    pub fn propose(&mut self, batch: Vec<Bytes>) -> Result<u64> {
        if batch.is_empty() {
            return Err(WrenError::ProposalDropped);
        }
        if !self.is_leader() {
            return Err(WrenError::ProposalDropped);
        }
        let mut index = self.log.last_log_index;
        let term = self.term;
        let entries: Vec<Entry> = batch
            .into_iter()
            .map(|data| {
                index += 1;
                Entry::new(index, term, data)
            })
            .collect();
        let last = index;
        self.step(Message {
            msg_type: MsgType::Propose,
            from: self.node_id,
            to: self.node_id,
            entries,
            ..Default::default()
        })?;
        Ok(last)
    }

    // =========================================================================
    // Step
    // =========================================================================

    /// The sole mutator after construction. Term-zero messages are local.
    pub fn step(&mut self, m: Message) -> Result<()> {
        if self.read_only {
            return Err(WrenError::GroupReadOnly(self.opts.group.clone()));
        }
        if m.term > 0 {
            if m.term > self.term {
                tracing::info!(
                    target: "wren::replica",
                    group = %self.opts.group,
                    term = m.term,
                    current_term = self.term,
                    from = m.from,
                    msg = %m.msg_type,
                    "received message with higher term"
                );
                let leader_known = matches!(
                    m.msg_type,
                    MsgType::Ping | MsgType::SyncResp | MsgType::LogConflictCheckResp
                );
                let leader = if leader_known { m.from } else { NO_NODE };
                if self.role == Role::Learner {
                    self.become_learner(m.term, leader);
                } else {
                    self.become_follower(m.term, leader);
                }
            } else if m.term < self.term {
                tracing::debug!(
                    target: "wren::replica",
                    group = %self.opts.group,
                    term = m.term,
                    current_term = self.term,
                    from = m.from,
                    msg = %m.msg_type,
                    "ignoring message with lower term"
                );
                return Ok(());
            }
        }

        match m.msg_type {
            MsgType::InitResp => {
                self.status = Status::Ready;
                if !m.reject {
                    if let Some(cfg) = m.config.clone() {
                        if !cfg.is_empty() {
                            self.switch_config(cfg);
                        }
                    }
                }
            },
            MsgType::Hup => self.hup(),
            MsgType::VoteReq => self.handle_vote_request(&m),
            MsgType::StoreAppendResp => {
                if m.reject {
                    tracing::error!(
                        target: "wren::replica",
                        group = %self.opts.group,
                        index = m.index,
                        "storage append failed, group goes read-only"
                    );
                    self.read_only = true;
                } else {
                    self.log.storaged_to(m.index);
                }
            },
            MsgType::ApplyLogsResp => {
                if !m.reject {
                    self.log.applied_to(m.index);
                    if m.applied_size == 0 {
                        self.uncommitted_size = 0;
                    } else {
                        self.reduce_uncommitted_size(m.applied_size);
                    }
                }
            },
            MsgType::ConfigResp => {
                if !m.reject {
                    if let Some(cfg) = m.config.clone() {
                        self.switch_config(cfg);
                    }
                }
            },
            MsgType::SpeedLevelSet => self.set_speed_level(m.speed_level),
            MsgType::ChangeRole => match m.role {
                Role::Leader => {
                    let term = self.term;
                    self.become_leader(term);
                },
                Role::Candidate => self.become_candidate(),
                Role::Follower => {
                    let (term, leader) = (self.term, self.leader);
                    self.become_follower(term, leader);
                },
                Role::Learner => {
                    let (term, leader) = (self.term, self.leader);
                    self.become_learner(term, leader);
                },
            },
            _ => match self.role {
                Role::Leader => self.step_leader(m)?,
                Role::Follower => self.step_follower(m)?,
                Role::Candidate => self.step_candidate(m),
                Role::Learner => self.step_learner(m)?,
            },
        }
        Ok(())
    }

    fn step_leader(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MsgType::Propose => {
                if m.entries.is_empty() {
                    return Err(WrenError::ProposalDropped);
                }
                if !self.append_entries(m.entries) {
                    return Err(WrenError::ProposalDropped);
                }
                if self.is_single_node() || self.opts.ack_mode == AckMode::None {
                    self.update_leader_committed_index();
                }
            },
            MsgType::Beat => {
                if m.to == NO_NODE || m.to == self.node_id {
                    self.send_ping_all();
                } else {
                    self.send_ping(m.to);
                }
            },
            MsgType::Pong => {
                if m.to != self.node_id || m.term != self.term {
                    return Ok(());
                }
                self.sync_info.entry(m.from).or_default();
            },
            MsgType::SyncGetResp => {
                if !m.reject {
                    let resp = self.new_sync_resp(m.to, m.entries);
                    self.send(resp);
                }
            },
            MsgType::SyncReq => self.handle_sync_req(m),
            MsgType::LogConflictCheck => {
                let index = self.conflict_index_for(m.index, m.log_term);
                let resp = Message {
                    msg_type: MsgType::LogConflictCheckResp,
                    from: self.node_id,
                    to: m.from,
                    term: self.term,
                    index,
                    ..Default::default()
                };
                self.send(resp);
            },
            MsgType::ConfigReq => {
                let resp = Message {
                    msg_type: MsgType::ConfigResp,
                    from: self.node_id,
                    to: m.from,
                    term: self.term,
                    conf_version: self.cfg.version,
                    config: Some(self.cfg.clone()),
                    ..Default::default()
                };
                self.send(resp);
            },
            _ => {},
        }
        Ok(())
    }

    fn handle_sync_req(&mut self, m: Message) {
        let last_index = self.log.last_log_index;
        if m.index <= last_index {
            let (entries, exceed) =
                self.log
                    .entries_from_unstable(m.index, last_index + 1, self.opts.sync_limit_size);
            let served_to_end = entries
                .last()
                .map(|e| e.index >= last_index)
                .unwrap_or(false);
            if exceed || served_to_end {
                let resp = self.new_sync_resp(m.from, entries);
                self.send(resp);
            } else {
                // Range lives in storage; ask the owner to fetch it.
                self.send(Message {
                    msg_type: MsgType::SyncGet,
                    from: self.node_id,
                    to: m.from,
                    index: m.index,
                    entries,
                    ..Default::default()
                });
            }
        } else {
            let resp = self.new_sync_resp(m.from, Vec::new());
            self.send(resp);
        }

        if !self.is_learner(m.from) {
            self.update_replica_sync_info(m.from, m.index);
            self.update_leader_committed_index();
        } else if self.opts.auto_role_switch {
            self.maybe_promote_learner(m.from, m.index);
        }
    }

    fn maybe_promote_learner(&mut self, learner: u64, sync_index: u64) {
        let migrating_from_leader =
            self.cfg.migrate_from != NO_NODE && self.cfg.migrate_from == self.leader;
        let caught_up = if migrating_from_leader {
            sync_index >= self.log.last_log_index + 1
        } else {
            sync_index + self.opts.learner_to_follower_min_log_gap > self.log.last_log_index
        };
        if caught_up {
            tracing::info!(
                target: "wren::replica",
                group = %self.opts.group,
                learner,
                sync_index,
                last_index = self.log.last_log_index,
                "promoting learner to follower"
            );
            self.send(Message {
                msg_type: MsgType::ChangeRole,
                from: self.node_id,
                to: learner,
                term: self.term,
                role: Role::Follower,
                ..Default::default()
            });
            self.cfg.learners.retain(|id| *id != learner);
            if !self.cfg.replicas.contains(&learner) {
                self.cfg.replicas.push(learner);
            }
            self.cfg.version += 1;
        }
    }

    fn step_follower(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MsgType::Ping => {
                self.election_elapsed = 0;
                if self.leader == NO_NODE {
                    let term = self.term;
                    self.become_follower(term, m.from);
                }
                if m.conf_version > self.cfg.version {
                    self.send_config_req(m.from);
                }
                self.set_speed_level(m.speed_level);
                let pong = self.new_pong(m.from);
                self.send(pong);
                self.update_follow_committed_index(m.committed_index);
            },
            MsgType::LogConflictCheckResp => {
                if m.reject {
                    self.status = Status::LogConflictCheck;
                } else {
                    self.status = Status::Ready;
                    if m.index != NO_CONFLICT && m.index > 0 {
                        tracing::info!(
                            target: "wren::replica",
                            group = %self.opts.group,
                            leader = self.leader,
                            index = m.index,
                            last_index = self.log.last_log_index,
                            "truncating log after conflict check"
                        );
                        self.log.truncate_from(m.index);
                        self.last_log_term = self
                            .term_start_index
                            .range(..=u32::MAX)
                            .filter(|(_, start)| **start <= self.log.last_log_index)
                            .map(|(t, _)| *t)
                            .next_back()
                            .unwrap_or(0);
                    }
                }
            },
            MsgType::SyncResp => {
                self.syncing = false;
                self.syncing_elapsed = 0;
                self.election_elapsed = 0;
                if m.reject {
                    return Ok(());
                }
                self.set_speed_level(m.speed_level);
                if !m.entries.is_empty() {
                    if let Some(first) = m.entries.first() {
                        if first.index <= self.log.last_log_index {
                            tracing::warn!(
                                target: "wren::replica",
                                group = %self.opts.group,
                                first_index = first.index,
                                last_index = self.log.last_log_index,
                                "sync response overlaps local log, rechecking for conflicts"
                            );
                            self.enter_conflict_check();
                            return Ok(());
                        }
                    }
                    if !self.append_entries(m.entries) {
                        return Err(WrenError::ProposalDropped);
                    }
                    // More may be waiting; pull again without idling.
                    self.sync_tick = self.sync_interval_tick;
                } else {
                    self.sync_tick = 0;
                }
                self.update_follow_committed_index(m.committed_index);
            },
            _ => {},
        }
        Ok(())
    }

    fn step_learner(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MsgType::Ping => {
                self.election_elapsed = 0;
                if self.leader == NO_NODE {
                    let term = self.term;
                    self.become_learner(term, m.from);
                }
                if m.conf_version > self.cfg.version {
                    self.send_config_req(m.from);
                }
                self.set_speed_level(m.speed_level);
                let pong = self.new_pong(m.from);
                self.send(pong);
            },
            MsgType::LogConflictCheckResp => {
                self.status = Status::Ready;
                if m.index != NO_CONFLICT && m.index > 0 {
                    self.log.truncate_from(m.index);
                }
            },
            MsgType::SyncResp => {
                self.syncing = false;
                self.syncing_elapsed = 0;
                self.election_elapsed = 0;
                if m.reject {
                    return Ok(());
                }
                self.set_speed_level(m.speed_level);
                if !m.entries.is_empty() {
                    if let Some(first) = m.entries.first() {
                        if first.index <= self.log.last_log_index {
                            self.enter_conflict_check();
                            return Ok(());
                        }
                    }
                    if !self.append_entries(m.entries) {
                        return Err(WrenError::ProposalDropped);
                    }
                    self.sync_tick = self.sync_interval_tick;
                } else {
                    self.sync_tick = 0;
                }
            },
            _ => {},
        }
        Ok(())
    }

    fn step_candidate(&mut self, m: Message) {
        match m.msg_type {
            MsgType::Ping => {
                if m.conf_version > self.cfg.version {
                    self.send_config_req(m.from);
                }
                self.become_follower(m.term, m.from);
                let pong = self.new_pong(m.from);
                self.send(pong);
            },
            MsgType::VoteResp => {
                tracing::info!(
                    target: "wren::replica",
                    group = %self.opts.group,
                    from = m.from,
                    reject = m.reject,
                    term = m.term,
                    "received vote response"
                );
                self.poll(&m);
            },
            _ => {},
        }
    }

    // =========================================================================
    // Elections
    // =========================================================================

    fn hup(&mut self) {
        if self.role == Role::Leader || self.role == Role::Learner {
            return;
        }
        if self.status != Status::Ready {
            return;
        }
        self.become_candidate();
        if self.is_single_node() {
            let term = self.term;
            self.become_leader(term);
            return;
        }
        let (term, index) = (self.term, self.log.last_log_index);
        for target in self.ping_targets() {
            if self.is_learner(target) {
                continue;
            }
            self.send(Message {
                msg_type: MsgType::VoteReq,
                from: self.node_id,
                to: target,
                term,
                index,
                ..Default::default()
            });
        }
    }

    fn can_vote(&self, m: &Message) -> bool {
        let vote_ok =
            self.vote_for == NO_NODE || (self.vote_for == m.from && self.leader == NO_NODE);
        vote_ok && m.index >= self.log.last_log_index && m.term >= self.term
    }

    fn handle_vote_request(&mut self, m: &Message) {
        if self.can_vote(m) {
            self.vote_for = m.from;
            self.election_elapsed = 0;
            tracing::info!(
                target: "wren::replica",
                group = %self.opts.group,
                vote_for = m.from,
                term = m.term,
                index = m.index,
                "granting vote"
            );
            self.send(Message {
                msg_type: MsgType::VoteResp,
                from: self.node_id,
                to: m.from,
                term: m.term,
                index: self.log.last_log_index,
                reject: false,
                ..Default::default()
            });
        } else {
            self.send(Message {
                msg_type: MsgType::VoteResp,
                from: self.node_id,
                to: m.from,
                term: m.term,
                index: self.log.last_log_index,
                reject: true,
                ..Default::default()
            });
        }
    }

    fn poll(&mut self, m: &Message) {
        self.votes.insert(m.from, !m.reject);
        let granted = self.votes.values().filter(|v| **v).count();
        let quorum = self.quorum();
        if self.votes.len() < quorum {
            return;
        }
        if granted >= quorum {
            let term = self.term;
            self.become_leader(term);
            self.send_ping_all();
        } else {
            let term = self.term;
            self.become_follower(term, NO_NODE);
        }
    }

    // =========================================================================
    // Role transitions
    // =========================================================================

    fn become_leader(&mut self, term: u32) {
        self.role = Role::Leader;
        self.term = term.max(self.term);
        self.leader = self.node_id;
        self.cfg.leader = self.node_id;
        self.cfg.term = self.term;
        self.heartbeat_elapsed = 0;
        self.election_elapsed = 0;
        self.syncing = false;
        self.sync_info.clear();
        self.status = Status::Ready;
        self.term_start_index
            .insert(self.term, self.log.last_log_index + 1);
        tracing::info!(
            target: "wren::replica",
            group = %self.opts.group,
            term = self.term,
            last_index = self.log.last_log_index,
            "became leader"
        );
        if self.is_single_node() || self.opts.ack_mode == AckMode::None {
            self.update_leader_committed_index();
        }
    }

    fn become_follower(&mut self, term: u32, leader: u64) {
        if term > self.term {
            self.vote_for = NO_NODE;
        }
        let had_leader = self.leader;
        self.role = Role::Follower;
        self.term = term;
        self.leader = leader;
        self.votes.clear();
        self.election_elapsed = 0;
        self.randomized_election_tick = self.jittered_election_tick();
        self.syncing = false;
        self.syncing_elapsed = 0;
        self.sync_tick = 0;
        tracing::info!(
            target: "wren::replica",
            group = %self.opts.group,
            term,
            leader,
            "became follower"
        );
        if leader != NO_NODE
            && leader != had_leader
            && self.log.last_log_index > 0
        {
            self.enter_conflict_check();
        } else if self.status == Status::LogConflictCheck && leader == NO_NODE {
            self.status = Status::Ready;
        }
    }

    fn become_learner(&mut self, term: u32, leader: u64) {
        if term > self.term {
            self.vote_for = NO_NODE;
        }
        self.role = Role::Learner;
        self.term = term;
        self.leader = leader;
        self.votes.clear();
        self.election_elapsed = 0;
        self.syncing = false;
        self.syncing_elapsed = 0;
        self.sync_tick = 0;
        tracing::info!(
            target: "wren::replica",
            group = %self.opts.group,
            term,
            leader,
            "became learner"
        );
    }

    fn become_candidate(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.leader = NO_NODE;
        self.vote_for = self.node_id;
        self.votes.clear();
        self.votes.insert(self.node_id, true);
        self.election_elapsed = 0;
        self.randomized_election_tick = self.jittered_election_tick();
        tracing::info!(
            target: "wren::replica",
            group = %self.opts.group,
            term = self.term,
            "starting election"
        );
    }

    fn enter_conflict_check(&mut self) {
        if self.leader == NO_NODE {
            return;
        }
        self.status = Status::LogConflictCheck;
        self.conflict_elapsed = 0;
        self.send(Message {
            msg_type: MsgType::LogConflictCheck,
            from: self.node_id,
            to: self.leader,
            term: self.term,
            index: self.log.last_log_index,
            log_term: self.last_log_term,
            ..Default::default()
        });
    }

    /// Leader-side conflict resolution: find the first index the follower
    /// must drop, or NO_CONFLICT when its tail is consistent.
    fn conflict_index_for(&self, follower_last_index: u64, follower_last_term: u32) -> u64 {
        if follower_last_index == 0 || follower_last_term >= self.term {
            return NO_CONFLICT;
        }
        // First index of any term newer than the follower's that starts at
        // or below its last index: everything from there on diverged.
        for (term, start) in self.term_start_index.range(follower_last_term + 1..) {
            if *start <= follower_last_index {
                tracing::info!(
                    target: "wren::replica",
                    group = %self.opts.group,
                    follower_last_index,
                    follower_last_term,
                    conflict_term = term,
                    conflict_index = start,
                    "follower log diverges"
                );
                return *start;
            }
        }
        NO_CONFLICT
    }

    fn switch_config(&mut self, cfg: GroupConfig) {
        if cfg.version < self.cfg.version {
            return;
        }
        let was_learner = self.role == Role::Learner;
        self.cfg = cfg;
        let term = self.cfg.term.max(self.term);
        if self.cfg.learners.contains(&self.node_id) {
            if self.role != Role::Learner {
                self.become_learner(term, self.cfg.leader);
            }
        } else if self.cfg.leader == self.node_id {
            if self.role != Role::Leader {
                self.become_leader(term);
            }
        } else if self.cfg.leader != NO_NODE {
            if self.role != Role::Follower || was_learner || self.leader != self.cfg.leader {
                self.become_follower(term, self.cfg.leader);
            }
        }
    }

    // =========================================================================
    // Log + commit
    // =========================================================================

    fn append_entries(&mut self, entries: Vec<Entry>) -> bool {
        let Some(first) = entries.first() else {
            return true;
        };
        if !self.increase_uncommitted_size(&entries) {
            tracing::warn!(
                target: "wren::replica",
                group = %self.opts.group,
                size = self.uncommitted_size,
                max = self.opts.max_uncommitted_log_size,
                "uncommitted log size limit reached, dropping proposal"
            );
            return false;
        }
        if first.index != self.log.last_log_index + 1 {
            tracing::error!(
                target: "wren::replica",
                group = %self.opts.group,
                last_index = self.log.last_log_index,
                start_index = first.index,
                "log index not continuous, group goes read-only"
            );
            self.read_only = true;
            return false;
        }
        if first.index <= self.log.committed_index {
            tracing::error!(
                target: "wren::replica",
                group = %self.opts.group,
                committed = self.log.committed_index,
                start_index = first.index,
                "append below commit index, group goes read-only"
            );
            self.read_only = true;
            return false;
        }
        for entry in &entries {
            if entry.term != self.last_log_term {
                self.term_start_index.insert(entry.term, entry.index);
                self.last_log_term = entry.term;
            }
        }
        self.log.append(entries);
        true
    }

    fn increase_uncommitted_size(&mut self, entries: &[Entry]) -> bool {
        let size = entries_size(entries);
        if self.uncommitted_size > 0
            && size > 0
            && self.uncommitted_size + size > self.opts.max_uncommitted_log_size
        {
            return false;
        }
        self.uncommitted_size += size;
        true
    }

    fn reduce_uncommitted_size(&mut self, size: u64) {
        self.uncommitted_size = self.uncommitted_size.saturating_sub(size);
    }

    fn update_replica_sync_info(&mut self, from: u64, sync_index: u64) {
        let info = self.sync_info.entry(from).or_default();
        if sync_index > info.last_sync_index {
            info.last_sync_index = sync_index;
        }
    }

    fn update_follow_committed_index(&mut self, leader_committed: u64) {
        if leader_committed == 0 || leader_committed <= self.log.committed_index {
            return;
        }
        let new_committed = leader_committed.min(self.log.last_log_index);
        if new_committed > self.log.committed_index {
            self.log.committed_index = new_committed;
            tracing::debug!(
                target: "wren::replica",
                group = %self.opts.group,
                committed = new_committed,
                "follower commit advanced"
            );
        }
    }

    fn update_leader_committed_index(&mut self) -> bool {
        let quorum = self.quorum();
        if self.opts.is_committed_after_applied
            && self.log.applying_index > self.log.applied_index
        {
            return false;
        }
        let candidate = if quorum <= 1 {
            self.log.last_log_index
        } else {
            let mut matches: Vec<u64> = Vec::with_capacity(self.cfg.replicas.len());
            for replica in &self.cfg.replicas {
                if *replica == self.node_id {
                    matches.push(self.log.last_log_index);
                } else {
                    let synced = self
                        .sync_info
                        .get(replica)
                        .map(|info| info.last_sync_index.saturating_sub(1))
                        .unwrap_or(0);
                    matches.push(synced);
                }
            }
            matches.sort_unstable_by(|a, b| b.cmp(a));
            matches[quorum - 1].min(self.log.last_log_index)
        };
        if candidate > self.log.committed_index {
            self.log.committed_index = candidate;
            tracing::debug!(
                target: "wren::replica",
                group = %self.opts.group,
                term = self.term,
                committed = candidate,
                "leader commit advanced"
            );
            return true;
        }
        false
    }

    // =========================================================================
    // Tick + ready
    // =========================================================================

    pub fn tick(&mut self) {
        if self.read_only {
            return;
        }
        match self.role {
            Role::Leader => self.tick_leader(),
            Role::Follower => self.tick_follower(),
            Role::Candidate => self.tick_candidate(),
            Role::Learner => self.tick_learner(),
        }
    }

    fn tick_leader(&mut self) {
        self.heartbeat_elapsed += 1;
        if self.heartbeat_elapsed >= self.opts.heartbeat_interval_tick {
            self.heartbeat_elapsed = 0;
            self.send_ping_all();
        }
    }

    fn tick_follower(&mut self) {
        self.election_elapsed += 1;
        if self.leader != NO_NODE && self.election_elapsed >= self.opts.leader_timeout_max_tick {
            tracing::warn!(
                target: "wren::replica",
                group = %self.opts.group,
                leader = self.leader,
                "leader contact lost"
            );
            self.leader = NO_NODE;
        }
        if self.opts.election_on && self.election_elapsed >= self.randomized_election_tick {
            self.election_elapsed = 0;
            self.hup();
            return;
        }
        self.tick_sync();
    }

    fn tick_candidate(&mut self) {
        self.election_elapsed += 1;
        if self.election_elapsed >= self.randomized_election_tick {
            // No quorum in time: back to follower in the same term.
            let term = self.term;
            self.become_follower(term, NO_NODE);
        }
    }

    fn tick_learner(&mut self) {
        self.election_elapsed += 1;
        if self.leader != NO_NODE && self.election_elapsed >= self.opts.leader_timeout_max_tick {
            self.leader = NO_NODE;
        }
        self.tick_sync();
    }

    fn tick_sync(&mut self) {
        if self.leader == NO_NODE || self.speed_level == SpeedLevel::Stop {
            return;
        }
        if self.status == Status::LogConflictCheck {
            self.conflict_elapsed += 1;
            if self.conflict_elapsed >= self.opts.election_interval_tick {
                self.enter_conflict_check();
            }
            return;
        }
        if self.syncing {
            self.syncing_elapsed += 1;
            if self.syncing_elapsed >= self.opts.leader_timeout_max_tick {
                // Response lost; allow a fresh pull.
                self.syncing = false;
                self.syncing_elapsed = 0;
            }
            return;
        }
        self.sync_tick += 1;
        if self.sync_tick >= self.sync_interval_tick {
            self.sync_tick = 0;
            self.syncing = true;
            self.send(Message {
                msg_type: MsgType::SyncReq,
                from: self.node_id,
                to: self.leader,
                term: self.term,
                index: self.log.last_log_index + 1,
                ..Default::default()
            });
        }
    }

    #[must_use]
    pub fn has_ready(&self) -> bool {
        if self.read_only {
            return false;
        }
        !self.msgs.is_empty()
            || self.log.storaging_index < self.log.last_log_index
            || self.log.next_apply_range().is_some()
    }

    /// Harvest pending work: outbound peer messages plus local
    /// StoreAppend/ApplyLogs messages addressed to the owner.
    pub fn ready(&mut self) -> Vec<Message> {
        let storage_entries = self.log.next_storage_entries();
        if let Some(last) = storage_entries.last() {
            self.log.storaging_to(last.index);
            let msg = Message {
                msg_type: MsgType::StoreAppend,
                from: self.node_id,
                to: self.node_id,
                index: storage_entries.last().map(|e| e.index).unwrap_or(0),
                entries: storage_entries,
                ..Default::default()
            };
            self.msgs.push(msg);
        }
        if let Some((lo, hi)) = self.log.next_apply_range() {
            let (entries, _) = self.log.entries_from_unstable(lo, hi + 1, u64::MAX);
            self.log.applying_to(hi);
            self.msgs.push(Message {
                msg_type: MsgType::ApplyLogs,
                from: self.node_id,
                to: self.node_id,
                index: lo,
                committed_index: hi,
                entries,
                ..Default::default()
            });
        }
        std::mem::take(&mut self.msgs)
    }

    // =========================================================================
    // Message construction
    // =========================================================================

    fn send(&mut self, msg: Message) {
        self.msgs.push(msg);
    }

    fn send_ping(&mut self, to: u64) {
        let msg = Message {
            msg_type: MsgType::Ping,
            from: self.node_id,
            to,
            term: self.term,
            committed_index: self.log.committed_index,
            conf_version: self.cfg.version,
            speed_level: self.speed_level,
            ..Default::default()
        };
        self.send(msg);
    }

    fn send_ping_all(&mut self) {
        for target in self.ping_targets() {
            self.send_ping(target);
        }
    }

    fn send_config_req(&mut self, to: u64) {
        let msg = Message {
            msg_type: MsgType::ConfigReq,
            from: self.node_id,
            to,
            term: self.term,
            conf_version: self.cfg.version,
            ..Default::default()
        };
        self.send(msg);
    }

    fn new_pong(&self, to: u64) -> Message {
        Message {
            msg_type: MsgType::Pong,
            from: self.node_id,
            to,
            term: self.term,
            index: self.log.last_log_index,
            ..Default::default()
        }
    }

    fn new_sync_resp(&self, to: u64, entries: Vec<Entry>) -> Message {
        Message {
            msg_type: MsgType::SyncResp,
            from: self.node_id,
            to,
            term: self.term,
            committed_index: self.log.committed_index,
            speed_level: self.speed_level,
            entries,
            ..Default::default()
        }
    }

    fn set_speed_level(&mut self, level: SpeedLevel) {
        if self.speed_level == level {
            return;
        }
        self.speed_level = level;
        let factor = level.interval_factor();
        if factor > 0 {
            self.sync_interval_tick = self.opts.sync_interval_tick.max(1) * factor;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn opts(node_id: u64, replicas: Vec<u64>) -> ReplicaOptions {
        ReplicaOptions {
            node_id,
            group: format!("test-{node_id}"),
            replicas,
            ..Default::default()
        }
    }

    fn drain_types(replica: &mut Replica) -> Vec<MsgType> {
        replica.ready().iter().map(|m| m.msg_type).collect()
    }

    #[test]
    fn test_single_node_commits_on_append() {
        let mut r = Replica::new(opts(1, vec![1]));
        assert!(r.is_leader());
        let last = r.propose(vec![Bytes::from_static(b"m1")]).unwrap();
        assert_eq!(last, 1);
        assert_eq!(r.log.committed_index, 1);
        let types = drain_types(&mut r);
        assert!(types.contains(&MsgType::StoreAppend));
        assert!(types.contains(&MsgType::ApplyLogs));
    }

    #[test]
    fn test_propose_on_follower_is_dropped() {
        let mut r = Replica::new(opts(2, vec![1, 2, 3]));
        assert_eq!(r.role(), Role::Follower);
        assert!(matches!(
            r.propose(vec![Bytes::from_static(b"x")]),
            Err(WrenError::ProposalDropped)
        ));
    }

    #[test]
    fn test_election_wins_with_quorum() {
        let mut r = Replica::new(opts(1, vec![1, 2, 3]));
        r.step(Message::new(MsgType::Hup)).unwrap();
        assert_eq!(r.role(), Role::Candidate);
        let term = r.term();
        let vote_reqs: Vec<Message> = r
            .ready()
            .into_iter()
            .filter(|m| m.msg_type == MsgType::VoteReq)
            .collect();
        assert_eq!(vote_reqs.len(), 2);

        r.step(Message {
            msg_type: MsgType::VoteResp,
            from: 2,
            to: 1,
            term,
            ..Default::default()
        })
        .unwrap();
        assert!(r.is_leader());
        assert_eq!(r.leader(), 1);
        // Winning broadcasts pings.
        let types = drain_types(&mut r);
        assert!(types.contains(&MsgType::Ping));
    }

    #[test]
    fn test_election_loses_without_quorum() {
        let mut r = Replica::new(opts(1, vec![1, 2, 3]));
        r.step(Message::new(MsgType::Hup)).unwrap();
        let term = r.term();
        for from in [2u64, 3u64] {
            r.step(Message {
                msg_type: MsgType::VoteResp,
                from,
                to: 1,
                term,
                reject: true,
                ..Default::default()
            })
            .unwrap();
        }
        assert_eq!(r.role(), Role::Follower);
        assert_eq!(r.term(), term);
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut r = Replica::new(opts(3, vec![1, 2, 3]));
        r.step(Message {
            msg_type: MsgType::VoteReq,
            from: 1,
            to: 3,
            term: 2,
            index: 10,
            ..Default::default()
        })
        .unwrap();
        let first: Vec<Message> = r.ready();
        let granted = first
            .iter()
            .find(|m| m.msg_type == MsgType::VoteResp)
            .unwrap();
        assert!(!granted.reject);

        // Same term, different candidate: rejected.
        r.step(Message {
            msg_type: MsgType::VoteReq,
            from: 2,
            to: 3,
            term: 2,
            index: 10,
            ..Default::default()
        })
        .unwrap();
        let second: Vec<Message> = r.ready();
        let rejected = second
            .iter()
            .find(|m| m.msg_type == MsgType::VoteResp)
            .unwrap();
        assert!(rejected.reject);
    }

    #[test]
    fn test_vote_rejected_for_stale_log() {
        let mut r = Replica::new(ReplicaOptions {
            last_index: 5,
            last_term: 1,
            ..opts(2, vec![1, 2, 3])
        });
        r.step(Message {
            msg_type: MsgType::VoteReq,
            from: 1,
            to: 2,
            term: 2,
            index: 3,
            ..Default::default()
        })
        .unwrap();
        let msgs = r.ready();
        let resp = msgs
            .iter()
            .find(|m| m.msg_type == MsgType::VoteResp)
            .unwrap();
        assert!(resp.reject);
    }

    #[test]
    fn test_leader_commit_needs_quorum() {
        let mut r = Replica::new(opts(1, vec![1, 2, 3]));
        r.step(Message::new(MsgType::Hup)).unwrap();
        let term = r.term();
        r.step(Message {
            msg_type: MsgType::VoteResp,
            from: 2,
            to: 1,
            term,
            ..Default::default()
        })
        .unwrap();
        assert!(r.is_leader());
        r.propose(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
            .unwrap();
        assert_eq!(r.log.committed_index, 0);

        // Replica 2 pulls from index 3: it holds 1..=2.
        r.step(Message {
            msg_type: MsgType::SyncReq,
            from: 2,
            to: 1,
            term,
            index: 3,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.log.committed_index, 2);
    }

    #[test]
    fn test_follower_commit_is_min_of_leader_and_local() {
        let mut r = Replica::new(opts(2, vec![1, 2, 3]));
        r.step(Message {
            msg_type: MsgType::Ping,
            from: 1,
            to: 2,
            term: 2,
            committed_index: 10,
            ..Default::default()
        })
        .unwrap();
        // Nothing local yet: commit stays at 0.
        assert_eq!(r.log.committed_index, 0);

        r.step(Message {
            msg_type: MsgType::SyncResp,
            from: 1,
            to: 2,
            term: 2,
            committed_index: 10,
            entries: vec![
                Entry::new(1, 2, Bytes::from_static(b"a")),
                Entry::new(2, 2, Bytes::from_static(b"b")),
            ],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.log.last_log_index, 2);
        assert_eq!(r.log.committed_index, 2);
    }

    #[test]
    fn test_follower_syncs_on_tick() {
        let mut r = Replica::new(opts(2, vec![1, 2, 3]));
        r.step(Message {
            msg_type: MsgType::Ping,
            from: 1,
            to: 2,
            term: 2,
            ..Default::default()
        })
        .unwrap();
        r.ready();
        for _ in 0..r.sync_interval_tick {
            r.tick();
        }
        let types = drain_types(&mut r);
        assert!(types.contains(&MsgType::SyncReq));
    }

    #[test]
    fn test_proposal_quota() {
        let mut r = Replica::new(Replica::test_options_with_quota(1, 32));
        // First proposal fits.
        r.propose(vec![Bytes::from_static(b"0123456789")]).unwrap();
        // Second would exceed the 32-byte quota (16 bytes overhead each).
        let res = r.propose(vec![Bytes::from_static(b"0123456789")]);
        assert!(matches!(res, Err(WrenError::ProposalDropped)));
    }

    #[test]
    fn test_learner_promotion_within_gap() {
        let mut leader = Replica::new(ReplicaOptions {
            learners: vec![4],
            election_on: true,
            ..opts(1, vec![1])
        });
        // Single replica + learner: constructor makes us leader.
        assert!(leader.is_leader());
        leader.propose(vec![Bytes::from_static(b"x")]).unwrap();
        let term = leader.term();

        // Learner pulls from index 2 == caught up within the gap.
        leader
            .step(Message {
                msg_type: MsgType::SyncReq,
                from: 4,
                to: 1,
                term,
                index: 2,
                ..Default::default()
            })
            .unwrap();
        let msgs = leader.ready();
        let change = msgs
            .iter()
            .find(|m| m.msg_type == MsgType::ChangeRole)
            .unwrap();
        assert_eq!(change.to, 4);
        assert_eq!(change.role, Role::Follower);
        // Quorum now spans two replicas.
        assert!(leader.config().replicas.contains(&4));
    }

    #[test]
    fn test_conflict_check_truncates() {
        let mut r = Replica::new(ReplicaOptions {
            last_index: 5,
            last_term: 1,
            ..opts(2, vec![1, 2, 3])
        });
        // Learn about a leader: non-empty log enters conflict check.
        r.step(Message {
            msg_type: MsgType::Ping,
            from: 1,
            to: 2,
            term: 3,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.status(), Status::LogConflictCheck);
        let msgs = r.ready();
        assert!(msgs.iter().any(|m| m.msg_type == MsgType::LogConflictCheck));

        // Leader says: truncate from index 4.
        r.step(Message {
            msg_type: MsgType::LogConflictCheckResp,
            from: 1,
            to: 2,
            term: 3,
            index: 4,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.status(), Status::Ready);
        assert_eq!(r.log.last_log_index, 3);
    }

    #[test]
    fn test_conflict_check_no_conflict() {
        let mut r = Replica::new(ReplicaOptions {
            last_index: 5,
            last_term: 1,
            ..opts(2, vec![1, 2, 3])
        });
        r.step(Message {
            msg_type: MsgType::Ping,
            from: 1,
            to: 2,
            term: 3,
            ..Default::default()
        })
        .unwrap();
        r.step(Message {
            msg_type: MsgType::LogConflictCheckResp,
            from: 1,
            to: 2,
            term: 3,
            index: NO_CONFLICT,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.status(), Status::Ready);
        assert_eq!(r.log.last_log_index, 5);
    }

    #[test]
    fn test_storage_failure_marks_group_read_only() {
        let mut r = Replica::new(opts(1, vec![1]));
        r.propose(vec![Bytes::from_static(b"x")]).unwrap();
        r.ready();
        r.step(Message {
            msg_type: MsgType::StoreAppendResp,
            index: 1,
            reject: true,
            ..Default::default()
        })
        .unwrap();
        assert!(r.is_read_only());
        assert!(matches!(
            r.propose(vec![Bytes::from_static(b"y")]),
            Err(WrenError::GroupReadOnly(_))
        ));
    }

    #[test]
    fn test_apply_resp_advances_applied() {
        let mut r = Replica::new(opts(1, vec![1]));
        r.propose(vec![Bytes::from_static(b"x")]).unwrap();
        let msgs = r.ready();
        let apply = msgs
            .iter()
            .find(|m| m.msg_type == MsgType::ApplyLogs)
            .unwrap();
        assert_eq!(apply.index, 1);
        assert_eq!(apply.committed_index, 1);
        assert_eq!(apply.entries.len(), 1);

        r.step(Message {
            msg_type: MsgType::ApplyLogsResp,
            index: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.log.applied_index, 1);
        assert!(r.log.applied_index <= r.log.committed_index);
        assert!(r.log.committed_index <= r.log.last_log_index);
    }

    #[test]
    fn test_appointed_leader_via_config() {
        let mut r = Replica::new(ReplicaOptions {
            election_on: false,
            ..opts(1, vec![1, 2, 3])
        });
        assert_eq!(r.role(), Role::Follower);
        r.step(Message {
            msg_type: MsgType::InitResp,
            config: Some(GroupConfig {
                version: 1,
                term: 2,
                leader: 1,
                replicas: vec![1, 2, 3],
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();
        assert!(r.is_leader());
        assert_eq!(r.term(), 2);
    }

    #[test]
    fn test_higher_term_ping_adopts_leader() {
        let mut r = Replica::new(opts(2, vec![1, 2, 3]));
        r.step(Message {
            msg_type: MsgType::Ping,
            from: 1,
            to: 2,
            term: 7,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.term(), 7);
        assert_eq!(r.leader(), 1);
        // Lower-term traffic is ignored outright.
        r.step(Message {
            msg_type: MsgType::Ping,
            from: 3,
            to: 2,
            term: 2,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.leader(), 1);
    }

    #[test]
    fn test_sync_get_escalation_for_storage_range() {
        let mut r = Replica::new(ReplicaOptions {
            last_index: 100,
            last_term: 1,
            ..opts(1, vec![1, 2])
        });
        let term = r.term();
        let prev = r.term;
        r.become_leader(prev);
        // Follower wants index 1, but memory only holds from 101 on.
        r.step(Message {
            msg_type: MsgType::SyncReq,
            from: 2,
            to: 1,
            term: term.max(r.term()),
            index: 1,
            ..Default::default()
        })
        .unwrap();
        let msgs = r.ready();
        let get = msgs
            .iter()
            .find(|m| m.msg_type == MsgType::SyncGet)
            .unwrap();
        assert_eq!(get.to, 2);
        assert_eq!(get.index, 1);

        // Owner fetched from storage: leader turns it into a SyncResp.
        r.step(Message {
            msg_type: MsgType::SyncGetResp,
            to: 2,
            entries: vec![Entry::new(1, 1, Bytes::from_static(b"old"))],
            ..Default::default()
        })
        .unwrap();
        let msgs = r.ready();
        let resp = msgs
            .iter()
            .find(|m| m.msg_type == MsgType::SyncResp)
            .unwrap();
        assert_eq!(resp.to, 2);
        assert_eq!(resp.entries.len(), 1);
    }
}

#[cfg(test)]
impl Replica {
    fn test_options_with_quota(node_id: u64, max_uncommitted: u64) -> ReplicaOptions {
        ReplicaOptions {
            node_id,
            group: "quota".into(),
            replicas: vec![node_id],
            max_uncommitted_log_size: max_uncommitted,
            ..Default::default()
        }
    }
}
