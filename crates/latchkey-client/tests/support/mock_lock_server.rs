//! In-process lock server for integration testing
//!
//! Speaks the 64-byte frame protocol over a real TCP socket and keeps just
//! enough lock state to exercise every client primitive: counted holders,
//! reentrancy, timed waiters with priorities, unlock-first, update and
//! version comparisons, reverse waits and tree marks. Switches let tests
//! stall replies or drop every connection.

use latchkey_protocol::{
    codes, flags, CommandResult, CommandType, Frame, Ident, InitResultCommand, LockCommand,
    LockKey, LockResultCommand, PingResultCommand, RequestCommand, FRAME_SIZE,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Reply = mpsc::UnboundedSender<[u8; FRAME_SIZE]>;
type Slot = (u8, LockKey);

#[derive(Debug, Clone)]
struct Holder {
    id: Ident,
    count: u16,
    depth: u32,
}

struct Waiter {
    seq: u64,
    priority: u8,
    command: LockCommand,
    reply: Reply,
}

enum Attempt {
    Done(LockResultCommand),
    Blocked(Ident),
}

fn version_of(id: &Ident) -> u64 {
    id.to_u64_pair().0
}

fn answer(
    command: &LockCommand,
    result: u8,
    lock_id: Ident,
    local_count: u16,
    depth: u32,
) -> LockResultCommand {
    LockResultCommand {
        command_type: command.command_type,
        request_id: command.request_id,
        result,
        flag: command.flag,
        db_id: command.db_id,
        lock_id,
        lock_key: command.lock_key,
        local_count,
        count: command.count,
        local_r_count: depth.min(u8::MAX as u32) as u8,
        r_count: command.r_count,
    }
}

/// Lock state shared by every connection of one server.
#[derive(Default)]
struct LockEngine {
    keys: HashMap<Slot, Vec<Holder>>,
    /// child -> (parent, marks)
    edges: HashMap<Slot, (LockKey, u32)>,
    waiters: Vec<Waiter>,
    next_seq: u64,
    max_holders: HashMap<Slot, usize>,
}

impl LockEngine {
    fn holders(&self, slot: &Slot) -> &[Holder] {
        self.keys.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }

    fn ancestors(&self, slot: &Slot) -> Vec<Slot> {
        let mut chain = Vec::new();
        let mut current = *slot;
        while let Some((parent, _)) = self.edges.get(&current) {
            let next = (slot.0, *parent);
            if chain.contains(&next) || next == *slot {
                break;
            }
            chain.push(next);
            current = next;
        }
        chain
    }

    /// Holder id of a held ancestor or descendant, if any.
    fn tree_conflict(&self, slot: &Slot) -> Option<Ident> {
        for ancestor in self.ancestors(slot) {
            if let Some(holder) = self.holders(&ancestor).first() {
                return Some(holder.id);
            }
        }
        for (other, holders) in &self.keys {
            if other != slot && !holders.is_empty() && self.ancestors(other).contains(slot) {
                return Some(holders[0].id);
            }
        }
        None
    }

    fn mark_child(command: &LockCommand) -> (Slot, LockKey) {
        let id_as_key = LockKey::from_normalized(*command.lock_id.as_bytes());
        if command.count == 0xffff {
            ((command.db_id, id_as_key), command.lock_key)
        } else {
            ((command.db_id, command.lock_key), id_as_key)
        }
    }

    fn store(&mut self, slot: Slot, holder: Holder) {
        let holders = self.keys.entry(slot).or_default();
        holders.push(holder);
        let len = holders.len();
        let max = self.max_holders.entry(slot).or_default();
        *max = (*max).max(len);
    }

    fn try_lock(&mut self, command: &LockCommand) -> Attempt {
        let slot = (command.db_id, command.lock_key);
        let modifiers = flags::modifiers(command.timeout);

        if command.flag & flags::lock::LOCK_TREE_LOCK != 0 {
            let (child, parent) = Self::mark_child(command);
            return match self.edges.get_mut(&child) {
                Some((_, marks)) => {
                    *marks += 1;
                    Attempt::Done(answer(command, codes::LOCKED_ERROR, command.lock_id, 0, 0))
                }
                None => {
                    self.edges.insert(child, (parent, 1));
                    Attempt::Done(answer(command, codes::SUCCESS, command.lock_id, 0, 0))
                }
            };
        }

        let holders = self.holders(&slot).to_vec();
        let local_count = holders.len() as u16;

        if modifiers & flags::timeout::REVERSE_KEY_LOCK_WAIT != 0 {
            return match holders.first() {
                Some(holder) => {
                    Attempt::Done(answer(command, codes::SUCCESS, holder.id, local_count, 0))
                }
                None => Attempt::Blocked(Ident::ZERO),
            };
        }

        let update = command.flag & flags::lock::UPDATE_WHEN_LOCKED != 0;
        let less_version = modifiers & flags::timeout::LESS_LOCK_VERSION_IS_LOCK_SUCCEED != 0;

        if let Some(position) = holders.iter().position(|h| h.id == command.lock_id) {
            let priority_mode = modifiers & flags::timeout::RCOUNT_IS_PRIORITY != 0;
            let entry = &mut self.keys.get_mut(&slot).expect("holder present")[position];
            if !update && !priority_mode && entry.depth <= u32::from(command.r_count) {
                entry.depth += 1;
            } else if !update {
                return Attempt::Blocked(entry.id);
            }
            let (id, depth) = (entry.id, entry.depth);
            return Attempt::Done(answer(command, codes::SUCCESS, id, local_count, depth));
        }

        if let Some(first) = holders.first() {
            if less_version && version_of(&first.id) > version_of(&command.lock_id) && !update {
                return Attempt::Done(answer(command, codes::SUCCESS, first.id, local_count, 0));
            }
            if less_version && update {
                if version_of(&command.lock_id) > version_of(&first.id) {
                    self.keys.insert(
                        slot,
                        vec![Holder {
                            id: command.lock_id,
                            count: command.count,
                            depth: 1,
                        }],
                    );
                    return Attempt::Done(answer(command, codes::SUCCESS, command.lock_id, 1, 1));
                }
                let locked = answer(command, codes::LOCKED_ERROR, first.id, local_count, 0);
                return Attempt::Done(locked);
            }
        }

        if let Some(holder_id) = self.tree_conflict(&slot) {
            return Attempt::Blocked(holder_id);
        }

        let limit = holders
            .iter()
            .map(|h| h.count)
            .chain(std::iter::once(command.count))
            .min()
            .unwrap_or(0);
        if holders.len() > usize::from(limit) {
            return Attempt::Blocked(holders[0].id);
        }

        let expire_modifiers = flags::modifiers(command.expire);
        let stored = flags::value(command.expire) != 0
            || expire_modifiers & flags::expire::UNLIMITED_EXPIRE_TIME != 0;
        if stored {
            self.store(
                slot,
                Holder {
                    id: command.lock_id,
                    count: command.count,
                    depth: 1,
                },
            );
        }
        Attempt::Done(answer(
            command,
            codes::SUCCESS,
            command.lock_id,
            local_count + u16::from(stored),
            1,
        ))
    }

    fn unlock(&mut self, command: &LockCommand) -> LockResultCommand {
        if command.flag & flags::unlock::UNLOCK_TREE_LOCK != 0 {
            let (child, _) = Self::mark_child(command);
            let Some((_, marks)) = self.edges.get_mut(&child) else {
                return answer(command, codes::UNLOCK_ERROR, command.lock_id, 0, 0);
            };
            *marks -= 1;
            if *marks == 0 {
                self.edges.remove(&child);
            }
            return answer(command, codes::SUCCESS, command.lock_id, 0, 0);
        }

        let slot = (command.db_id, command.lock_key);
        let Some(holders) = self.keys.get_mut(&slot).filter(|h| !h.is_empty()) else {
            return answer(command, codes::UNLOCK_ERROR, command.lock_id, 0, 0);
        };

        let first_lock = command.flag & flags::unlock::UNLOCK_FIRST_LOCK_WHEN_UNLOCKED != 0;
        let position = if command.lock_id.is_zero() && first_lock {
            Some(0)
        } else {
            holders.iter().position(|h| h.id == command.lock_id)
        };
        let Some(position) = position else {
            let owner = holders[0].id;
            let count = holders.len() as u16;
            return answer(command, codes::NOT_OWNER_ERROR, owner, count, 0);
        };

        let holder = &mut holders[position];
        let released = holder.id;
        if holder.depth > 1 {
            holder.depth -= 1;
            let depth = holder.depth;
            let count = holders.len() as u16;
            return answer(command, codes::SUCCESS, released, count, depth);
        }
        holders.remove(position);
        let count = holders.len() as u16;
        if holders.is_empty() {
            self.keys.remove(&slot);
        }
        answer(command, codes::SUCCESS, released, count, 0)
    }

    /// Grants whatever waiters can now proceed, highest priority first.
    fn wake(&mut self) {
        loop {
            self.waiters
                .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            let mut granted = None;
            for index in 0..self.waiters.len() {
                let command = self.waiters[index].command;
                if let Attempt::Done(result) = self.try_lock(&command) {
                    granted = Some((index, result));
                    break;
                }
            }
            let Some((index, result)) = granted else {
                return;
            };
            let waiter = self.waiters.remove(index);
            let _ = waiter.reply.send(result.encode());
        }
    }

    fn expire_waiter(&mut self, seq: u64) {
        if let Some(index) = self.waiters.iter().position(|w| w.seq == seq) {
            let waiter = self.waiters.remove(index);
            let holder = self
                .holders(&(waiter.command.db_id, waiter.command.lock_key))
                .first()
                .map(|h| h.id)
                .unwrap_or(waiter.command.lock_id);
            let _ = waiter
                .reply
                .send(answer(&waiter.command, codes::TIMEOUT, holder, 0, 0).encode());
        }
    }
}

struct ServerState {
    engine: Mutex<LockEngine>,
    paused: AtomicBool,
    /// Requests held back while paused, answered on resume
    stalled: Mutex<Vec<(RequestCommand, Reply)>>,
    clients: Mutex<HashSet<Ident>>,
    sessions: Mutex<Vec<CancellationToken>>,
    handshakes: AtomicUsize,
    requests: AtomicUsize,
}

impl ServerState {
    fn dispatch(self: &Arc<Self>, request: RequestCommand, reply: &Reply) {
        match request {
            RequestCommand::Ping(ping) => {
                let pong = PingResultCommand {
                    request_id: ping.request_id,
                    result: codes::SUCCESS,
                };
                let _ = reply.send(pong.encode());
            }
            RequestCommand::Lock(command) => self.handle_lock(command, reply),
            RequestCommand::Init(_) => {}
        }
    }

    fn handle_lock(self: &Arc<Self>, command: LockCommand, reply: &Reply) {
        let mut engine = self.engine.lock();
        if command.command_type == CommandType::Unlock {
            let result = engine.unlock(&command);
            let _ = reply.send(result.encode());
            engine.wake();
            return;
        }

        match engine.try_lock(&command) {
            Attempt::Done(result) => {
                let _ = reply.send(result.encode());
                engine.wake();
            }
            Attempt::Blocked(holder) => {
                let wait = command.wait_duration();
                if wait.is_zero() {
                    let locked = answer(&command, codes::LOCKED_ERROR, holder, 0, 0);
                    let _ = reply.send(locked.encode());
                    return;
                }
                let seq = engine.next_seq;
                engine.next_seq += 1;
                let modifiers = flags::modifiers(command.timeout);
                let priority = if modifiers & flags::timeout::RCOUNT_IS_PRIORITY != 0 {
                    command.r_count
                } else {
                    0
                };
                engine.waiters.push(Waiter {
                    seq,
                    priority,
                    command,
                    reply: reply.clone(),
                });
                let state = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    state.engine.lock().expire_waiter(seq);
                });
            }
        }
    }
}

/// A running test double. Dropping it stops accepting and closes sessions.
pub struct MockLockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    _accept: JoinHandle<()>,
}

impl MockLockServer {
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0".parse().expect("valid address")).await
    }

    /// Starts on a specific address, e.g. to come back after [`stop`](Self::stop).
    pub async fn start_on(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.expect("Failed to bind mock server");
        let addr = listener.local_addr().expect("bound address");
        let state = Arc::new(ServerState {
            engine: Mutex::new(LockEngine::default()),
            paused: AtomicBool::new(false),
            stalled: Mutex::new(Vec::new()),
            clients: Mutex::new(HashSet::new()),
            sessions: Mutex::new(Vec::new()),
            handshakes: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();

        let accept = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let stream = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(_) => continue,
                        },
                    };
                    let session = shutdown.child_token();
                    state.sessions.lock().push(session.clone());
                    tokio::spawn(serve(stream, state.clone(), session));
                }
            })
        };

        Self {
            addr,
            state,
            shutdown,
            _accept: accept,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Holds back every answer except handshakes until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    /// Answers everything held back since [`pause`](Self::pause), in order.
    pub fn resume(&self) {
        let held = {
            let mut stalled = self.state.stalled.lock();
            self.state.paused.store(false, Ordering::SeqCst);
            std::mem::take(&mut *stalled)
        };
        for (request, reply) in held {
            self.state.dispatch(request, &reply);
        }
    }

    /// Drops every open connection; the listener keeps accepting.
    pub fn kill_connections(&self) {
        for session in self.state.sessions.lock().drain(..) {
            session.cancel();
        }
    }

    /// Stops listening and drops every connection.
    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Completed Init exchanges so far.
    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    /// Distinct client ids seen in handshakes.
    pub fn clients_seen(&self) -> usize {
        self.state.clients.lock().len()
    }

    /// Lock and unlock frames received, answered or not.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn holder_count(&self, db_id: u8, key: impl AsRef<[u8]>) -> usize {
        self.state
            .engine
            .lock()
            .holders(&(db_id, LockKey::new(key)))
            .len()
    }

    /// Highest number of simultaneous holders ever recorded on a key.
    pub fn max_holders(&self, db_id: u8, key: impl AsRef<[u8]>) -> usize {
        self.state
            .engine
            .lock()
            .max_holders
            .get(&(db_id, LockKey::new(key)))
            .copied()
            .unwrap_or(0)
    }

    pub fn waiter_count(&self) -> usize {
        self.state.engine.lock().waiters.len()
    }
}

impl Drop for MockLockServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(stream: TcpStream, state: Arc<ServerState>, session: CancellationToken) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (reply, mut outbox) = mpsc::unbounded_channel::<[u8; FRAME_SIZE]>();

    let writer_session = session.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_session.cancelled() => break,
                frame = outbox.recv() => match frame {
                    Some(frame) => {
                        if writer.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let mut frame = [0u8; FRAME_SIZE];
    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            read = reader.read_exact(&mut frame) => {
                if read.is_err() {
                    break;
                }
            }
        }

        let Ok(request) = RequestCommand::decode(&frame) else {
            continue;
        };
        match request {
            RequestCommand::Init(init) => {
                let fresh = state.clients.lock().insert(init.client_id);
                state.handshakes.fetch_add(1, Ordering::SeqCst);
                let result = CommandResult::Init(InitResultCommand {
                    request_id: init.request_id,
                    result: codes::SUCCESS,
                    init_type: if fresh { 0 } else { 1 },
                });
                let _ = reply.send(result.encode());
            }
            request => {
                if matches!(request, RequestCommand::Lock(_)) {
                    state.requests.fetch_add(1, Ordering::SeqCst);
                }
                {
                    let mut stalled = state.stalled.lock();
                    if state.paused.load(Ordering::SeqCst) {
                        stalled.push((request, reply.clone()));
                        continue;
                    }
                }
                state.dispatch(request, &reply);
            }
        }
    }
    session.cancel();
}
