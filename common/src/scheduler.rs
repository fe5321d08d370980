//! Work-stealing scheduler with distributed termination detection.
//!
//! A fixed set of workers (one tokio task each) owns one queue apiece. Workers share no mutable
//! state: they talk only through per-worker mailboxes.
//!
//! # Execution
//!
//! A worker pops tasks from the head of its own queue and runs them through a [`Handler`]. A
//! handler may inject new tasks (e.g. children of a directory being walked); they go to the tail
//! of the local queue.
//!
//! # Stealing
//!
//! A worker whose queue is empty sends a steal request to a victim chosen by the configured
//! [`VictimSelection`]. The victim answers between two tasks, handing over the tail half of its
//! queue in one reply (an empty reply if it has fewer than two queued tasks). On an empty reply
//! the thief asks another victim; after a whole round of refusals it backs off for
//! [`Settings::idle_backoff`] while still serving messages.
//!
//! # Termination
//!
//! Termination uses Safra's token-ring algorithm. Every worker keeps a colour and a balance of
//! work-carrying messages (sent minus received). Only non-empty steal replies carry work; steal
//! requests, empty replies and the token are control messages.
//!
//! - Worker 0 starts a round when it goes idle by sending a white token around the ring and
//!   whitening itself.
//! - An idle worker holding the token adds its balance to the token, blackens it if the worker
//!   is black, forwards it to the next worker and whitens itself.
//! - Receiving work blackens a worker (it cancels its idle announcement).
//! - When the token returns to an idle worker 0 white, with worker 0 white and a total balance of
//!   zero, every queue is empty and no work is in flight: worker 0 broadcasts `Terminate`.
//!   Otherwise it starts another round.
//!
//! Any violation of the protocol (a reply nobody asked for, a token worker 0 never sent, a
//! mailbox that disappeared) is a [`SchedulerError`] and aborts the whole run.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::Instrument;

/// Result of running one task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
}

/// Executes tasks on behalf of a worker.
///
/// Every worker gets its own `State` from [`Handler::init_state`] and hands it back in its
/// [`WorkerReport`] once the run terminates.
pub trait Handler<T>: Send + Sync + 'static {
    type State: Send + 'static;

    fn init_state(&self, rank: usize) -> Self::State;

    /// Runs one task. Tasks pushed onto `spawned` join the worker's local queue.
    fn handle(
        &self,
        rank: usize,
        task: T,
        state: &mut Self::State,
        spawned: &mut Vec<T>,
    ) -> impl std::future::Future<Output = Outcome> + Send;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum VictimSelection {
    #[default]
    Random,
    RoundRobin,
}

#[derive(Copy, Clone, Debug)]
pub struct Settings {
    pub workers: usize,
    pub victim: VictimSelection,
    pub idle_backoff: std::time::Duration,
}

impl Settings {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            victim: VictimSelection::default(),
            idle_backoff: std::time::Duration::from_micros(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("the scheduler needs at least one worker")]
    NoWorkers,
    #[error("worker {rank} lost contact with worker {peer}")]
    LostPeer { rank: usize, peer: usize },
    #[error("worker {rank} received an unexpected {what}")]
    Protocol { rank: usize, what: &'static str },
    #[error("worker task did not complete")]
    Join(#[from] tokio::task::JoinError),
}

/// Per-worker counters. Summed over all workers, `completed + failed == generated`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks seeded on this worker plus tasks its handler spawned
    pub generated: u64,
    pub completed: u64,
    pub failed: u64,
    /// Tasks received through steal replies
    pub stolen: u64,
    /// Tasks handed to thieves
    pub given: u64,
    pub steal_requests: u64,
    pub failed_steals: u64,
    pub token_rounds: u64,
}

impl std::ops::Add for WorkerStats {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            generated: self.generated + other.generated,
            completed: self.completed + other.completed,
            failed: self.failed + other.failed,
            stolen: self.stolen + other.stolen,
            given: self.given + other.given,
            steal_requests: self.steal_requests + other.steal_requests,
            failed_steals: self.failed_steals + other.failed_steals,
            token_rounds: self.token_rounds + other.token_rounds,
        }
    }
}

#[derive(Debug)]
pub struct WorkerReport<S> {
    pub rank: usize,
    pub state: S,
    pub stats: WorkerStats,
}

#[derive(Debug)]
pub struct Report<S> {
    pub workers: Vec<WorkerReport<S>>,
}

impl<S> Report<S> {
    pub fn totals(&self) -> WorkerStats {
        self.workers
            .iter()
            .fold(WorkerStats::default(), |acc, worker| acc + worker.stats)
    }

    /// Worker states in rank order.
    pub fn into_states(self) -> Vec<S> {
        self.workers.into_iter().map(|worker| worker.state).collect()
    }
}

/// Splits `items` into `parts` contiguous runs whose lengths differ by at most one.
pub fn partition_evenly<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    assert!(parts > 0);
    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut iter = items.into_iter();
    (0..parts)
        .map(|part| {
            let len = base + usize::from(part < extra);
            iter.by_ref().take(len).collect()
        })
        .collect()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Color {
    White,
    Black,
}

#[derive(Copy, Clone, Debug)]
struct Token {
    count: i64,
    color: Color,
}

enum Message<T> {
    StealRequest { thief: usize },
    StealReply { victim: usize, tasks: Vec<T> },
    Token(Token),
    Terminate,
}

enum Flow {
    Continue,
    Terminate,
}

type Mailbox<T> = mpsc::UnboundedReceiver<Message<T>>;

struct Worker<T, H: Handler<T>> {
    rank: usize,
    size: usize,
    settings: Settings,
    handler: std::sync::Arc<H>,
    state: H::State,
    queue: VecDeque<T>,
    inbox: Mailbox<T>,
    peers: std::sync::Arc<Vec<mpsc::UnboundedSender<Message<T>>>>,
    rng: rand::rngs::StdRng,
    next_victim: usize,
    steal_target: Option<usize>,
    refusals: usize,
    steal_after: Option<tokio::time::Instant>,
    color: Color,
    balance: i64,
    token: Option<Token>,
    token_out: bool,
    stats: WorkerStats,
}

impl<T: Send + 'static, H: Handler<T>> Worker<T, H> {
    fn new(
        rank: usize,
        settings: Settings,
        handler: std::sync::Arc<H>,
        inbox: Mailbox<T>,
        peers: std::sync::Arc<Vec<mpsc::UnboundedSender<Message<T>>>>,
        seed: Vec<T>,
    ) -> Self {
        let size = peers.len();
        let state = handler.init_state(rank);
        let stats = WorkerStats {
            generated: seed.len() as u64,
            ..Default::default()
        };
        Self {
            rank,
            size,
            settings,
            handler,
            state,
            queue: seed.into(),
            inbox,
            peers,
            rng: rand::rngs::StdRng::seed_from_u64(rank as u64),
            next_victim: (rank + 1) % size,
            steal_target: None,
            refusals: 0,
            steal_after: None,
            color: Color::White,
            balance: 0,
            token: None,
            token_out: false,
            stats,
        }
    }

    async fn run(mut self) -> Result<(WorkerReport<H::State>, Mailbox<T>), SchedulerError> {
        tracing::debug!(
            "worker {} starting with {} tasks",
            self.rank,
            self.queue.len()
        );
        loop {
            while let Ok(message) = self.inbox.try_recv() {
                if let Flow::Terminate = self.on_message(message)? {
                    return Ok(self.finish());
                }
            }
            if let Some(task) = self.queue.pop_front() {
                self.execute(task).await;
                continue;
            }
            if self.size == 1 {
                return Ok(self.finish());
            }
            if let Flow::Terminate = self.announce_idle()? {
                return Ok(self.finish());
            }
            if self.steal_target.is_none() {
                if let Some(deadline) = self.steal_after.take() {
                    match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                        Ok(Some(message)) => {
                            self.steal_after = Some(deadline);
                            if let Flow::Terminate = self.on_message(message)? {
                                return Ok(self.finish());
                            }
                            continue;
                        }
                        Ok(None) => return Err(self.lost(self.rank)),
                        Err(_elapsed) => {}
                    }
                }
                self.request_steal()?;
            }
            let message = self.inbox.recv().await.ok_or_else(|| self.lost(self.rank))?;
            if let Flow::Terminate = self.on_message(message)? {
                return Ok(self.finish());
            }
        }
    }

    async fn execute(&mut self, task: T) {
        let mut spawned = Vec::new();
        let outcome = self
            .handler
            .handle(self.rank, task, &mut self.state, &mut spawned)
            .await;
        match outcome {
            Outcome::Done => self.stats.completed += 1,
            Outcome::Failed => self.stats.failed += 1,
        }
        self.stats.generated += spawned.len() as u64;
        self.queue.extend(spawned);
    }

    fn finish(self) -> (WorkerReport<H::State>, Mailbox<T>) {
        tracing::debug!("worker {} done: {:?}", self.rank, &self.stats);
        (
            WorkerReport {
                rank: self.rank,
                state: self.state,
                stats: self.stats,
            },
            self.inbox,
        )
    }

    fn lost(&self, peer: usize) -> SchedulerError {
        SchedulerError::LostPeer {
            rank: self.rank,
            peer,
        }
    }

    fn protocol(&self, what: &'static str) -> SchedulerError {
        SchedulerError::Protocol {
            rank: self.rank,
            what,
        }
    }

    fn send(&self, peer: usize, message: Message<T>) -> Result<(), SchedulerError> {
        self.peers[peer].send(message).map_err(|_| self.lost(peer))
    }

    fn on_message(&mut self, message: Message<T>) -> Result<Flow, SchedulerError> {
        match message {
            Message::StealRequest { thief } => self.offer_work(thief)?,
            Message::StealReply { victim, tasks } => {
                if self.steal_target != Some(victim) {
                    return Err(self.protocol("steal reply"));
                }
                self.steal_target = None;
                if tasks.is_empty() {
                    self.stats.failed_steals += 1;
                    self.refusals += 1;
                    if self.refusals >= self.size - 1 {
                        self.refusals = 0;
                        self.steal_after =
                            Some(tokio::time::Instant::now() + self.settings.idle_backoff);
                    }
                } else {
                    self.cancel_idle(tasks);
                }
            }
            Message::Token(token) => {
                if self.rank == 0 {
                    if !self.token_out {
                        return Err(self.protocol("token"));
                    }
                    self.token_out = false;
                }
                if self.token.replace(token).is_some() {
                    return Err(self.protocol("second token"));
                }
            }
            Message::Terminate => {
                if self.rank == 0 || !self.queue.is_empty() {
                    return Err(self.protocol("termination"));
                }
                return Ok(Flow::Terminate);
            }
        }
        Ok(Flow::Continue)
    }

    /// Answers a steal request with the tail half of the local queue.
    fn offer_work(&mut self, thief: usize) -> Result<(), SchedulerError> {
        let take = self.queue.len() / 2;
        let tasks: Vec<T> = self.queue.split_off(self.queue.len() - take).into();
        if !tasks.is_empty() {
            tracing::trace!(
                "worker {} gives {} tasks to worker {}",
                self.rank,
                tasks.len(),
                thief
            );
            self.balance += 1;
            self.stats.given += tasks.len() as u64;
        }
        self.send(
            thief,
            Message::StealReply {
                victim: self.rank,
                tasks,
            },
        )
    }

    fn request_steal(&mut self) -> Result<(), SchedulerError> {
        let victim = match self.settings.victim {
            VictimSelection::Random => {
                let pick = self.rng.gen_range(0..self.size - 1);
                if pick >= self.rank { pick + 1 } else { pick }
            }
            VictimSelection::RoundRobin => {
                let pick = self.next_victim;
                self.next_victim = (self.next_victim + 1) % self.size;
                if self.next_victim == self.rank {
                    self.next_victim = (self.next_victim + 1) % self.size;
                }
                pick
            }
        };
        self.steal_target = Some(victim);
        self.stats.steal_requests += 1;
        self.send(victim, Message::StealRequest { thief: self.rank })
    }

    /// New work arrived: whatever this worker said about being idle no longer holds.
    fn cancel_idle(&mut self, tasks: Vec<T>) {
        self.balance -= 1;
        self.color = Color::Black;
        self.refusals = 0;
        self.steal_after = None;
        self.stats.stolen += tasks.len() as u64;
        self.queue.extend(tasks);
    }

    /// Called whenever the worker is idle: moves the termination token along.
    fn announce_idle(&mut self) -> Result<Flow, SchedulerError> {
        let next = (self.rank + 1) % self.size;
        if self.rank != 0 {
            if let Some(token) = self.token.take() {
                let color = if self.color == Color::Black {
                    Color::Black
                } else {
                    token.color
                };
                self.color = Color::White;
                self.send(
                    next,
                    Message::Token(Token {
                        count: token.count + self.balance,
                        color,
                    }),
                )?;
            }
            return Ok(Flow::Continue);
        }
        if let Some(token) = self.token.take() {
            if token.color == Color::White
                && self.color == Color::White
                && token.count + self.balance == 0
            {
                tracing::debug!(
                    "termination detected after {} token rounds",
                    self.stats.token_rounds
                );
                for peer in 1..self.size {
                    self.send(peer, Message::Terminate)?;
                }
                return Ok(Flow::Terminate);
            }
        }
        if !self.token_out {
            self.color = Color::White;
            self.token_out = true;
            self.stats.token_rounds += 1;
            self.send(
                next,
                Message::Token(Token {
                    count: 0,
                    color: Color::White,
                }),
            )?;
        }
        Ok(Flow::Continue)
    }
}

type WorkerResult<T, S> = Result<(WorkerReport<S>, Mailbox<T>), SchedulerError>;

fn mailboxes<T>(
    workers: usize,
) -> (
    std::sync::Arc<Vec<mpsc::UnboundedSender<Message<T>>>>,
    Vec<Mailbox<T>>,
) {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..workers).map(|_| mpsc::unbounded_channel()).unzip();
    (std::sync::Arc::new(senders), receivers)
}

fn spawn_workers<T, H>(
    workers: Vec<Worker<T, H>>,
) -> tokio::task::JoinSet<WorkerResult<T, H::State>>
where
    T: Send + 'static,
    H: Handler<T>,
{
    let mut join_set = tokio::task::JoinSet::new();
    for worker in workers {
        let rank = worker.rank;
        join_set.spawn(
            worker
                .run()
                .instrument(tracing::debug_span!("worker", rank = rank)),
        );
    }
    join_set
}

/// Waits for every worker; the first failure aborts the rest.
async fn join_workers<T, S>(
    mut join_set: tokio::task::JoinSet<WorkerResult<T, S>>,
) -> Result<Report<S>, SchedulerError>
where
    T: Send + 'static,
    S: Send + 'static,
{
    // mailboxes of finished workers stay open until everyone is done so that late control
    // messages addressed to them are not mistaken for a lost peer
    let mut finished = Vec::with_capacity(join_set.len());
    let mut first_error = None;
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(Ok(done)) => finished.push(done),
            Ok(Err(error)) => {
                if first_error.is_none() {
                    tracing::error!("scheduler aborting: {:#}", &error);
                    join_set.abort_all();
                    first_error = Some(error);
                }
            }
            Err(error) => {
                if first_error.is_none() {
                    join_set.abort_all();
                    first_error = Some(error.into());
                }
            }
        }
    }
    if let Some(error) = first_error {
        return Err(error);
    }
    let mut workers: Vec<WorkerReport<S>> =
        finished.into_iter().map(|(report, _inbox)| report).collect();
    workers.sort_by_key(|worker| worker.rank);
    Ok(Report { workers })
}

/// Runs `seeds` (split evenly across workers) and everything they spawn to global termination.
pub async fn run<T, H>(
    settings: &Settings,
    handler: std::sync::Arc<H>,
    seeds: Vec<T>,
) -> Result<Report<H::State>, SchedulerError>
where
    T: Send + 'static,
    H: Handler<T>,
{
    if settings.workers == 0 {
        return Err(SchedulerError::NoWorkers);
    }
    let (peers, inboxes) = mailboxes(settings.workers);
    let workers = inboxes
        .into_iter()
        .zip(partition_evenly(seeds, settings.workers))
        .enumerate()
        .map(|(rank, (inbox, seed))| {
            Worker::new(
                rank,
                *settings,
                handler.clone(),
                inbox,
                peers.clone(),
                seed,
            )
        })
        .collect();
    drop(peers);
    join_workers(spawn_workers(workers)).await
}
