//! Threaded deployment of the exchange: one worker thread per instrument.
//!
//! Each worker owns its `InstrumentUnit` outright and drains a command
//! channel, so all order flow for an instrument is serialized through a
//! single writer while different instruments run in parallel. Callers get
//! synchronous results over per-request reply channels; depth views are
//! published into a shared map after every state change.

use crate::book::DepthSnapshot;
use crate::config::ExchangeConfig;
use crate::engine::{CancelOutcome, EngineError, ExecutionReport};
use crate::events::Event;
use crate::exchange::{Exchange, InstrumentUnit, SharedMarketView};
use crate::instrument::{Instrument, InstrumentError, InstrumentRegistry, InstrumentStatus};
use crate::ledger::Ledger;
use crate::oracle::{OracleAdapter, PricePoint};
use crate::order::{AmendOrder, CancelOrder, SubmitOrder};
use crate::types::{InstrumentId, SeqNum, Timestamp};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{error, info};

enum Command {
    Submit(
        SubmitOrder,
        Timestamp,
        Sender<Result<ExecutionReport, EngineError>>,
    ),
    Cancel(
        CancelOrder,
        Timestamp,
        Sender<Result<CancelOutcome, EngineError>>,
    ),
    Amend(
        AmendOrder,
        Timestamp,
        Sender<Result<ExecutionReport, EngineError>>,
    ),
    MarkPrice(PricePoint, Timestamp),
    /// No new observation; re-check staleness of the last one.
    EnforceStaleness(Timestamp),
    Funding(Decimal, Timestamp),
    EndCycle(Timestamp, Option<Instrument>),
    Events(SeqNum, Sender<Vec<Event>>),
    Shutdown,
}

struct Worker {
    sender: Sender<Command>,
    handle: JoinHandle<()>,
}

/// The running pipeline. Dropping it without `shutdown` detaches the
/// worker threads; call `shutdown` for an orderly stop.
pub struct TradingPipeline {
    config: ExchangeConfig,
    registry: Mutex<InstrumentRegistry>,
    ledger: Arc<Ledger>,
    view: Arc<SharedMarketView>,
    oracle: Arc<dyn OracleAdapter>,
    workers: HashMap<InstrumentId, Worker>,
    depth: Arc<DashMap<InstrumentId, Arc<DepthSnapshot>>>,
}

impl TradingPipeline {
    /// Take an assembled exchange apart and move each instrument unit
    /// onto its own thread.
    pub fn start(exchange: Exchange) -> Self {
        let (config, registry, ledger, view, oracle, units) = exchange.into_parts();
        let depth: Arc<DashMap<InstrumentId, Arc<DepthSnapshot>>> = Arc::new(DashMap::new());

        let mut workers = HashMap::new();
        for unit in units {
            let id = unit.instrument_id();
            let (sender, receiver) = unbounded();
            let worker_depth = Arc::clone(&depth);
            let handle = std::thread::Builder::new()
                .name(format!("instrument-{}", id.0))
                .spawn(move || worker_loop(unit, receiver, worker_depth))
                .expect("spawn instrument worker");
            workers.insert(id, Worker { sender, handle });
        }
        info!(instruments = workers.len(), "pipeline started");

        Self {
            config,
            registry: Mutex::new(registry),
            ledger,
            view,
            oracle,
            workers,
            depth,
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn view(&self) -> &SharedMarketView {
        &self.view
    }

    pub fn instrument_ids(&self) -> Vec<InstrumentId> {
        self.workers.keys().copied().collect()
    }

    fn worker(&self, id: InstrumentId) -> Result<&Worker, EngineError> {
        self.workers
            .get(&id)
            .ok_or(EngineError::Validation(InstrumentError::NotFound(id)))
    }

    fn request<T>(
        &self,
        id: InstrumentId,
        command: Command,
        reply: Receiver<T>,
    ) -> Result<T, EngineError> {
        let worker = self.worker(id)?;
        worker
            .sender
            .send(command)
            .map_err(|_| EngineError::WorkerUnavailable(id))?;
        reply.recv().map_err(|_| EngineError::WorkerUnavailable(id))
    }

    pub fn submit(
        &self,
        intent: SubmitOrder,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        let id = intent.instrument_id;
        let (tx, rx) = bounded(1);
        self.request(id, Command::Submit(intent, now, tx), rx)?
    }

    pub fn cancel(
        &self,
        intent: CancelOrder,
        now: Timestamp,
    ) -> Result<CancelOutcome, EngineError> {
        let id = intent.instrument_id;
        let (tx, rx) = bounded(1);
        self.request(id, Command::Cancel(intent, now, tx), rx)?
    }

    pub fn amend(
        &self,
        intent: AmendOrder,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        let id = intent.instrument_id;
        let (tx, rx) = bounded(1);
        self.request(id, Command::Amend(intent, now, tx), rx)?
    }

    /// Poll the oracle once and fan the observations out to the workers.
    pub fn poll_oracle(&self, now: Timestamp) -> Result<(), EngineError> {
        for (id, worker) in &self.workers {
            let command = match self.oracle.poll(*id) {
                Some(point) => Command::MarkPrice(point, now),
                None => Command::EnforceStaleness(now),
            };
            worker
                .sender
                .send(command)
                .map_err(|_| EngineError::WorkerUnavailable(*id))?;
        }
        Ok(())
    }

    pub fn apply_funding(
        &self,
        id: InstrumentId,
        rate: Decimal,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        self.worker(id)?
            .sender
            .send(Command::Funding(rate, now))
            .map_err(|_| EngineError::WorkerUnavailable(id))
    }

    pub fn stage_instrument_update(
        &self,
        instrument: Instrument,
    ) -> Result<(), InstrumentError> {
        self.lock_registry().stage_update(instrument)
    }

    pub fn stage_instrument_status(
        &self,
        id: InstrumentId,
        status: InstrumentStatus,
    ) -> Result<(), InstrumentError> {
        self.lock_registry().stage_status(id, status)
    }

    /// Apply staged registry changes and tell every worker to run its
    /// cycle-boundary housekeeping.
    pub fn end_cycle(&self, now: Timestamp) -> Result<(), EngineError> {
        let changed = self.lock_registry().apply_staged(now);
        for (id, worker) in &self.workers {
            let updated = if changed.contains(id) {
                self.lock_registry().get(*id).ok().cloned()
            } else {
                None
            };
            worker
                .sender
                .send(Command::EndCycle(now, updated))
                .map_err(|_| EngineError::WorkerUnavailable(*id))?;
        }
        Ok(())
    }

    /// Latest published depth view, if the worker has produced one.
    pub fn depth(&self, id: InstrumentId) -> Option<Arc<DepthSnapshot>> {
        self.depth.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn events_from(
        &self,
        id: InstrumentId,
        from: SeqNum,
    ) -> Result<Vec<Event>, EngineError> {
        let (tx, rx) = bounded(1);
        self.request(id, Command::Events(from, tx), rx)
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, InstrumentRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Stop every worker and wait for the threads to finish.
    pub fn shutdown(self) {
        for worker in self.workers.values() {
            let _ = worker.sender.send(Command::Shutdown);
        }
        for (id, worker) in self.workers {
            if worker.handle.join().is_err() {
                error!(instrument = id.0, "instrument worker panicked");
            }
        }
        info!("pipeline stopped");
    }
}

fn worker_loop(
    mut unit: InstrumentUnit,
    receiver: Receiver<Command>,
    depth: Arc<DashMap<InstrumentId, Arc<DepthSnapshot>>>,
) {
    let id = unit.instrument_id();
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Submit(intent, now, reply) => {
                let result = unit.submit(intent, now);
                let _ = reply.send(result);
                depth.insert(id, Arc::new(unit.depth(now)));
            }
            Command::Cancel(intent, now, reply) => {
                let result = unit.cancel(intent, now);
                let _ = reply.send(result);
                depth.insert(id, Arc::new(unit.depth(now)));
            }
            Command::Amend(intent, now, reply) => {
                let result = unit.amend(intent, now);
                let _ = reply.send(result);
                depth.insert(id, Arc::new(unit.depth(now)));
            }
            Command::MarkPrice(point, now) => {
                if let Err(err) = unit.on_mark_price(point, now) {
                    error!(instrument = id.0, %err, "mark sweep failed");
                }
                depth.insert(id, Arc::new(unit.depth(now)));
            }
            Command::EnforceStaleness(now) => {
                unit.enforce_staleness(now);
            }
            Command::Funding(rate, now) => {
                if let Err(err) = unit.apply_funding(rate, now) {
                    error!(instrument = id.0, %err, "funding application failed");
                }
            }
            Command::EndCycle(now, updated) => {
                unit.end_cycle(now, updated);
                depth.insert(id, Arc::new(unit.depth(now)));
            }
            Command::Events(from, reply) => {
                let _ = reply.send(unit.events_from(from));
            }
            Command::Shutdown => break,
        }
    }
}
