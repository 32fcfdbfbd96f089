//! Background worker applying remote-agent updates to the shared state.
//!
//! Remote window orderings and IMU batches arrive on a bounded channel. The
//! worker records orderings in the agent's window and appends IMU samples to
//! the agent's buffer; buffers are handed to `pre_solve` through
//! [`RemoteSync::imu_snapshot`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::messages::RemoteMsg;
use crate::estimator::EstimatorState;
use crate::imu::ImuBuffer;
use crate::types::AgentId;

/// Timeout for receiving messages. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// IMU history kept before the oldest frame of an agent (s).
const IMU_RETENTION: f64 = 1.0;

pub type ImuBuffers = Arc<Mutex<HashMap<AgentId, ImuBuffer>>>;

pub struct RemoteSync {
    sender: Sender<RemoteMsg>,
    buffers: ImuBuffers,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RemoteSync {
    /// Spawn the worker with a channel of `capacity` messages.
    pub fn spawn(state: Arc<EstimatorState>, capacity: usize) -> Self {
        let (sender, receiver) = bounded::<RemoteMsg>(capacity.max(1));
        let buffers: ImuBuffers = Arc::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let buffers = Arc::clone(&buffers);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || run(receiver, state, buffers, shutdown))
        };

        Self {
            sender,
            buffers,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> Sender<RemoteMsg> {
        self.sender.clone()
    }

    /// Queue a message without blocking. Returns `false` if the queue is full
    /// or the worker has stopped.
    pub fn try_send(&self, msg: RemoteMsg) -> bool {
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!("remote queue full, dropping update from {}", msg.agent());
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Copy of every remote agent's IMU buffer.
    pub fn imu_snapshot(&self) -> HashMap<AgentId, ImuBuffer> {
        self.buffers.lock().clone()
    }

    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// Stop the worker and wait for it.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("remote sync worker panicked");
            }
        }
    }
}

impl Drop for RemoteSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(receiver: Receiver<RemoteMsg>, state: Arc<EstimatorState>, buffers: ImuBuffers, shutdown: Arc<AtomicBool>) {
    info!("remote sync started");
    let mut applied = 0usize;
    while !shutdown.load(Ordering::SeqCst) {
        match receiver.recv_timeout(RECV_TIMEOUT) {
            Ok(msg) => {
                apply(&state, &buffers, msg);
                applied += 1;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // Drain what is already queued so callers that stop right after sending
    // still see their updates.
    while let Ok(msg) = receiver.try_recv() {
        apply(&state, &buffers, msg);
        applied += 1;
    }
    info!("remote sync stopped after {} updates", applied);
}

/// Apply one remote update.
pub fn apply(state: &EstimatorState, buffers: &Mutex<HashMap<AgentId, ImuBuffer>>, msg: RemoteMsg) {
    match msg {
        RemoteMsg::Window { agent, frame_ids } => {
            state.update_sldwin(agent, frame_ids);
            if let Some(first) = state.first_frame(agent) {
                let horizon = first.stamp + state.td(agent) - IMU_RETENTION;
                if let Some(buffer) = buffers.lock().get_mut(&agent) {
                    buffer.discard_before(horizon);
                }
            }
        }
        RemoteMsg::Imu { agent, samples } => {
            if agent == state.local_agent() {
                warn!("ignoring remote IMU batch for local agent {}", agent);
                return;
            }
            let count = samples.len();
            let mut buffers = buffers.lock();
            let buffer = buffers.entry(agent).or_default();
            let before = buffer.len();
            buffer.extend(samples);
            let rejected = count - (buffer.len() - before);
            if rejected > 0 {
                debug!("{}: {} out-of-order IMU samples rejected", agent, rejected);
            }
        }
    }
}
