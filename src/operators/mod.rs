//! Dataflow operator runtime (§4.9, component C9).
//!
//! Grounded on `harborgrid-justin-rusty-db`'s `event_processing::operators`
//! for the `process(&mut self, x) -> Result<Vec<_>>` operator shape, and on
//! the redesign guidance in the original corpus's asyncio single-event-loop
//! model (`pspf.runtime.executor`): each operator here runs as its own
//! cooperative `tokio` task, connected to its neighbours by a bounded `mpsc`
//! channel (the inbox, §4.9) plus a separate unbounded channel carrying
//! watermarks, which "bypass the inbox and propagate immediately" per spec.
//!
//! Operators themselves stay synchronous, matching the teacher's trait --
//! `process`/`on_watermark` never suspend, so no operator can hold a lock (or
//! anything else) across an `.await`. The surrounding task is what awaits.

pub mod builtin;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as StateValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// How often an operator's task checks for processing-time timer expiry when
/// no new elements or watermarks have arrived. Not exact wall-clock
/// precision, but bounded staleness is acceptable for a processing-time
/// trigger.
const TIMER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One stage of a dataflow graph. `process`/`on_watermark`/`poll_timer` are
/// synchronous: an operator never suspends, it only transforms state and
/// returns output elements for its runtime task to forward.
pub trait Operator<T, U>: Send {
    fn process(&mut self, input: T) -> Result<Vec<U>>;

    /// Reacts to a watermark advancing to `watermark`. Returns any elements
    /// the advance unblocks (e.g. a completed window). The watermark itself
    /// is always propagated downstream regardless of this return value.
    fn on_watermark(&mut self, _watermark: i64) -> Result<Vec<U>> {
        Ok(Vec::new())
    }

    /// Called on `TIMER_POLL_INTERVAL` cadence; lets processing-time timers
    /// fire without waiting on new input.
    fn poll_timer(&mut self) -> Result<Vec<U>> {
        Ok(Vec::new())
    }

    fn snapshot_state(&self) -> StateValue {
        StateValue::Null
    }

    fn restore_state(&mut self, _state: StateValue) -> Result<()> {
        Ok(())
    }
}

/// Type-erased handle to a running operator's checkpoint surface, kept by
/// the [`Pipeline`] so a [`crate::checkpoint::CheckpointManager`] can walk
/// the graph by name without knowing each stage's concrete element types.
pub trait OperatorState: Send + Sync {
    fn name(&self) -> &str;
    fn snapshot(&self) -> StateValue;
    fn restore(&self, state: StateValue) -> Result<()>;
}

struct NamedOperator<T, U, Op> {
    name: String,
    inner: Arc<Mutex<Op>>,
    _marker: std::marker::PhantomData<fn(T) -> U>,
}

impl<T, U, Op> OperatorState for NamedOperator<T, U, Op>
where
    T: Send + 'static,
    U: Send + 'static,
    Op: Operator<T, U> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> StateValue {
        self.inner.lock().snapshot_state()
    }

    fn restore(&self, state: StateValue) -> Result<()> {
        self.inner.lock().restore_state(state)
    }
}

/// Head end of a pipeline stage: what upstream code (a [`crate::source::LogSource`]
/// or a test) feeds records into.
pub struct StageInlet<T> {
    pub elements: mpsc::Sender<T>,
    pub watermarks: mpsc::UnboundedSender<i64>,
}

/// A running dataflow graph: the join handles of every operator task, and a
/// checkpoint-friendly view of their state keyed by the name each was
/// registered under.
pub struct Pipeline {
    handles: Vec<JoinHandle<()>>,
    states: Vec<Arc<dyn OperatorState>>,
}

impl Pipeline {
    pub fn operator_states(&self) -> &[Arc<dyn OperatorState>] {
        &self.states
    }

    /// Awaits every operator task, e.g. after the head inlet has been
    /// dropped and the graph is draining.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "operator task panicked");
            }
        }
    }
}

/// Builds a pipeline one stage at a time. `T` is the element type the next
/// `.then()` call must accept.
pub struct PipelineBuilder<T> {
    inbox_capacity: usize,
    element_rx: mpsc::Receiver<T>,
    watermark_rx: mpsc::UnboundedReceiver<i64>,
    handles: Vec<JoinHandle<()>>,
    states: Vec<Arc<dyn OperatorState>>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Creates a builder along with the inlet that feeds its first stage.
    pub fn new(inbox_capacity: usize) -> (Self, StageInlet<T>) {
        let (element_tx, element_rx) = mpsc::channel(inbox_capacity);
        let (watermark_tx, watermark_rx) = mpsc::unbounded_channel();
        (
            Self {
                inbox_capacity,
                element_rx,
                watermark_rx,
                handles: Vec::new(),
                states: Vec::new(),
            },
            StageInlet {
                elements: element_tx,
                watermarks: watermark_tx,
            },
        )
    }

    /// Appends an operator, spawning its task and returning a builder typed
    /// for whatever comes next.
    pub fn then<U, Op>(self, name: impl Into<String>, operator: Op) -> PipelineBuilder<U>
    where
        U: Send + 'static,
        Op: Operator<T, U> + 'static,
    {
        let name = name.into();
        let operator = Arc::new(Mutex::new(operator));
        let (next_element_tx, next_element_rx) = mpsc::channel(self.inbox_capacity);
        let (next_watermark_tx, next_watermark_rx) = mpsc::unbounded_channel();

        let mut states = self.states;
        states.push(Arc::new(NamedOperator {
            name: name.clone(),
            inner: operator.clone(),
            _marker: std::marker::PhantomData,
        }));

        let mut handles = self.handles;
        handles.push(spawn_stage(name, operator, self.element_rx, self.watermark_rx, next_element_tx, next_watermark_tx));

        PipelineBuilder {
            inbox_capacity: self.inbox_capacity,
            element_rx: next_element_rx,
            watermark_rx: next_watermark_rx,
            handles,
            states,
        }
    }

    /// Finishes the graph. Any elements the last stage emits are dropped
    /// (the builder's terminal stage is expected to be a sink whose
    /// `process` performs its side effect and returns no output).
    pub fn finish(self) -> Pipeline {
        drop(self.element_rx);
        drop(self.watermark_rx);
        Pipeline {
            handles: self.handles,
            states: self.states,
        }
    }
}

fn spawn_stage<T, U, Op>(
    name: String,
    operator: Arc<Mutex<Op>>,
    mut element_rx: mpsc::Receiver<T>,
    mut watermark_rx: mpsc::UnboundedReceiver<i64>,
    element_tx: mpsc::Sender<U>,
    watermark_tx: mpsc::UnboundedSender<i64>,
) -> JoinHandle<()>
where
    T: Send + 'static,
    U: Send + 'static,
    Op: Operator<T, U> + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(TIMER_POLL_INTERVAL);
        loop {
            let outcome = tokio::select! {
                biased;
                Some(watermark) = watermark_rx.recv() => Outcome::Watermark(watermark),
                maybe_item = element_rx.recv() => match maybe_item {
                    Some(item) => Outcome::Element(item),
                    None => Outcome::UpstreamClosed,
                },
                _ = timer.tick() => Outcome::Tick,
            };

            let (outputs, forward_watermark) = match outcome {
                Outcome::Element(item) => {
                    let result = operator.lock().process(item);
                    match result {
                        Ok(outputs) => (outputs, None),
                        Err(e) => {
                            tracing::error!(operator = %name, error = %e, "operator process failed, dropping element");
                            (Vec::new(), None)
                        }
                    }
                }
                Outcome::Watermark(watermark) => {
                    let result = operator.lock().on_watermark(watermark);
                    match result {
                        Ok(outputs) => (outputs, Some(watermark)),
                        Err(e) => {
                            tracing::error!(operator = %name, error = %e, "operator watermark handling failed");
                            (Vec::new(), Some(watermark))
                        }
                    }
                }
                Outcome::Tick => match operator.lock().poll_timer() {
                    Ok(outputs) => (outputs, None),
                    Err(e) => {
                        tracing::error!(operator = %name, error = %e, "operator timer poll failed");
                        (Vec::new(), None)
                    }
                },
                Outcome::UpstreamClosed => break,
            };

            for out in outputs {
                if element_tx.send(out).await.is_err() {
                    tracing::info!(operator = %name, "downstream closed, stopping");
                    return;
                }
            }
            if let Some(watermark) = forward_watermark {
                let _ = watermark_tx.send(watermark);
            }
        }
        tracing::info!(operator = %name, "operator stage stopped, upstream closed");
    })
}

enum Outcome<T> {
    Element(T),
    Watermark(i64),
    Tick,
    UpstreamClosed,
}

#[cfg(test)]
mod tests {
    use super::builtin::{Filter, Map};
    use super::*;

    #[tokio::test]
    async fn map_then_filter_chain_runs_to_completion() {
        let (builder, inlet) = PipelineBuilder::<i32>::new(8);
        let pipeline = builder
            .then("double", Map::new(|x: i32| x * 2))
            .then("evens_only", Filter::new(|x: &i32| x % 4 == 0))
            .finish();

        for i in 0..5 {
            inlet.elements.send(i).await.unwrap();
        }
        drop(inlet);
        pipeline.join().await;
    }
}
