use std::sync::{
    mpsc::{channel, Sender},
    Arc, Mutex,
};
use std::thread::JoinHandle;

use anyhow::Result;
use log::{debug, info};

use super::{lock, Frame, Resolution};
use crate::config::{DEFAULT_PREVIEW_HEIGHT, DEFAULT_PREVIEW_WIDTH};

/// Receives frames from the image analysis stage on the executor thread.
pub trait Analyzer: Send + 'static {
    fn analyze(&mut self, frame: &Frame);
}

impl<F> Analyzer for F
where
    F: FnMut(&Frame) + Send + 'static,
{
    fn analyze(&mut self, frame: &Frame) {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureStrategy {
    /// Hold at most one pending frame; newer frames replace it.
    #[default]
    KeepOnlyLatest,
    /// Queue every frame.
    BlockProducer,
}

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    Shutdown,
}

/// A single worker thread running jobs in submission order.
pub struct AnalysisExecutor {
    sender: Sender<Message>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct ExecutorHandle {
    sender: Sender<Message>,
}

impl ExecutorHandle {
    fn execute(&self, job: Job) -> bool {
        self.sender.send(Message::Run(job)).is_ok()
    }
}

impl AnalysisExecutor {
    pub fn single_thread(name: &str) -> Result<Self> {
        let (sender, receiver) = channel::<Message>();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(Message::Run(job)) = receiver.recv() {
                    job();
                }
            })?;
        Ok(Self {
            sender,
            worker: Some(worker),
        })
    }

    /// Returns `false` once the executor has shut down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.handle().execute(Box::new(job))
    }

    fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            sender: self.sender.clone(),
        }
    }

    /// Finish the jobs already queued, then stop the worker.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.sender.send(Message::Shutdown);
            let res = worker.join();
            debug!("analysis executor stopped: {:?}", res.is_ok());
        }
    }
}

impl Drop for AnalysisExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type SharedAnalyzer = Arc<Mutex<Box<dyn Analyzer>>>;

#[derive(Default)]
struct AnalysisState {
    analyzer: Option<(SharedAnalyzer, ExecutorHandle)>,
    pending: Option<Frame>,
    scheduled: bool,
}

struct Shared {
    strategy: BackpressureStrategy,
    state: Mutex<AnalysisState>,
}

impl Shared {
    /// Runs on the executor: analyze the pending frame until none is left.
    fn drain(&self, analyzer: &SharedAnalyzer) {
        loop {
            let frame = {
                let mut state = lock(&self.state);
                match state.pending.take() {
                    Some(frame) => frame,
                    None => {
                        state.scheduled = false;
                        return;
                    }
                }
            };
            lock(analyzer).analyze(&frame);
        }
    }
}

/// Frame entry point handed to a running camera device.
#[derive(Clone)]
pub(crate) struct AnalysisInput {
    shared: Arc<Shared>,
}

impl AnalysisInput {
    pub(crate) fn offer(&self, frame: Frame) {
        let mut state = lock(&self.shared.state);
        let Some((analyzer, executor)) = state.analyzer.clone() else {
            return;
        };

        match self.shared.strategy {
            BackpressureStrategy::KeepOnlyLatest => {
                state.pending = Some(frame);
                if state.scheduled {
                    return;
                }
                state.scheduled = true;
                drop(state);

                let shared = self.shared.clone();
                if !executor.execute(Box::new(move || shared.drain(&analyzer))) {
                    let mut state = lock(&self.shared.state);
                    state.scheduled = false;
                    state.pending = None;
                }
            }
            BackpressureStrategy::BlockProducer => {
                drop(state);
                executor.execute(Box::new(move || lock(&analyzer).analyze(&frame)));
            }
        }
    }
}

pub struct ImageAnalysisBuilder {
    target_resolution: Resolution,
    strategy: BackpressureStrategy,
}

impl ImageAnalysisBuilder {
    pub fn target_resolution(mut self, resolution: Resolution) -> Self {
        self.target_resolution = resolution;
        self
    }

    pub fn backpressure_strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn build(self) -> ImageAnalysis {
        ImageAnalysis {
            target_resolution: self.target_resolution,
            shared: Arc::new(Shared {
                strategy: self.strategy,
                state: Mutex::new(AnalysisState::default()),
            }),
        }
    }
}

/// Image analysis use case. Frames are dropped until an analyzer is set.
pub struct ImageAnalysis {
    target_resolution: Resolution,
    shared: Arc<Shared>,
}

impl ImageAnalysis {
    pub fn builder() -> ImageAnalysisBuilder {
        ImageAnalysisBuilder {
            target_resolution: Resolution::new(DEFAULT_PREVIEW_WIDTH, DEFAULT_PREVIEW_HEIGHT),
            strategy: BackpressureStrategy::default(),
        }
    }

    pub fn target_resolution(&self) -> Resolution {
        self.target_resolution
    }

    pub fn backpressure_strategy(&self) -> BackpressureStrategy {
        self.shared.strategy
    }

    pub fn set_analyzer(&self, executor: &AnalysisExecutor, analyzer: impl Analyzer) {
        let analyzer: SharedAnalyzer = Arc::new(Mutex::new(Box::new(analyzer)));
        lock(&self.shared.state).analyzer = Some((analyzer, executor.handle()));
        info!("analyzer attached");
    }

    pub fn clear_analyzer(&self) {
        let mut state = lock(&self.shared.state);
        state.analyzer = None;
        state.pending = None;
    }

    pub fn has_analyzer(&self) -> bool {
        lock(&self.shared.state).analyzer.is_some()
    }

    /// Frames waiting for the analyzer.
    pub fn pending_frames(&self) -> usize {
        lock(&self.shared.state).pending.iter().count()
    }

    pub(crate) fn input(&self) -> AnalysisInput {
        AnalysisInput {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use slint::SharedPixelBuffer;

    use super::*;

    fn frame(timestamp_ns: i64) -> Frame {
        Frame::new(SharedPixelBuffer::new(2, 2), timestamp_ns)
    }

    #[test]
    fn executor_runs_jobs_in_order() {
        let mut executor = AnalysisExecutor::single_thread("test-executor").unwrap();
        let seen = Arc::new(Mutex::new(vec![]));
        for i in 0..5 {
            let seen = seen.clone();
            assert!(executor.execute(move || seen.lock().unwrap().push(i)));
        }
        executor.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(!executor.execute(|| {}));
    }

    #[test]
    fn frames_are_dropped_without_analyzer() {
        let analysis = ImageAnalysis::builder().build();
        analysis.input().offer(frame(1));
        assert!(!analysis.has_analyzer());
        assert_eq!(analysis.pending_frames(), 0);
    }

    #[test]
    fn keep_only_latest_skips_stale_frames() {
        let mut executor = AnalysisExecutor::single_thread("test-analysis").unwrap();
        let analysis = ImageAnalysis::builder()
            .backpressure_strategy(BackpressureStrategy::KeepOnlyLatest)
            .build();

        let seen = Arc::new(Mutex::new(vec![]));
        let (started_tx, started_rx) = channel();
        let (gate_tx, gate_rx) = channel::<()>();
        let recorded = seen.clone();
        analysis.set_analyzer(&executor, move |frame: &Frame| {
            recorded.lock().unwrap().push(frame.timestamp_ns);
            if frame.timestamp_ns == 1 {
                let _ = started_tx.send(());
                let _ = gate_rx.recv();
            }
        });

        let input = analysis.input();
        input.offer(frame(1));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for ts in 2..=5 {
            input.offer(frame(ts));
            assert_eq!(analysis.pending_frames(), 1);
        }
        gate_tx.send(()).unwrap();
        executor.shutdown();

        assert_eq!(*seen.lock().unwrap(), vec![1, 5]);
        assert_eq!(analysis.pending_frames(), 0);
    }

    #[test]
    fn block_producer_analyzes_every_frame() {
        let mut executor = AnalysisExecutor::single_thread("test-analysis").unwrap();
        let analysis = ImageAnalysis::builder()
            .backpressure_strategy(BackpressureStrategy::BlockProducer)
            .build();
        let seen = Arc::new(Mutex::new(vec![]));
        let recorded = seen.clone();
        analysis.set_analyzer(&executor, move |frame: &Frame| {
            recorded.lock().unwrap().push(frame.timestamp_ns)
        });

        let input = analysis.input();
        for ts in 1..=3 {
            input.offer(frame(ts));
        }
        executor.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn clearing_analyzer_stops_delivery() {
        let executor = AnalysisExecutor::single_thread("test-analysis").unwrap();
        let analysis = ImageAnalysis::builder().build();
        analysis.set_analyzer(&executor, |_: &Frame| {});
        assert!(analysis.has_analyzer());
        analysis.clear_analyzer();
        analysis.input().offer(frame(1));
        assert_eq!(analysis.pending_frames(), 0);
    }
}
