// THEORY:
// Batch work over a directory is embarrassingly parallel: every image runs its own
// extract -> analyze -> decide chain and nothing is shared between images except
// the reference store. The `WorkerPool` mirrors that:
//
// - A single dispatcher receives `ImageTask`s and hands them round-robin to a fixed
//   set of workers, one per CPU.
// - Each worker runs the CPU-bound pipeline on the blocking thread pool and sends the
//   outcome back on the task's oneshot channel.
// - The caller submits every image up front and gathers the replies with `join_all`,
//   so outcomes come back in submission order regardless of completion order.
//
// A failure is scoped to its image. It turns into an error outcome for that path and
// the rest of the batch keeps going.

use crate::core_modules::utils::image_helper;
use crate::error::{Result, ShapeVisionError};
use crate::pipeline::{ShapePipeline, Verdict};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

const TICKER_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum Job {
    Train { shape: String },
    Classify,
}

#[derive(Debug)]
pub enum TaskOutput {
    /// Number of reference rows appended.
    Trained(usize),
    Classified(Verdict),
}

pub struct ImageTask {
    pub path: PathBuf,
    pub job: Job,
    pub result_sender: oneshot::Sender<Result<TaskOutput>>,
}

/// The result of one image of a batch.
#[derive(Debug)]
pub struct ImageOutcome {
    pub path: PathBuf,
    pub result: Result<TaskOutput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub shape: String,
    pub images: usize,
    pub rows: usize,
    pub failed: Vec<PathBuf>,
}

pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<ImageTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Must be called from within a tokio runtime.
    pub fn new(pipeline: Arc<ShapePipeline>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<ImageTask>();
        let mut workers = Vec::with_capacity(pool_size + 1);

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..pool_size)
            .map(|_| mpsc::unbounded_channel::<ImageTask>())
            .unzip();

        workers.push(tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % pool_size;
            }
        }));

        for mut worker_receiver in worker_receivers {
            let worker_pipeline = Arc::clone(&pipeline);
            workers.push(tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    let ImageTask {
                        path,
                        job,
                        result_sender,
                    } = task;
                    let pipeline = Arc::clone(&worker_pipeline);
                    let result = tokio::task::spawn_blocking(move || {
                        Self::process_image(&pipeline, &path, &job)
                    })
                    .await
                    .map_err(ShapeVisionError::from)
                    .and_then(|result| result);
                    let _ = result_sender.send(result);
                }
            }));
        }

        Self {
            task_sender,
            workers,
        }
    }

    fn process_image(pipeline: &ShapePipeline, path: &Path, job: &Job) -> Result<TaskOutput> {
        let grid = pipeline.load_image(path)?;
        match job {
            Job::Train { shape } => pipeline.train(&grid, shape).map(TaskOutput::Trained),
            Job::Classify => pipeline.classify(&grid).map(TaskOutput::Classified),
        }
    }

    pub async fn submit(&self, path: PathBuf, job: Job) -> Result<TaskOutput> {
        let (result_sender, result_receiver) = oneshot::channel();

        let task = ImageTask {
            path,
            job,
            result_sender,
        };

        self.task_sender
            .send(task)
            .map_err(|_| ShapeVisionError::WorkerPool("failed to send task to worker pool".to_string()))?;

        result_receiver.await.map_err(|_| {
            ShapeVisionError::WorkerPool("failed to receive result from worker".to_string())
        })?
    }

    /// Closes the task channel and waits for the dispatcher and workers to drain.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
    }
}

/// Runs training and classification over whole directories.
pub struct BatchRunner {
    pipeline: Arc<ShapePipeline>,
    worker_pool: WorkerPool,
}

impl BatchRunner {
    /// One worker per CPU.
    pub fn new(pipeline: Arc<ShapePipeline>) -> Self {
        Self::with_workers(pipeline, num_cpus::get())
    }

    pub fn with_workers(pipeline: Arc<ShapePipeline>, workers: usize) -> Self {
        let worker_pool = WorkerPool::new(Arc::clone(&pipeline), workers);
        Self {
            pipeline,
            worker_pool,
        }
    }

    pub fn pipeline(&self) -> &ShapePipeline {
        &self.pipeline
    }

    pub async fn run_paths(&self, paths: Vec<PathBuf>, job: Job) -> Vec<ImageOutcome> {
        let submissions = paths.into_iter().map(|path| {
            let job = job.clone();
            async move {
                let result = self.worker_pool.submit(path.clone(), job).await;
                if let Err(e) = &result {
                    warn!("Skipping {}: {}", path.display(), e);
                }
                ImageOutcome { path, result }
            }
        });
        join_all(submissions).await
    }

    pub async fn classify_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<ImageOutcome>> {
        let paths = image_helper::list_images(&dir)?;
        info!("Classifying {} images from {}", paths.len(), dir.as_ref().display());
        Ok(self.run_paths(paths, Job::Classify).await)
    }

    pub async fn train_dir<P: AsRef<Path>>(&self, shape: &str, dir: P) -> Result<TrainingSummary> {
        self.pipeline.shape(shape)?;
        let paths = image_helper::list_images(&dir)?;
        info!(
            "Training '{}' on {} images from {}",
            shape,
            paths.len(),
            dir.as_ref().display()
        );

        let outcomes = self
            .run_paths(
                paths,
                Job::Train {
                    shape: shape.to_string(),
                },
            )
            .await;

        let mut summary = TrainingSummary {
            shape: shape.to_string(),
            images: outcomes.len(),
            rows: 0,
            failed: Vec::new(),
        };
        for outcome in outcomes {
            match outcome.result {
                Ok(TaskOutput::Trained(rows)) => summary.rows += rows,
                _ => summary.failed.push(outcome.path),
            }
        }
        info!(
            "Finished '{}': {} rows from {} images, {} failed",
            shape,
            summary.rows,
            summary.images,
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Trains every shape from its own sub-directory of `root`, all shapes at once.
    /// Shapes whose directory is missing are skipped.
    pub async fn train_all<P: AsRef<Path>>(&self, root: P) -> Result<Vec<TrainingSummary>> {
        let root = root.as_ref();
        let jobs: Vec<(String, PathBuf)> = self
            .pipeline
            .shapes()
            .iter()
            .filter_map(|shape| {
                let dir = root.join(&shape.training_dir);
                if dir.is_dir() {
                    Some((shape.name.clone(), dir))
                } else {
                    warn!("Skipping shape '{}': {} is not a directory", shape.name, dir.display());
                    None
                }
            })
            .collect();

        let started = Instant::now();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICKER_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                info!("Training in progress, {:.0?} elapsed", started.elapsed());
            }
        });

        let summaries = join_all(
            jobs.iter()
                .map(|(shape, dir)| self.train_dir(shape, dir)),
        )
        .await;
        ticker.abort();

        info!("Training finished in {:.2?}", started.elapsed());
        summaries.into_iter().collect()
    }

    pub async fn shutdown(self) {
        self.worker_pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierConfig, ShapeConfig, bank_kernels_for};
    use crate::core_modules::reference_store::MemoryStore;
    use crate::core_modules::shape::{PoolingParams, PoolingPolicy, ReductionFloor};
    use crate::pipeline::Label;
    use image::{GrayImage, Luma};

    fn bars_pipeline() -> Arc<ShapePipeline> {
        let shape = |name: &str| ShapeConfig {
            name: name.to_string(),
            training_dir: Some(format!("{}_bars", name)),
            pooling: PoolingParams {
                size: 3,
                stride: 2,
                policy: PoolingPolicy::Valid,
            },
            floor: ReductionFloor::MaxWidth(6),
            kernels: bank_kernels_for(name),
        };
        let config = ClassifierConfig {
            shapes: vec![shape("horizontal"), shape("vertical")],
            ..ClassifierConfig::default()
        };
        Arc::new(ShapePipeline::new(config, Arc::new(MemoryStore::new())).unwrap())
    }

    fn save_bar(path: &Path, vertical: bool, start: u32) {
        GrayImage::from_fn(64, 64, |x, y| {
            let along = if vertical { x } else { y };
            Luma([if (start..start + 16).contains(&along) { 255 } else { 0 }])
        })
        .save(path)
        .unwrap();
    }

    #[tokio::test]
    async fn trains_all_shapes_from_their_directories() {
        let root = tempfile::tempdir().unwrap();
        for (dir, vertical) in [("vertical_bars", true), ("horizontal_bars", false)] {
            std::fs::create_dir(root.path().join(dir)).unwrap();
            save_bar(&root.path().join(dir).join("a.png"), vertical, 24);
            save_bar(&root.path().join(dir).join("b.png"), vertical, 20);
        }

        let runner = BatchRunner::with_workers(bars_pipeline(), 3);
        let summaries = runner.train_all(root.path()).await.unwrap();
        assert_eq!(summaries.len(), 2);
        for summary in &summaries {
            assert_eq!(summary.images, 2);
            assert_eq!(summary.rows, 84);
            assert!(summary.failed.is_empty());
        }
        let store = runner.pipeline().store();
        assert_eq!(store.get("vertical_filter_3").unwrap().len(), 12);
        assert_eq!(store.get("horizontal_filter_3").unwrap().len(), 12);
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn missing_training_directory_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("vertical_bars")).unwrap();
        save_bar(&root.path().join("vertical_bars").join("a.png"), true, 24);

        let runner = BatchRunner::with_workers(bars_pipeline(), 2);
        let summaries = runner.train_all(root.path()).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].shape, "vertical");
    }

    #[tokio::test]
    async fn bad_image_does_not_abort_the_batch() {
        let training = tempfile::tempdir().unwrap();
        save_bar(&training.path().join("v.png"), true, 24);
        let runner = BatchRunner::with_workers(bars_pipeline(), 2);
        runner.train_dir("vertical", training.path()).await.unwrap();

        let batch = tempfile::tempdir().unwrap();
        save_bar(&batch.path().join("a.png"), true, 24);
        std::fs::write(batch.path().join("b.png"), b"definitely not a png").unwrap();
        save_bar(&batch.path().join("c.png"), true, 24);

        let outcomes = runner.classify_dir(batch.path()).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[1].result.is_err());
        for outcome in [&outcomes[0], &outcomes[2]] {
            match &outcome.result {
                Ok(TaskOutput::Classified(verdict)) => {
                    assert_eq!(verdict.label, Label::Shape("vertical".to_string()))
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn training_an_unknown_shape_fails_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let runner = BatchRunner::with_workers(bars_pipeline(), 1);
        assert!(matches!(
            runner.train_dir("triangle", dir.path()).await,
            Err(ShapeVisionError::UnknownShape(_))
        ));
    }
}
