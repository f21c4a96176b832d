//! Fixtures shared by the pipeline and recovery tests.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{oneshot, Notify};

use crate::job::Rotation;
use crate::layout::Layout;
use crate::ownership::OwnershipStore;
use crate::pipeline::TranscodePipeline;
use crate::pool::WorkerPool;
use crate::transcode::{MediaTool, ToolError, TranscodeOptions};

/// [`MediaTool`] that copies files instead of encoding and records each call
#[derive(Default)]
pub struct StubTool {
    pub rotation: Option<Rotation>,
    pub duration: f64,
    pub fail_thumbnail: bool,
    calls: Mutex<Vec<String>>,
}

impl StubTool {
    pub fn new() -> Self {
        Self {
            rotation: Some(Rotation::None),
            duration: 10.0,
            ..Default::default()
        }
    }

    /// Report `rotation` from the probe, or fail it with `None`
    pub fn with_rotation(mut self, rotation: Option<Rotation>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn failing_thumbnail(mut self) -> Self {
        self.fail_thumbnail = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn stub_failure(tool: &str) -> ToolError {
    ToolError::Failed {
        tool: tool.to_string(),
        exit_code: 1,
        stderr: "stub failure".to_string(),
    }
}

#[async_trait]
impl MediaTool for StubTool {
    async fn extract_rotation(&self, _src: &Path) -> Result<Rotation, ToolError> {
        self.record("rotation".to_string());
        self.rotation.ok_or_else(|| stub_failure("exiftool"))
    }

    async fn extract_duration(&self, _src: &Path) -> Result<f64, ToolError> {
        self.record("duration".to_string());
        Ok(self.duration)
    }

    async fn transcode(
        &self,
        src: &Path,
        dst: &Path,
        options: &TranscodeOptions,
    ) -> Result<(), ToolError> {
        self.record(format!(
            "transcode:{}:{}",
            options.quality.label(),
            options.rotation.degrees()
        ));
        let raw = fs::read_to_string(src)?;
        fs::write(dst, format!("{}:{}", options.quality.label(), raw))?;
        Ok(())
    }

    async fn generate_thumbnail(
        &self,
        _src: &Path,
        dst: &Path,
        at_secs: f64,
        _rotation: Rotation,
    ) -> Result<(), ToolError> {
        self.record(format!("thumbnail@{:.1}", at_secs));
        if self.fail_thumbnail {
            return Err(stub_failure("ffmpeg"));
        }
        fs::write(dst, "jpeg")?;
        Ok(())
    }
}

/// A pipeline over a throwaway temp/serve directory pair
pub struct Fixture {
    pub _dir: TempDir,
    pub layout: Layout,
    pub store: Arc<OwnershipStore>,
    pub tool: Arc<StubTool>,
    pub pipeline: TranscodePipeline,
}

pub fn fixture(tool: StubTool, fast_workers: usize, fast_capacity: usize) -> Fixture {
    fixture_with_slow(tool, fast_workers, fast_capacity, 1, 16)
}

pub fn fixture_with_slow(
    tool: StubTool,
    fast_workers: usize,
    fast_capacity: usize,
    slow_workers: usize,
    slow_capacity: usize,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout {
        temp_dir: dir.path().join("temp"),
        serve_dir: dir.path().join("serve"),
        video_extension: "mp4".to_string(),
        storage_url: "http://localhost/storage".to_string(),
        api_url: "http://localhost".to_string(),
    };
    fs::create_dir_all(&layout.temp_dir).unwrap();
    fs::create_dir_all(&layout.serve_dir).unwrap();

    let store = Arc::new(OwnershipStore::new());
    let tool = Arc::new(tool);
    let pipeline = TranscodePipeline::new(
        layout.clone(),
        Arc::clone(&store),
        tool.clone(),
        WorkerPool::new("fast", fast_workers, fast_capacity),
        WorkerPool::new("slow", slow_workers, slow_capacity),
    );

    Fixture {
        _dir: dir,
        layout,
        store,
        tool,
        pipeline,
    }
}

/// Queue an item that holds one worker of `pool` until the returned
/// handle is notified
pub async fn occupy_worker(pool: &WorkerPool) -> Arc<Notify> {
    let release = Arc::new(Notify::new());
    let (started_tx, started_rx) = oneshot::channel();

    let wait_for = Arc::clone(&release);
    pool.add_blocking(Box::pin(async move {
        let _ = started_tx.send(());
        wait_for.notified().await;
    }))
    .await;

    started_rx.await.unwrap();
    release
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
