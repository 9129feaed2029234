//! End-to-end pipeline runs against in-memory stores, local storage on a temp
//! dir and scripted analyzer/transcoder doubles.

use async_trait::async_trait;
use cadence_core::models::{
    JobState, NewTrack, NewUpload, TrackStatus, TranscodeJob, Upload, UploadStatus,
};
use cadence_core::models::Track;
use cadence_core::{PipelineError, QueueConfig, StorageBackend};
use cadence_db::{
    DbError, DbResult, InMemoryTrackStore, InMemoryUploadStore, TrackStore, UploadStore,
};
use cadence_processing::{
    AudioAnalysis, AudioAnalyzer, Bitrate, TranscodeOutput, TranscodeRequest, Transcoder,
};
use cadence_processing::transcode::ProgressFn;
use cadence_storage::{LocalStorage, ObjectInfo, Storage, StorageError, StorageResult};
use cadence_worker::{
    connect_queue, JobContext, JobHandler, ProgressReporter, ProgressSink, TranscodePipeline,
    UploadIntake, WorkerPool,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const MP3_HEADER: &[u8] = b"ID3\x03\x00\x00\x00\x00\x00\x00";

struct FakeAnalyzer {
    duration_secs: f64,
    cover: Option<Vec<u8>>,
}

#[async_trait]
impl AudioAnalyzer for FakeAnalyzer {
    async fn analyze(&self, _path: &Path) -> Result<AudioAnalysis, PipelineError> {
        Ok(AudioAnalysis {
            duration_secs: self.duration_secs,
            tempo_bpm: Some(124.0),
            loudness_lufs: -14.5,
            title: None,
            artist: Some("Test Artist".into()),
            album: None,
            genre: None,
        })
    }

    async fn waveform(
        &self,
        _path: &Path,
        _duration_secs: f64,
        points: usize,
    ) -> Result<Vec<f32>, PipelineError> {
        Ok((0..points).map(|i| (i % 10) as f32 / 10.0).collect())
    }

    async fn extract_cover(&self, _path: &Path) -> Result<Option<Vec<u8>>, PipelineError> {
        Ok(self.cover.clone())
    }
}

#[derive(Default)]
struct FakeTranscoder {
    fail_on: Option<Bitrate>,
    stall_on: Option<Bitrate>,
    calls: Mutex<Vec<Bitrate>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        request: TranscodeRequest,
        progress: ProgressFn<'_>,
    ) -> Result<TranscodeOutput, PipelineError> {
        self.calls.lock().unwrap().push(request.bitrate);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.stall_on == Some(request.bitrate) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        progress(0.25);
        progress(0.5);

        let result = if self.fail_on == Some(request.bitrate) {
            Err(PipelineError::Transcode(format!(
                "ffmpeg {} transcode exited with exit status: 1",
                request.bitrate
            )))
        } else {
            let parent = request.output.parent().unwrap();
            tokio::fs::create_dir_all(parent).await.unwrap();
            let bytes = format!("mp3 {} from {}", request.bitrate, request.input.display());
            tokio::fs::write(&request.output, &bytes).await.unwrap();
            progress(1.0);
            Ok(TranscodeOutput {
                path: request.output,
                size_bytes: bytes.len() as u64,
            })
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct RecordedProgress(Mutex<Vec<u8>>);

impl ProgressSink for RecordedProgress {
    fn record(&self, _job_id: Uuid, percent: u8) {
        self.0.lock().unwrap().push(percent);
    }
}

/// Rejects writes to keys ending in `failing_suffix`, like a bucket refusing one object.
struct RejectingStorage {
    inner: Arc<LocalStorage>,
    failing_suffix: &'static str,
}

#[async_trait]
impl Storage for RejectingStorage {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<String> {
        if key.ends_with(self.failing_suffix) {
            return Err(StorageError::UploadFailed(format!("{}: 503 Slow Down", key)));
        }
        self.inner.put(key, data, content_type).await
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>> {
        self.inner.head(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_type(&self) -> StorageBackend {
        self.inner.backend_type()
    }
}

/// Fails the first `failures` materializations the way a rolled-back transaction does.
struct FlakyTracks {
    inner: InMemoryTrackStore,
    failures: AtomicUsize,
}

#[async_trait]
impl TrackStore for FlakyTracks {
    async fn create(&self, track: NewTrack) -> DbResult<Track> {
        self.inner.create(track).await
    }

    async fn materialize(&self, track: NewTrack, upload_id: Uuid) -> DbResult<Track> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(DbError::Conflict("connection reset by peer".into()));
        }
        self.inner.materialize(track, upload_id).await
    }

    async fn get(&self, id: Uuid) -> DbResult<Option<Track>> {
        self.inner.get(id).await
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> DbResult<Vec<Track>> {
        self.inner.list_by_owner(owner_id).await
    }
}

#[derive(Default)]
struct Faults {
    storage_suffix: Option<&'static str>,
    materialize_failures: usize,
}

struct Harness {
    dir: tempfile::TempDir,
    uploads: Arc<InMemoryUploadStore>,
    tracks: Arc<FlakyTracks>,
    storage: Arc<LocalStorage>,
    transcoder: Arc<FakeTranscoder>,
    pipeline: Arc<TranscodePipeline>,
}

impl Harness {
    async fn new(transcoder: FakeTranscoder, cover: Option<Vec<u8>>) -> Self {
        Self::with_faults(transcoder, cover, Faults::default()).await
    }

    async fn with_faults(transcoder: FakeTranscoder, cover: Option<Vec<u8>>, faults: Faults) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let uploads = Arc::new(InMemoryUploadStore::new());
        let tracks = Arc::new(FlakyTracks {
            inner: InMemoryTrackStore::linked(&uploads),
            failures: AtomicUsize::new(faults.materialize_failures),
        });
        let storage = Arc::new(
            LocalStorage::new(dir.path().join("media"), "http://localhost/media".into())
                .await
                .unwrap(),
        );
        let published: Arc<dyn Storage> = match faults.storage_suffix {
            Some(failing_suffix) => Arc::new(RejectingStorage {
                inner: storage.clone(),
                failing_suffix,
            }),
            None => storage.clone(),
        };
        let transcoder = Arc::new(transcoder);
        let analyzer = Arc::new(FakeAnalyzer {
            duration_secs: 180.0,
            cover,
        });

        let pipeline = Arc::new(
            TranscodePipeline::new(
                uploads.clone(),
                tracks.clone(),
                published,
                analyzer,
                transcoder.clone(),
                dir.path().join("work"),
            )
            .with_waveform_points(1000),
        );

        Self {
            dir,
            uploads,
            tracks,
            storage,
            transcoder,
            pipeline,
        }
    }

    fn incoming(&self, name: &str) -> PathBuf {
        self.dir.path().join("incoming").join(name)
    }

    /// Write `contents` to a temp file and create its Queued upload.
    async fn stage(&self, name: &str, contents: &[u8]) -> (Upload, TranscodeJob) {
        let path = self.incoming(name);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, contents).await.unwrap();

        let upload = self
            .uploads
            .create(NewUpload::new(
                Uuid::new_v4(),
                name,
                "audio/mpeg",
                contents.len() as i64,
                path.to_string_lossy(),
            ))
            .await
            .unwrap();
        let job = TranscodeJob {
            upload_id: upload.id,
            user_id: upload.user_id,
            temp_path: upload.temp_path.clone(),
            temp_file_name: name.to_string(),
            year_month: upload.year_month(),
            request_id: None,
        };
        (upload, job)
    }

    async fn run(
        &self,
        job: &TranscodeJob,
        attempt: u32,
        max_attempts: u32,
    ) -> (Result<(), cadence_core::JobError>, Vec<u8>) {
        let sink = Arc::new(RecordedProgress::default());
        let ctx = JobContext::new(
            attempt,
            max_attempts,
            ProgressReporter::new(job.id(), sink.clone()),
        );
        let result = self.pipeline.handle(job, &ctx).await;
        let progress = sink.0.lock().unwrap().clone();
        (result, progress)
    }

    /// Same as `run`, but through a single-slot pool with a job timeout.
    async fn run_pooled(
        &self,
        job: &TranscodeJob,
        attempt: u32,
        max_attempts: u32,
        timeout: Duration,
    ) -> (Result<(), cadence_core::JobError>, Vec<u8>) {
        let pool = WorkerPool::new(self.pipeline.clone(), 1, timeout);
        let sink = Arc::new(RecordedProgress::default());
        let ctx = JobContext::new(
            attempt,
            max_attempts,
            ProgressReporter::new(job.id(), sink.clone()),
        );
        let result = pool.run(job, &ctx).await;
        let progress = sink.0.lock().unwrap().clone();
        (result, progress)
    }

    async fn upload(&self, id: Uuid) -> Upload {
        self.uploads.get(id).await.unwrap().unwrap()
    }
}

fn mp3_bytes() -> Vec<u8> {
    let mut bytes = MP3_HEADER.to_vec();
    bytes.extend(std::iter::repeat(0x55).take(4096));
    bytes
}

#[tokio::test]
async fn successful_run_publishes_ready_track() {
    let h = Harness::new(FakeTranscoder::default(), Some(vec![0xFF, 0xD8, 0xFF, 0xE0])).await;
    let (upload, job) = h.stage("Night Drive.mp3", &mp3_bytes()).await;

    let (result, progress) = h.run(&job, 1, 3).await;
    result.unwrap();

    let track = h.tracks.get(upload.id).await.unwrap().expect("track created");
    assert_eq!(track.status, TrackStatus::Ready);
    assert!((track.duration_sec - 180.0).abs() <= 1.0);
    assert_eq!(track.title, "Night Drive");
    assert_eq!(track.artist, "Test Artist");
    assert_eq!(track.bpm, Some(124.0));
    for key in [&track.audio_128_key, &track.audio_320_key, &track.waveform_json_key] {
        assert!(!key.is_empty());
        assert!(h.storage.exists(key).await.unwrap(), "{} missing", key);
    }
    let cover_key = track.cover_key.clone().expect("cover published");
    assert!(cover_key.ends_with("/cover.jpg"));
    let original_key = track.original_key.clone().unwrap();
    assert!(original_key.contains("/originals/"));
    assert_eq!(h.storage.get(&original_key).await.unwrap(), mp3_bytes());

    let waveform: serde_json::Value =
        serde_json::from_slice(&h.storage.get(&track.waveform_json_key).await.unwrap()).unwrap();
    assert_eq!(waveform["peaks"].as_array().unwrap().len(), 1000);
    assert_eq!(waveform["sampleRate"], 44100);
    assert_eq!(waveform["duration"], 180.0);

    assert_eq!(h.upload(upload.id).await.status, UploadStatus::Completed);
    assert!(!h.incoming("Night Drive.mp3").exists());
    assert!(!h.dir.path().join("work").join(upload.id.to_string()).exists());

    assert!(progress.windows(2).all(|w| w[0] < w[1]), "{:?}", progress);
    assert_eq!(progress.first(), Some(&5));
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.contains(&50) && progress.contains(&70));
}

#[tokio::test]
async fn empty_input_is_rejected_before_transcoding() {
    let h = Harness::new(FakeTranscoder::default(), None).await;
    let (upload, job) = h.stage("empty.mp3", b"").await;

    let (result, _) = h.run(&job, 1, 3).await;
    let err = result.unwrap_err();
    assert!(!err.is_recoverable());

    let upload = h.upload(upload.id).await;
    assert_eq!(upload.status, UploadStatus::Failed);
    let message = upload.error.unwrap();
    assert!(message.contains("empty"), "{}", message);
    assert!(h.transcoder.calls.lock().unwrap().is_empty());
    assert!(h.tracks.inner.is_empty().await);
    assert!(!h.incoming("empty.mp3").exists());
}

#[tokio::test]
async fn transcode_failure_on_last_attempt_is_terminal() {
    let h = Harness::new(
        FakeTranscoder {
            fail_on: Some(Bitrate::Kbps320),
            ..FakeTranscoder::default()
        },
        None,
    )
    .await;
    let (upload, job) = h.stage("song.mp3", &mp3_bytes()).await;

    let (result, progress) = h.run(&job, 3, 3).await;
    assert!(result.unwrap_err().is_recoverable());

    let stored = h.upload(upload.id).await;
    assert_eq!(stored.status, UploadStatus::Failed);
    assert!(stored.error.unwrap().contains("320kbps"));
    assert!(h.tracks.get(upload.id).await.unwrap().is_none());
    assert!(!h.incoming("song.mp3").exists());
    assert!(!h.dir.path().join("work").join(upload.id.to_string()).exists());

    // publishing waits for both bitrates, so nothing was written
    let prefix = format!("{}/transcoded/{}/", upload.user_id, upload.id);
    assert!(h.storage.list(&prefix).await.unwrap().is_empty());
    assert!(h.tracks.list_by_owner(upload.user_id).await.unwrap().is_empty());

    assert_eq!(
        *h.transcoder.calls.lock().unwrap(),
        vec![Bitrate::Kbps128, Bitrate::Kbps320]
    );
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert!(progress.last().copied().unwrap_or_default() < 100);
}

#[tokio::test]
async fn retryable_failure_keeps_input_for_next_attempt() {
    let h = Harness::new(
        FakeTranscoder {
            fail_on: Some(Bitrate::Kbps128),
            ..FakeTranscoder::default()
        },
        None,
    )
    .await;
    let (upload, job) = h.stage("retry.mp3", &mp3_bytes()).await;

    let (result, _) = h.run(&job, 1, 3).await;
    assert!(result.unwrap_err().is_recoverable());

    let stored = h.upload(upload.id).await;
    assert_eq!(stored.status, UploadStatus::Processing);
    assert!(stored.error.is_some());
    assert!(h.incoming("retry.mp3").exists());
    assert!(h.tracks.inner.is_empty().await);
}

#[tokio::test]
async fn missing_temp_file_fails_fast() {
    let h = Harness::new(FakeTranscoder::default(), None).await;
    let (upload, job) = h.stage("gone.mp3", &mp3_bytes()).await;
    tokio::fs::remove_file(h.incoming("gone.mp3")).await.unwrap();

    let (result, _) = h.run(&job, 1, 3).await;
    assert!(!result.unwrap_err().is_recoverable());

    let stored = h.upload(upload.id).await;
    assert_eq!(stored.status, UploadStatus::Failed);
    assert!(stored.error.unwrap().contains("no longer exists"));
    assert!(h.transcoder.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn existing_track_is_reported_not_overwritten() {
    let h = Harness::new(FakeTranscoder::default(), None).await;
    let (upload, job) = h.stage("dup.mp3", &mp3_bytes()).await;

    h.tracks
        .create(NewTrack {
            id: upload.id,
            owner_id: upload.user_id,
            title: "Earlier".into(),
            artist: "Someone".into(),
            album: None,
            genre: None,
            duration_sec: 1.0,
            bpm: None,
            loudness_lufs: -20.0,
            audio_128_key: "old/128".into(),
            audio_320_key: "old/320".into(),
            waveform_json_key: "old/waveform".into(),
            cover_key: None,
            original_key: None,
        })
        .await
        .unwrap();

    let (result, _) = h.run(&job, 1, 3).await;
    let err = result.unwrap_err();
    assert!(!err.is_recoverable());
    assert!(err.to_string().contains(&upload.id.to_string()));

    let track = h.tracks.get(upload.id).await.unwrap().unwrap();
    assert_eq!(track.title, "Earlier");
    assert_eq!(h.upload(upload.id).await.status, UploadStatus::Failed);
}

#[tokio::test]
async fn completed_upload_is_not_processed_again() {
    let h = Harness::new(FakeTranscoder::default(), None).await;
    let (upload, job) = h.stage("once.mp3", &mp3_bytes()).await;
    h.run(&job, 1, 3).await.0.unwrap();

    let (result, _) = h.run(&job, 1, 3).await;
    assert!(!result.unwrap_err().is_recoverable());
    assert_eq!(h.upload(upload.id).await.status, UploadStatus::Completed);
    assert_eq!(h.transcoder.calls.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_uploads_in_degraded_mode_stay_isolated() {
    let h = Harness::new(FakeTranscoder::default(), None).await;
    let config = QueueConfig {
        redis_url: None,
        concurrency: 2,
        ..QueueConfig::default()
    };
    let pool = WorkerPool::new(h.pipeline.clone(), config.concurrency, config.job_timeout());
    let queue = connect_queue(&config, pool, true).await;
    let intake = UploadIntake::new(h.uploads.clone(), queue.clone());

    let mut ids = Vec::new();
    for name in ["a.mp3", "b.mp3", "c.mp3"] {
        let path = h.incoming(name);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, mp3_bytes()).await.unwrap();
        let submission = intake
            .submit(
                NewUpload::new(Uuid::new_v4(), name, "audio/mpeg", 4106, path.to_string_lossy()),
                None,
            )
            .await
            .unwrap();
        ids.push(submission.upload.id);
    }

    for id in &ids {
        let mut finished = None;
        for _ in 0..500 {
            let status = queue.status(*id).await.unwrap().unwrap();
            if status.state.is_finished() {
                finished = Some(status);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = finished.expect("job finished");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.progress, 100);
    }

    for id in &ids {
        assert_eq!(h.upload(*id).await.status, UploadStatus::Completed);
        let track = h.tracks.get(*id).await.unwrap().unwrap();
        for key in [&track.audio_128_key, &track.audio_320_key, &track.waveform_json_key] {
            assert!(key.contains(&id.to_string()));
            assert!(h.storage.exists(key).await.unwrap());
        }
        let audio = h.storage.get(&track.audio_320_key).await.unwrap();
        assert!(String::from_utf8(audio).unwrap().starts_with("mp3 320kbps"));
    }

    assert!(h.transcoder.max_in_flight.load(Ordering::SeqCst) <= 2);
    queue.shutdown().await;
}

#[tokio::test]
async fn failed_completion_leaves_no_track_and_retry_succeeds() {
    let h = Harness::with_faults(
        FakeTranscoder::default(),
        None,
        Faults {
            materialize_failures: 1,
            ..Faults::default()
        },
    )
    .await;
    let (upload, job) = h.stage("commit.mp3", &mp3_bytes()).await;

    let (result, progress) = h.run(&job, 1, 3).await;
    let err = result.unwrap_err();
    assert!(err.is_recoverable(), "{}", err);

    assert!(h.tracks.get(upload.id).await.unwrap().is_none());
    let stored = h.upload(upload.id).await;
    assert_eq!(stored.status, UploadStatus::Processing);
    assert!(stored.error.unwrap().contains("connection reset"));
    assert!(h.incoming("commit.mp3").exists());
    assert!(!progress.contains(&100));

    let (result, _) = h.run(&job, 2, 3).await;
    result.unwrap();

    let track = h.tracks.get(upload.id).await.unwrap().expect("track created on retry");
    assert_eq!(track.status, TrackStatus::Ready);
    let stored = h.upload(upload.id).await;
    assert_eq!(stored.status, UploadStatus::Completed);
    assert!(stored.error.is_none());
    assert!(!h.incoming("commit.mp3").exists());
}

#[tokio::test]
async fn storage_error_while_publishing_creates_no_track() {
    let h = Harness::with_faults(
        FakeTranscoder::default(),
        None,
        Faults {
            storage_suffix: Some("/waveform.json"),
            ..Faults::default()
        },
    )
    .await;
    let (upload, job) = h.stage("publish.mp3", &mp3_bytes()).await;

    let (result, _) = h.run(&job, 1, 3).await;
    assert!(result.unwrap_err().is_recoverable());
    let stored = h.upload(upload.id).await;
    assert_eq!(stored.status, UploadStatus::Processing);
    assert!(stored.error.unwrap().contains("waveform.json"));
    assert!(h.incoming("publish.mp3").exists());
    assert!(h.tracks.get(upload.id).await.unwrap().is_none());

    let (result, _) = h.run(&job, 3, 3).await;
    assert!(result.is_err());
    let stored = h.upload(upload.id).await;
    assert_eq!(stored.status, UploadStatus::Failed);
    assert!(stored.error.unwrap().contains("waveform.json"));
    assert!(!h.incoming("publish.mp3").exists());
    assert!(h.tracks.get(upload.id).await.unwrap().is_none());
    assert!(h.tracks.list_by_owner(upload.user_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn timed_out_attempt_is_retried_then_fails_on_last_attempt() {
    let h = Harness::new(
        FakeTranscoder {
            stall_on: Some(Bitrate::Kbps320),
            ..FakeTranscoder::default()
        },
        None,
    )
    .await;
    let (upload, job) = h.stage("slow.mp3", &mp3_bytes()).await;
    let timeout = Duration::from_millis(300);
    let work_dir = h.dir.path().join("work").join(upload.id.to_string());

    let (result, progress) = h.run_pooled(&job, 1, 3, timeout).await;
    let err = result.unwrap_err();
    assert!(err.is_recoverable());
    assert!(err.to_string().contains("timed out"));

    let stored = h.upload(upload.id).await;
    assert_eq!(stored.status, UploadStatus::Processing);
    assert!(stored.error.unwrap().contains("timed out"));
    assert!(h.incoming("slow.mp3").exists());
    assert!(!work_dir.exists());
    assert!(h.tracks.get(upload.id).await.unwrap().is_none());
    assert!(progress.last().copied().unwrap_or_default() <= 60);

    let (result, _) = h.run_pooled(&job, 3, 3, timeout).await;
    assert!(result.unwrap_err().to_string().contains("timed out"));

    let stored = h.upload(upload.id).await;
    assert_eq!(stored.status, UploadStatus::Failed);
    assert!(stored.error.unwrap().contains("timed out"));
    assert!(!h.incoming("slow.mp3").exists());
    assert!(!work_dir.exists());
    assert!(h.tracks.get(upload.id).await.unwrap().is_none());
}
