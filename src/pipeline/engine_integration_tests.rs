//! End-to-end tests for the fan-out engine.
//!
//! Tests cover:
//! 1. Count mode with one failing job
//! 2. Merge order under scrambled completion
//! 3. Length lanes, empty lanes and skipped records
//! 4. Empty and unparsable corpora
//! 5. Cleanup on success, total failure and cancellation
//! 6. Remote input, upload and download-URL fallback
//! 7. Real child processes (unix only)

use crate::config::{Config, ResultSource};
use crate::corpus::{Corpus, CorpusFormat};
use crate::error::{JobFailure, MergeError, PartitionError, PipelineError};
use crate::io::ObjectStorage;
use crate::pipeline::{Delivery, Engine, InvocationOutput, InvocationRequest, ToolInvoker};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Echoes each input record as `id, sequence, length`.
struct FakePredictor {
    fail_jobs: HashSet<usize>,
    /// Jobs that print an extra column in their header.
    odd_header_jobs: HashSet<usize>,
    delay_ms: fn(usize) -> u64,
    hang: bool,
    calls: Mutex<Vec<(usize, String)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakePredictor {
    fn new() -> Self {
        Self {
            fail_jobs: HashSet::new(),
            odd_header_jobs: HashSet::new(),
            delay_ms: |_| 0,
            hang: false,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn failing(jobs: &[usize]) -> Self {
        Self {
            fail_jobs: jobs.iter().copied().collect(),
            ..Self::new()
        }
    }

    fn lanes_called(&self) -> Vec<String> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls.into_iter().map(|(_, lane)| lane).collect()
    }
}

impl ToolInvoker for FakePredictor {
    fn invoke(&self, request: InvocationRequest) -> BoxFuture<'_, Result<InvocationOutput, JobFailure>> {
        Box::pin(async move {
            let job: usize = request.args[1].parse().unwrap();
            self.calls.lock().unwrap().push((job, request.args[2].clone()));

            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            let delay = if self.hang { 60_000 } else { (self.delay_ms)(job) };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_jobs.contains(&job) {
                return Ok(InvocationOutput {
                    exit_code: Some(2),
                    stdout: Vec::new(),
                    stderr: b"predictor crashed".to_vec(),
                });
            }

            let path = PathBuf::from(&request.args[0]);
            let text = std::fs::read_to_string(&path).map_err(|e| JobFailure::Io(e.to_string()))?;
            let corpus = Corpus::parse(&text, CorpusFormat::from_path(&path).unwrap());

            let mut out = if self.odd_header_jobs.contains(&job) {
                String::from("id\tsequence\tlength\tnote\n")
            } else {
                String::from("id\tsequence\tlength\n")
            };
            for record in corpus.records() {
                out.push_str(&format!("{}\t{}\t{}\n", record.id, record.sequence, record.len()));
            }
            Ok(InvocationOutput {
                exit_code: Some(0),
                stdout: out.into_bytes(),
                stderr: Vec::new(),
            })
        })
    }
}

/// Writes `id` / `job{N}` to the file named by its last argument, relative to its cwd.
struct FileWritingTool;

impl ToolInvoker for FileWritingTool {
    fn invoke(&self, request: InvocationRequest) -> BoxFuture<'_, Result<InvocationOutput, JobFailure>> {
        Box::pin(async move {
            let target = request.cwd.join(request.args.last().unwrap());
            std::fs::write(&target, format!("id\njob{}\n", request.args[1])).unwrap();
            Ok(InvocationOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        })
    }
}

struct Harness {
    scratch: TempDir,
    out: TempDir,
    data: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            scratch: tempfile::tempdir().unwrap(),
            out: tempfile::tempdir().unwrap(),
            data: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self, partition: &str, concurrency: i64) -> Config {
        let yaml = format!(
            r#"
tool:
  program: fake-predictor
  args: ["{{input}}", "{{job}}", "{{lane}}"]
partition:
{partition}
processing:
  concurrency: {concurrency}
  enable_metrics: false
  scratch_dir: "{scratch}"
output:
  local_dir: "{out}"
"#,
            partition = partition,
            concurrency = concurrency,
            scratch = self.scratch.path().display(),
            out = self.out.path().display(),
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn fasta(&self, name: &str, records: &[(&str, &str)]) -> String {
        let path = self.data.path().join(name);
        let text: String = records
            .iter()
            .map(|(id, seq)| format!(">{}\n{}\n", id, seq))
            .collect();
        std::fs::write(&path, text).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn ten_records(&self) -> String {
        let ids: Vec<String> = (0..10).map(|i| format!("r{}", i)).collect();
        let records: Vec<(&str, &str)> = ids.iter().map(|id| (id.as_str(), "SIINFEKL")).collect();
        self.fasta("ten.fsa", &records)
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path()).unwrap().next().is_none()
    }

    fn out_is_empty(&self) -> bool {
        std::fs::read_dir(self.out.path()).unwrap().next().is_none()
    }
}

const COUNT_3: &str = "  mode: count\n  worker_count: 3";
const LANES_8_TO_11: &str = "  mode: by_length\n  lane_lengths: [8, 9, 10, 11]";

fn merged_ids(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(|line| line.split('\t').next().unwrap().to_string())
        .collect()
}

fn delivered_file(delivery: &Delivery) -> PathBuf {
    match delivery {
        Delivery::File { path } => path.clone(),
        other => panic!("expected a local file, got {:?}", other),
    }
}

/// Test 1: ten records over three jobs, the second job fails
#[tokio::test]
async fn test_failed_job_is_isolated() {
    let h = Harness::new();
    let input = h.ten_records();
    let engine = Engine::new(h.config(COUNT_3, 3))
        .unwrap()
        .with_invoker(Arc::new(FakePredictor::failing(&[1])));

    let report = engine.run(&input).await.unwrap();
    assert_eq!(report.row_count, 7);
    assert!(report.partial);
    assert_eq!(report.summary.attempted, 3);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(report.summary.failed, 1);

    let failure = &report.summary.failures[0];
    assert_eq!(failure.seq, 1);
    assert_eq!(failure.chunk_index, 1);
    assert!(failure.reason.contains("exit code 2"));
    assert!(failure.reason.contains("predictor crashed"));

    let path = delivered_file(&report.delivery);
    assert_eq!(merged_ids(&path), vec!["r0", "r1", "r2", "r3", "r7", "r8", "r9"]);
    assert!(std::fs::read_to_string(&path).unwrap().starts_with("id\tsequence\tlength\n"));
    assert!(h.scratch_is_empty());
}

/// Test 2: merged row order follows submission, not completion
#[tokio::test]
async fn test_merge_order_is_deterministic() {
    let h = Harness::new();
    let input = h.ten_records();

    let slow_first = FakePredictor {
        delay_ms: |job| (3 - job as u64) * 40,
        ..FakePredictor::new()
    };
    let slow_last = FakePredictor {
        delay_ms: |job| job as u64 * 40,
        ..FakePredictor::new()
    };

    let first = Engine::new(h.config(COUNT_3, 3))
        .unwrap()
        .with_invoker(Arc::new(slow_first))
        .run(&input)
        .await
        .unwrap();
    let second = Engine::new(h.config(COUNT_3, 3))
        .unwrap()
        .with_invoker(Arc::new(slow_last))
        .run(&input)
        .await
        .unwrap();

    assert_ne!(first.request_id, second.request_id);
    let a = std::fs::read(delivered_file(&first.delivery)).unwrap();
    let b = std::fs::read(delivered_file(&second.delivery)).unwrap();
    assert_eq!(a, b);
}

/// Test 1b: output rejected at merge counts as a failed job in the metrics too
#[tokio::test]
async fn test_merge_rejection_updates_metrics() {
    let h = Harness::new();
    let input = h.ten_records();
    let mut config = h.config(COUNT_3, 3);
    config.processing.enable_metrics = true;
    let engine = Engine::new(config).unwrap().with_invoker(Arc::new(FakePredictor {
        odd_header_jobs: [2].into_iter().collect(),
        ..FakePredictor::new()
    }));

    let report = engine.run(&input).await.unwrap();
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.failures[0].seq, 2);

    let metrics = report.metrics.expect("metrics enabled");
    assert_eq!(metrics.jobs_succeeded, 2);
    assert_eq!(metrics.jobs_failed, 1);
}

/// Test 1c: a shared tool directory needs per-job result names
#[tokio::test]
async fn test_shared_working_dir_result_files() {
    let h = Harness::new();
    let input = h.ten_records();
    let shared = tempfile::tempdir().unwrap();

    let config_for = |name: &str| {
        let mut config = h.config(COUNT_3, 3);
        config.tool.args.push(name.to_string());
        config.tool.working_dir = Some(shared.path().to_path_buf());
        config.tool.result = ResultSource::File { name: name.into() };
        config
    };

    // One name for all jobs would let them overwrite each other.
    assert!(Engine::new(config_for("out.tsv")).is_err());

    let report = Engine::new(config_for("out-{job}.tsv"))
        .unwrap()
        .with_invoker(Arc::new(FileWritingTool))
        .run(&input)
        .await
        .unwrap();
    assert!(!report.partial);
    assert_eq!(merged_ids(&delivered_file(&report.delivery)), vec!["job0", "job1", "job2"]);
    assert!(std::fs::read_dir(shared.path()).unwrap().next().is_none());
}

/// Test 3: lanes by peptide length; lane 10 is empty and gets no job
#[tokio::test]
async fn test_length_lanes() {
    let h = Harness::new();
    let input = h.fasta(
        "lanes.fsa",
        &[
            ("a", "SIINFEKL"),
            ("b", "GILGFVFT"),
            ("c", "GILGFVFTL"),
            ("d", "SLYNTVATLYC"),
            ("e", "AAAAAAAAAAAA"),
        ],
    );
    let fake = Arc::new(FakePredictor::new());
    let engine = Engine::new(h.config(LANES_8_TO_11, 4))
        .unwrap()
        .with_invoker(fake.clone());

    let report = engine.run(&input).await.unwrap();
    assert_eq!(report.allocation, "{8:2, 9:1, 10:0, 11:1}");
    assert_eq!(fake.lanes_called(), vec!["8", "8", "9", "11"]);
    assert_eq!(report.summary.attempted, 4);
    assert_eq!(report.summary.skipped_records, 1);
    assert_eq!(report.row_count, 4);
    assert!(!report.partial);
    assert_eq!(merged_ids(&delivered_file(&report.delivery)), vec!["a", "b", "c", "d"]);
}

/// Test 3b: more lanes than budget oversubscribes with one worker per lane
#[tokio::test]
async fn test_lane_oversubscription() {
    let h = Harness::new();
    let input = h.fasta(
        "over.fsa",
        &[("a", "SIINFEKL"), ("b", "GILGFVFTL"), ("c", "KLGGALQAKV")],
    );
    let fake = Arc::new(FakePredictor {
        delay_ms: |_| 30,
        ..FakePredictor::new()
    });
    let engine = Engine::new(h.config("  mode: by_length\n  lane_lengths: [8, 9, 10]", 2))
        .unwrap()
        .with_invoker(fake.clone());

    let report = engine.run(&input).await.unwrap();
    assert_eq!(report.allocation, "{8:1, 9:1, 10:1}");
    assert_eq!(report.row_count, 3);
    assert!(fake.peak.load(Ordering::SeqCst) <= 3);
}

/// Test 3c: nothing matches any lane
#[tokio::test]
async fn test_no_records_survive_lanes() {
    let h = Harness::new();
    let input = h.fasta("none.fsa", &[("a", "SIINFEKL")]);
    let fake = Arc::new(FakePredictor::new());
    let engine = Engine::new(h.config("  mode: by_length\n  lane_lengths: [9]", 4))
        .unwrap()
        .with_invoker(fake.clone());

    let err = engine.run(&input).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Partition(PartitionError::NoRecordsSurvive { skipped_length: 1 })
    ));
    assert!(fake.calls.lock().unwrap().is_empty());
    assert!(h.scratch_is_empty());
}

/// Test 4: an empty corpus never starts a process
#[tokio::test]
async fn test_empty_corpus_short_circuits() {
    let h = Harness::new();
    let input = h.fasta("empty.fsa", &[]);
    let fake = Arc::new(FakePredictor::new());
    let engine = Engine::new(h.config(COUNT_3, 3))
        .unwrap()
        .with_invoker(fake.clone());

    let report = engine.run(&input).await.unwrap();
    assert_eq!(report.delivery, Delivery::Empty);
    assert_eq!(report.row_count, 0);
    assert_eq!(report.summary.attempted, 0);
    assert!(fake.calls.lock().unwrap().is_empty());
    assert!(h.out_is_empty());
    assert!(h.scratch_is_empty());
}

/// Test 4b: headerless garbage is unparsable, not empty
#[tokio::test]
async fn test_unparsable_corpus() {
    let h = Harness::new();
    let path = h.data.path().join("junk.fsa");
    std::fs::write(&path, "hello\nworld\n").unwrap();
    let engine = Engine::new(h.config(COUNT_3, 3))
        .unwrap()
        .with_invoker(Arc::new(FakePredictor::new()));

    let err = engine.run(path.to_str().unwrap()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Partition(PartitionError::Unparsable { .. })));
}

/// Test 5: every job failing is a request failure, and still cleans up
#[tokio::test]
async fn test_all_jobs_failed() {
    let h = Harness::new();
    let input = h.ten_records();
    let engine = Engine::new(h.config(COUNT_3, 3))
        .unwrap()
        .with_invoker(Arc::new(FakePredictor::failing(&[0, 1, 2])));

    let err = engine.run(&input).await.unwrap_err();
    let PipelineError::Merge(MergeError::NoSchema {
        attempted,
        failed,
        failures,
    }) = &err
    else {
        panic!("expected a schema failure, got {:?}", err);
    };
    assert_eq!((*attempted, *failed), (3, 3));
    assert_eq!(failures.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(failures.iter().all(|f| f.reason.contains("predictor crashed")));
    assert!(err.to_string().contains("job 1 (lane all, chunk 1)"));
    assert!(h.scratch_is_empty());
    assert!(h.out_is_empty());
}

/// Test 5b: cancellation stops jobs, uploads nothing and removes artifacts
#[tokio::test]
async fn test_cancellation_cleans_up() {
    let h = Harness::new();
    let input = h.ten_records();
    let fake = Arc::new(FakePredictor {
        hang: true,
        ..FakePredictor::new()
    });
    let engine = Engine::new(h.config(COUNT_3, 3))
        .unwrap()
        .with_invoker(fake.clone());

    let err = engine
        .run_until(&input, tokio::time::sleep(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(fake.calls.lock().unwrap().len(), 3);
    assert!(h.scratch_is_empty());
    assert!(h.out_is_empty());
}

/// Test 5c: a dry-run plan touches no processes
#[tokio::test]
async fn test_plan_only() {
    let h = Harness::new();
    let input = h.ten_records();
    let fake = Arc::new(FakePredictor::new());
    let engine = Engine::new(h.config(COUNT_3, 2))
        .unwrap()
        .with_invoker(fake.clone());

    let plan = engine.plan(&input).await.unwrap();
    assert_eq!(plan.partitions.len(), 2);
    assert_eq!(plan.dispatched_records(), 10);
    assert!(fake.calls.lock().unwrap().is_empty());
    assert!(h.scratch_is_empty());
}

/// Test 6: minio:// input is fetched and the result uploaded
#[tokio::test]
async fn test_remote_input_and_upload() {
    let h = Harness::new();
    let buckets = tempfile::tempdir().unwrap();
    let storage = ObjectStorage::local(buckets.path(), "minio");

    let local = h.ten_records();
    let uri = storage.store(Path::new(&local), "molly", "ab12_B0702.fsa").await.unwrap();

    let mut config = h.config(COUNT_3, 3);
    config.output.bucket = Some("results".into());
    config.output.name_suffix = "NetMHCpan_results".into();
    let engine = Engine::new(config)
        .unwrap()
        .with_invoker(Arc::new(FakePredictor::new()))
        .with_storage(storage);

    let report = engine.run(&uri).await.unwrap();
    let expected = format!("minio://results/{}_NetMHCpan_results.tsv", report.request_id);
    assert_eq!(report.delivery, Delivery::Link { url: expected });

    let uploaded = buckets
        .path()
        .join("results")
        .join(format!("{}_NetMHCpan_results.tsv", report.request_id));
    assert_eq!(merged_ids(&uploaded).len(), 10);
    assert!(h.scratch_is_empty());
    assert!(h.out_is_empty());
}

/// Test 6b: upload failure falls back to a download URL
#[tokio::test]
async fn test_upload_fallback_to_download_url() {
    let h = Harness::new();
    let input = h.ten_records();
    let blocker = h.data.path().join("not-a-directory");
    std::fs::write(&blocker, "x").unwrap();

    let mut config = h.config(COUNT_3, 3);
    config.output.bucket = Some("results".into());
    config.output.download_url_prefix = Some("http://files.local/dl/".into());
    let engine = Engine::new(config)
        .unwrap()
        .with_invoker(Arc::new(FakePredictor::new()))
        .with_storage(ObjectStorage::local(&blocker, "minio"));

    let report = engine.run(&input).await.unwrap();
    let name = format!("{}_results.tsv", report.request_id);
    assert_eq!(
        report.delivery,
        Delivery::Link {
            url: format!("http://files.local/dl/{}", name)
        }
    );
    assert!(h.out.path().join(&name).is_file());
}

/// Test 6c: upload failure without a fallback is a request failure
#[tokio::test]
async fn test_upload_failure_without_fallback() {
    let h = Harness::new();
    let input = h.ten_records();
    let blocker = h.data.path().join("not-a-directory");
    std::fs::write(&blocker, "x").unwrap();

    let mut config = h.config(COUNT_3, 3);
    config.output.bucket = Some("results".into());
    let engine = Engine::new(config)
        .unwrap()
        .with_invoker(Arc::new(FakePredictor::new()))
        .with_storage(ObjectStorage::local(&blocker, "minio"));

    let err = engine.run(&input).await.unwrap_err();
    assert!(matches!(err, PipelineError::Upload(_)));
    assert!(h.scratch_is_empty());
    assert!(h.out_is_empty());
}

#[test]
fn test_report_serializes_delivery_kind() {
    let json = serde_json::to_value(Delivery::Link {
        url: "minio://results/x.tsv".into(),
    })
    .unwrap();
    assert_eq!(json["kind"], "link");
    assert_eq!(json["url"], "minio://results/x.tsv");
    assert_eq!(serde_json::to_value(Delivery::Empty).unwrap()["kind"], "empty");
}

#[cfg(unix)]
const LENGTH_SCRIPT: &str = r#"printf 'id\tlen\n'; awk '/^>/ {id=substr($0,2); next} {print id "\t" length($0)}' "$1""#;

/// Test 7: real `sh` children
#[cfg(unix)]
#[tokio::test]
async fn test_real_processes() {
    let h = Harness::new();
    let input = h.fasta(
        "real.fsa",
        &[
            ("p1", "SIINFEKL"),
            ("p2", "GILGFVFTL"),
            ("p3", "KLGGALQAKV"),
            ("p4", "NLVPMVATV"),
            ("p5", "GLCTLVAML"),
        ],
    );
    let mut config = h.config("  mode: count\n  worker_count: 2", 2);
    config.tool.program = "sh".into();
    config.tool.args = vec!["-c".into(), LENGTH_SCRIPT.into(), "sh".into(), "{input}".into()];

    let report = Engine::new(config).unwrap().run(&input).await.unwrap();
    assert_eq!(report.row_count, 5);
    assert_eq!(report.summary.attempted, 2);

    let text = std::fs::read_to_string(delivered_file(&report.delivery)).unwrap();
    assert_eq!(text, "id\tlen\np1\t8\np2\t9\np3\t10\np4\t9\np5\t9\n");
    assert!(h.scratch_is_empty());
}

/// Test 7b: a hung tool is killed at the job deadline
#[cfg(unix)]
#[tokio::test]
async fn test_real_process_timeout() {
    let h = Harness::new();
    let input = h.ten_records();
    let mut config = h.config(COUNT_3, 3);
    config.tool.program = "sh".into();
    config.tool.args = vec!["-c".into(), "sleep 30".into(), "sh".into(), "{input}".into()];
    config.processing.job_timeout_secs = Some(1);

    let started = std::time::Instant::now();
    let err = Engine::new(config).unwrap().run(&input).await.unwrap_err();
    assert!(matches!(err, PipelineError::Merge(MergeError::NoSchema { failed: 3, .. })));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(h.scratch_is_empty());
}
