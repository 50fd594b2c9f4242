//! End-to-end pipeline runs against a real on-disk task store, with all
//! external tools and services mocked.

use async_trait::async_trait;
use bindsight_core::{
    ConservationMode, PredictorProfile, Region, StructureSource, StructureSummary,
    TaskConfiguration, TaskStatus,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::fs;

use pipeline::hom::write_hom_file;
use pipeline::{
    ConservationCaches, ConservationTool, PipelineError, PipelineExecutor, Predictor, Result,
    RunOutcome, StructureFetcher, StructureTool, TaskRunner,
};
use store::TaskStore;

struct MockFetcher;

#[async_trait]
impl StructureFetcher for MockFetcher {
    async fn fetch_accession(&self, code: &str, destination: &Path) -> Result<()> {
        fs::write(destination, format!("structure of {code}\n")).await?;
        Ok(())
    }

    async fn fetch_predicted_model(&self, id: &str, destination: &Path) -> Result<Value> {
        fs::write(destination, format!("model of {id}\n")).await?;
        Ok(json!([{"uniprotAccession": id}]))
    }
}

/// Structure tool producing a fixed chain-to-sequence layout.
struct MockStructureTool {
    sequences: BTreeMap<String, String>,
}

impl MockStructureTool {
    fn new(sequences: &[(&str, &str)]) -> Self {
        Self {
            sequences: sequences
                .iter()
                .map(|(chain, sequence)| (chain.to_string(), sequence.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl StructureTool for MockStructureTool {
    async fn reduce_to_chains(
        &self,
        input: &Path,
        output: &Path,
        _chains: &[String],
        _log: &Path,
    ) -> Result<()> {
        fs::copy(input, output).await?;
        Ok(())
    }

    async fn extract_sequences(
        &self,
        _structure: &Path,
        output_directory: &Path,
        _log: &Path,
    ) -> Result<BTreeMap<String, PathBuf>> {
        let mut result = BTreeMap::new();
        for (chain, sequence) in &self.sequences {
            let path = output_directory.join(format!("structure_{chain}.fasta"));
            fs::write(&path, format!(">{chain}\n{sequence}\n")).await?;
            result.insert(chain.clone(), path);
        }
        Ok(result)
    }

    async fn structure_info(&self, _input: &Path, output: &Path, _log: &Path) -> Result<()> {
        let mut indices = Vec::new();
        let mut residues = Vec::new();
        let mut regions = Vec::new();
        for (chain, sequence) in &self.sequences {
            let start = residues.len();
            for (i, code) in sequence.chars().enumerate() {
                indices.push((i + 1).to_string());
                residues.push(code.to_string());
            }
            regions.push(Region {
                name: chain.clone(),
                start,
                end: residues.len() - 1,
            });
        }
        let summary = StructureSummary {
            indices,
            sequence: residues,
            binding: Vec::new(),
            regions,
            scores: BTreeMap::new(),
        };
        fs::write(output, serde_json::to_vec(&summary)?).await?;
        Ok(())
    }
}

/// Conservation tool that scores every residue 0.5 and counts how many
/// times it actually ran.
struct CountingConservationTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ConservationTool for CountingConservationTool {
    async fn compute(
        &self,
        fasta_file: &Path,
        _working_directory: &Path,
        output_file: &Path,
        _log: &Path,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let sequence = pipeline::hom::read_fasta_sequence(fasta_file).await?;
        let scores = vec![0.5; sequence.chars().count()];
        write_hom_file(output_file, &sequence, &scores).await
    }
}

struct MockPredictor;

#[async_trait]
impl Predictor for MockPredictor {
    async fn predict(
        &self,
        _profile: PredictorProfile,
        input_structure: &Path,
        output_directory: &Path,
        _log: &Path,
    ) -> Result<()> {
        fs::create_dir_all(output_directory).await?;
        let name = input_structure
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        fs::write(
            output_directory.join(format!("{name}_predictions.csv")),
            "name, rank, score, probability, center_x, center_y, center_z, residue_ids, surf_atom_ids\n\
             pocket1, 1, 4.2, 0.71, 1.0, 2.0, 3.0, A_1 A_2, 10 11\n",
        )
        .await?;
        fs::write(output_directory.join("params.txt"), "version: 2.4\n").await?;
        Ok(())
    }
}

struct FailingPredictor;

#[async_trait]
impl Predictor for FailingPredictor {
    async fn predict(
        &self,
        _profile: PredictorProfile,
        _input_structure: &Path,
        _output_directory: &Path,
        _log: &Path,
    ) -> Result<()> {
        Err(PipelineError::ExternalTool {
            command: "predictor".to_string(),
            status: 1,
        })
    }
}

struct TestHarness {
    _directory: TempDir,
    store: TaskStore,
    lock_root: PathBuf,
    cache_root: PathBuf,
}

impl TestHarness {
    fn sharded() -> Self {
        let directory = TempDir::new().expect("Failed to create temp dir");
        let store = TaskStore::new(directory.path().join("tasks"));
        let lock_root = directory.path().join("locks");
        let cache_root = directory.path().join("conservation-cache");
        std::fs::create_dir_all(&lock_root).expect("Failed to create lock root");
        Self {
            _directory: directory,
            store,
            lock_root,
            cache_root,
        }
    }

    fn unsharded() -> Self {
        let mut harness = Self::sharded();
        harness.store = TaskStore::unsharded(harness._directory.path().join("tasks"));
        harness
    }

    fn runner(
        &self,
        structure_tool: MockStructureTool,
        conservation_tool: Arc<dyn ConservationTool>,
        predictor: Arc<dyn Predictor>,
        caches: ConservationCaches,
    ) -> TaskRunner {
        let executor = PipelineExecutor::new(
            Arc::new(MockFetcher),
            Arc::new(structure_tool),
            conservation_tool,
            predictor,
            caches,
        );
        TaskRunner::new(self.store.clone(), &self.lock_root, Arc::new(executor))
    }
}

async fn read_prediction(store: &TaskStore, id: &str) -> Value {
    let path = store
        .public_directory(id)
        .expect("Invalid identifier")
        .join("prediction.json");
    let content = fs::read_to_string(&path).await.expect("Missing prediction.json");
    serde_json::from_str(&content).expect("Malformed prediction.json")
}

#[tokio::test]
async fn test_accession_task_without_conservation() {
    let harness = TestHarness::sharded();
    let configuration = TaskConfiguration::new(StructureSource::AccessionCode {
        code: "2SRC".to_string(),
    })
    .with_chains(vec!["A".to_string()]);
    harness
        .store
        .create("2SRC_A", &configuration, Map::new())
        .await
        .expect("Failed to create task");

    let runner = harness.runner(
        MockStructureTool::new(&[("A", "MKT")]),
        Arc::new(CountingConservationTool {
            calls: Arc::new(AtomicUsize::new(0)),
        }),
        Arc::new(MockPredictor),
        ConservationCaches::disabled(),
    );
    let outcome = runner.run("2SRC_A").await.expect("Run failed");
    assert_eq!(outcome, RunOutcome::Completed);

    let info = harness.store.read_status("2SRC_A").await.unwrap();
    assert_eq!(info.status, TaskStatus::Successful);
    assert_eq!(
        info.metadata.get("predictionName").and_then(Value::as_str),
        Some("2SRC_A")
    );
    assert_eq!(
        info.metadata.get("structureName").and_then(Value::as_str),
        Some("structure.cif.gz")
    );

    let prediction = read_prediction(&harness.store, "2SRC_A").await;
    assert_eq!(prediction["pockets"].as_array().unwrap().len(), 1);
    assert_eq!(prediction["pockets"][0]["name"], "pocket1");
    assert_eq!(prediction["structure"]["regions"][0]["name"], "A");
    assert!(prediction["structure"]["scores"]
        .as_object()
        .unwrap()
        .get("conservation")
        .is_none());
    assert_eq!(prediction["metadata"]["predictor_version"], "2.4");

    let public = harness.store.public_directory("2SRC_A").unwrap();
    assert!(public.join("bundle.zip").exists());
    assert!(public.join("structure.cif.gz").exists());
    // Working subtree is removed after success.
    assert!(!harness.store.working_directory("2SRC_A").unwrap().exists());
}

#[tokio::test]
async fn test_conservation_cache_shared_across_tasks() {
    let harness = TestHarness::sharded();
    let calls = Arc::new(AtomicUsize::new(0));

    for id in ["2SRC", "1ABC"] {
        let configuration = TaskConfiguration::new(StructureSource::AccessionCode {
            code: id.to_string(),
        })
        .with_conservation(ConservationMode::Hmm);
        harness
            .store
            .create(id, &configuration, Map::new())
            .await
            .expect("Failed to create task");

        let runner = harness.runner(
            MockStructureTool::new(&[("A", "MKT")]),
            Arc::new(CountingConservationTool {
                calls: Arc::clone(&calls),
            }),
            Arc::new(MockPredictor),
            ConservationCaches::rooted(&harness.cache_root),
        );
        assert_eq!(runner.run(id).await.unwrap(), RunOutcome::Completed);
    }

    // Both tasks share the sequence MKT; the second run hits the cache.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let prediction = read_prediction(&harness.store, "1ABC").await;
    let conservation = prediction["structure"]["scores"]["conservation"]
        .as_array()
        .unwrap();
    assert_eq!(conservation.len(), 3);
    assert!(conservation.iter().all(|score| score == 0.5));
}

#[tokio::test]
async fn test_chains_sharing_a_sequence_compute_once() {
    let harness = TestHarness::sharded();
    let calls = Arc::new(AtomicUsize::new(0));

    let configuration = TaskConfiguration::new(StructureSource::AccessionCode {
        code: "2SRC".to_string(),
    })
    .with_conservation(ConservationMode::Alignment);
    harness
        .store
        .create("2SRC", &configuration, Map::new())
        .await
        .unwrap();

    let runner = harness.runner(
        MockStructureTool::new(&[("A", "MKT"), ("B", "MKT")]),
        Arc::new(CountingConservationTool {
            calls: Arc::clone(&calls),
        }),
        Arc::new(MockPredictor),
        ConservationCaches::disabled(),
    );
    assert_eq!(runner.run("2SRC").await.unwrap(), RunOutcome::Completed);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let prediction = read_prediction(&harness.store, "2SRC").await;
    let conservation = prediction["structure"]["scores"]["conservation"]
        .as_array()
        .unwrap();
    // Two chains of three residues each.
    assert_eq!(conservation.len(), 6);
}

#[tokio::test]
async fn test_uploaded_structure_in_flat_store() {
    let harness = TestHarness::unsharded();
    let configuration = TaskConfiguration::new(StructureSource::UploadedFile {
        file: "my-protein.pdb".to_string(),
    });
    harness
        .store
        .create("2026-01-05-12-00-00-abc", &configuration, Map::new())
        .await
        .unwrap();
    let input = harness.store.input_directory("2026-01-05-12-00-00-abc").unwrap();
    fs::write(input.join("my-protein.pdb"), "uploaded structure\n")
        .await
        .unwrap();

    let runner = harness.runner(
        MockStructureTool::new(&[("A", "GGG")]),
        Arc::new(CountingConservationTool {
            calls: Arc::new(AtomicUsize::new(0)),
        }),
        Arc::new(MockPredictor),
        ConservationCaches::disabled(),
    );
    assert_eq!(
        runner.run("2026-01-05-12-00-00-abc").await.unwrap(),
        RunOutcome::Completed
    );

    let info = harness
        .store
        .read_status("2026-01-05-12-00-00-abc")
        .await
        .unwrap();
    assert_eq!(info.status, TaskStatus::Successful);
    assert_eq!(
        info.metadata.get("predictionName").and_then(Value::as_str),
        Some("my-protein")
    );
    assert_eq!(
        info.metadata.get("structureName").and_then(Value::as_str),
        Some("structure.pdb.gz")
    );
}

#[tokio::test]
async fn test_predicted_model_records_entry_metadata() {
    let harness = TestHarness::sharded();
    let configuration = TaskConfiguration::new(StructureSource::PredictedModel {
        id: "P12345".to_string(),
    })
    .with_profile(PredictorProfile::Alphafold);
    harness
        .store
        .create("P12345", &configuration, Map::new())
        .await
        .unwrap();

    let runner = harness.runner(
        MockStructureTool::new(&[("A", "MKT")]),
        Arc::new(CountingConservationTool {
            calls: Arc::new(AtomicUsize::new(0)),
        }),
        Arc::new(MockPredictor),
        ConservationCaches::disabled(),
    );
    assert_eq!(runner.run("P12345").await.unwrap(), RunOutcome::Completed);

    let info = harness.store.read_status("P12345").await.unwrap();
    assert_eq!(info.status, TaskStatus::Successful);
    assert_eq!(
        info.metadata.get("predictionName").and_then(Value::as_str),
        Some("P12345")
    );
    assert_eq!(
        info.metadata.get("structureName").and_then(Value::as_str),
        Some("structure.cif.gz")
    );

    // The model entry returned by the fetcher travels into the
    // prediction document.
    let prediction = read_prediction(&harness.store, "P12345").await;
    assert_eq!(
        prediction["metadata"]["predictedModelEntry"][0]["uniprotAccession"],
        "P12345"
    );
    assert_eq!(prediction["metadata"]["predictor_version"], "2.4");
}

#[tokio::test]
async fn test_predictor_failure_marks_task_failed() {
    let harness = TestHarness::sharded();
    let configuration = TaskConfiguration::new(StructureSource::AccessionCode {
        code: "2SRC".to_string(),
    });
    harness
        .store
        .create("2SRC", &configuration, Map::new())
        .await
        .unwrap();

    let runner = harness.runner(
        MockStructureTool::new(&[("A", "MKT")]),
        Arc::new(CountingConservationTool {
            calls: Arc::new(AtomicUsize::new(0)),
        }),
        Arc::new(FailingPredictor),
        ConservationCaches::disabled(),
    );
    assert_eq!(runner.run("2SRC").await.unwrap(), RunOutcome::Failed);

    let info = harness.store.read_status("2SRC").await.unwrap();
    assert_eq!(info.status, TaskStatus::Failed);
    let log = fs::read_to_string(harness.store.log_path("2SRC").unwrap())
        .await
        .unwrap();
    assert!(log.contains("prediction failed"));
    // Working files stay around for diagnosis.
    assert!(harness.store.working_directory("2SRC").unwrap().exists());
}

#[tokio::test]
async fn test_finished_task_is_not_rerun() {
    let harness = TestHarness::sharded();
    let configuration = TaskConfiguration::new(StructureSource::AccessionCode {
        code: "2SRC".to_string(),
    });
    harness
        .store
        .create("2SRC", &configuration, Map::new())
        .await
        .unwrap();

    let runner = harness.runner(
        MockStructureTool::new(&[("A", "MKT")]),
        Arc::new(CountingConservationTool {
            calls: Arc::new(AtomicUsize::new(0)),
        }),
        Arc::new(MockPredictor),
        ConservationCaches::disabled(),
    );
    assert_eq!(runner.run("2SRC").await.unwrap(), RunOutcome::Completed);
    assert_eq!(runner.run("2SRC").await.unwrap(), RunOutcome::AlreadyDone);
}

#[tokio::test]
async fn test_run_pending_processes_queued_tasks_only() {
    let harness = TestHarness::sharded();
    for id in ["2SRC", "1ABC"] {
        let configuration = TaskConfiguration::new(StructureSource::AccessionCode {
            code: id.to_string(),
        });
        harness
            .store
            .create(id, &configuration, Map::new())
            .await
            .unwrap();
    }

    let runner = harness.runner(
        MockStructureTool::new(&[("A", "MKT")]),
        Arc::new(CountingConservationTool {
            calls: Arc::new(AtomicUsize::new(0)),
        }),
        Arc::new(MockPredictor),
        ConservationCaches::disabled(),
    );
    assert_eq!(runner.run_pending().await.unwrap(), 2);
    // Nothing left to do on the second sweep.
    assert_eq!(runner.run_pending().await.unwrap(), 0);
}
