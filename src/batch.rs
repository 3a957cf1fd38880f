use crate::{
    engine::PredictionEngine,
    error::AppError,
    schema::{FEATURE_SPECS, REQUIRED_COLUMNS, TARGET_COLUMN},
    types::{
        BatchStatistics, GradeCounts, GradeDistribution, GradePercentages, PredictionResult,
        StudentRecord,
    },
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<PredictionResult>,
    pub statistics: BatchStatistics,
}

// Splits large batches into fixed-size chunks and runs each chunk's
// prediction on a bounded blocking pool, so a big upload does not stall
// concurrent single-record requests. Output order always matches input order:
// chunk results are written back into their original index range, not
// appended in completion order.
pub struct BatchScheduler {
    engine: Arc<PredictionEngine>,
    chunk_size: usize,
    max_batch_rows: usize,
    workers: Arc<Semaphore>,
}

impl BatchScheduler {
    pub fn new(
        engine: Arc<PredictionEngine>,
        chunk_size: usize,
        max_workers: usize,
        max_batch_rows: usize,
    ) -> Self {
        Self {
            engine,
            chunk_size: chunk_size.max(1),
            max_batch_rows,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    pub async fn predict_csv(&self, text: &str) -> Result<BatchOutcome, AppError> {
        let records = parse_csv(text)?;
        info!("processing CSV batch of {} students", records.len());
        self.predict_records(records).await
    }

    pub async fn predict_records(&self, records: Vec<StudentRecord>) -> Result<BatchOutcome, AppError> {
        if records.is_empty() {
            return Err(AppError::EmptyBatch);
        }
        if records.len() > self.max_batch_rows {
            return Err(AppError::BatchTooLarge {
                size: records.len(),
                limit: self.max_batch_rows,
            });
        }

        self.engine.record_batch();

        let total = records.len();
        let records = Arc::new(records);
        let mut tasks = Vec::new();
        let mut start = 0;

        while start < total {
            let end = (start + self.chunk_size).min(total);
            let engine = Arc::clone(&self.engine);
            let shared = Arc::clone(&records);
            let semaphore = Arc::clone(&self.workers);

            let handle = tokio::spawn(async move {
                // Suspend only while waiting for a worker slot; the CPU-bound
                // predict runs off the async executor
                let _permit = semaphore.acquire_owned().await.ok();
                let engine_inner = Arc::clone(&engine);
                let shared_inner = Arc::clone(&shared);
                match tokio::task::spawn_blocking(move || {
                    engine_inner.predict_chunk(&shared_inner[start..end])
                })
                .await
                {
                    Ok(results) => results,
                    Err(e) => {
                        // Chunk is never retried; one downgrade bounds latency
                        error!("chunk {}..{} worker failed: {}, degrading to heuristic", start, end, e);
                        shared[start..end]
                            .iter()
                            .map(|record| engine.heuristic_result(record))
                            .collect()
                    }
                }
            });

            tasks.push((start, end, handle));
            start = end;
        }

        let mut out: Vec<Option<PredictionResult>> = vec![None; total];
        for (start, end, handle) in tasks {
            match handle.await {
                Ok(results) => {
                    for (offset, result) in results.into_iter().enumerate() {
                        out[start + offset] = Some(result);
                    }
                }
                Err(e) => {
                    error!("chunk {}..{} task lost: {}, degrading to heuristic", start, end, e);
                    for (offset, record) in records[start..end].iter().enumerate() {
                        out[start + offset] = Some(self.engine.heuristic_result(record));
                    }
                }
            }
        }

        let results: Vec<PredictionResult> = out.into_iter().flatten().collect();
        if results.len() != total {
            return Err(AppError::Internal(format!(
                "batch produced {} results for {} rows",
                results.len(),
                total
            )));
        }

        let statistics = statistics(&results);
        Ok(BatchOutcome { results, statistics })
    }
}

// Parses an uploaded table into student records. The header row supplies
// column names (canonical or alias); the training target column is dropped
// before feature extraction since it is never a model input.
pub fn parse_csv(text: &str) -> Result<Vec<StudentRecord>, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();

    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter_map(|canonical| {
            let alias = FEATURE_SPECS
                .iter()
                .find(|spec| spec.name == *canonical)
                .map(|spec| spec.alias)
                .unwrap_or_default();
            let present = headers
                .iter()
                .any(|h| h.eq_ignore_ascii_case(canonical) || h.eq_ignore_ascii_case(alias));
            if present {
                None
            } else {
                Some((*canonical).to_string())
            }
        })
        .collect();
    if !missing.is_empty() {
        return Err(AppError::MissingColumns(missing));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut record = StudentRecord::new();
        for (header, cell) in headers.iter().zip(row.iter()) {
            if header.eq_ignore_ascii_case(TARGET_COLUMN) {
                continue;
            }
            if cell.is_empty() {
                continue;
            }
            record.insert(header.to_string(), Value::String(cell.to_string()));
        }
        records.push(record);
    }

    if records.is_empty() {
        return Err(AppError::EmptyBatch);
    }
    Ok(records)
}

// Aggregate statistics over the full batch; purely derived, no side effects.
pub fn statistics(results: &[PredictionResult]) -> BatchStatistics {
    if results.is_empty() {
        return BatchStatistics {
            mean: 0.0,
            min: 0.0,
            max: 0.0,
            std: 0.0,
            grade_distribution: GradeDistribution {
                counts: GradeCounts::default(),
                percentages: GradePercentages::default(),
            },
        };
    }

    let n = results.len() as f64;
    let mut counts = GradeCounts::default();
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for result in results {
        sum += result.score_100;
        min = min.min(result.score_100);
        max = max.max(result.score_100);
        counts.record(result.letter_grade);
    }

    let mean = sum / n;
    let variance = results
        .iter()
        .map(|r| (r.score_100 - mean).powi(2))
        .sum::<f64>()
        / n;

    let pct = |count: u64| (count as f64 / n * 1000.0).round() / 10.0;
    let percentages = GradePercentages {
        ad: pct(counts.ad),
        a: pct(counts.a),
        b: pct(counts.b),
        c: pct(counts.c),
    };

    BatchStatistics {
        mean,
        min,
        max,
        std: variance.sqrt(),
        grade_distribution: GradeDistribution { counts, percentages },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::ModelKind;
    use serde_json::json;

    fn unloaded_engine() -> Arc<PredictionEngine> {
        Arc::new(PredictionEngine::new(&Config::from_env()))
    }

    fn record(score: f64) -> StudentRecord {
        let mut rec = StudentRecord::new();
        rec.insert("previous_scores".to_string(), json!(score));
        rec.insert("attendance".to_string(), json!(80.0));
        rec.insert("study_hours".to_string(), json!(10.0));
        rec
    }

    #[tokio::test]
    async fn test_batch_preserves_order_across_chunks() {
        let engine = unloaded_engine();
        let scheduler = BatchScheduler::new(Arc::clone(&engine), 2, 2, 5000);

        let records: Vec<StudentRecord> = (0..7).map(|i| record(30.0 + 10.0 * i as f64)).collect();
        let outcome = scheduler.predict_records(records.clone()).await.unwrap();

        assert_eq!(outcome.results.len(), 7);
        for (i, result) in outcome.results.iter().enumerate() {
            let expected = engine.heuristic_result(&records[i]);
            assert_eq!(result.score_100, expected.score_100, "row {} out of order", i);
        }
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let scheduler = BatchScheduler::new(unloaded_engine(), 500, 4, 5000);
        let err = scheduler.predict_records(Vec::new()).await.unwrap_err();
        assert!(matches!(err, AppError::EmptyBatch));
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected() {
        let scheduler = BatchScheduler::new(unloaded_engine(), 2, 2, 3);
        let records: Vec<StudentRecord> = (0..4).map(|i| record(50.0 + i as f64)).collect();
        let err = scheduler.predict_records(records).await.unwrap_err();
        assert!(matches!(err, AppError::BatchTooLarge { size: 4, limit: 3 }));
    }

    #[tokio::test]
    async fn test_large_batch_all_rows_scored() {
        let scheduler = BatchScheduler::new(unloaded_engine(), 100, 4, 5000);
        let records: Vec<StudentRecord> = (0..1250).map(|i| record((i % 100) as f64)).collect();
        let outcome = scheduler.predict_records(records).await.unwrap();
        assert_eq!(outcome.results.len(), 1250);
        for result in &outcome.results {
            assert!(result.score_100 >= 0.0 && result.score_100 <= 100.0);
        }
    }

    #[test]
    fn test_parse_csv_drops_target_column() {
        let csv_text = "Hours_Studied,Attendance,Previous_Scores,Exam_Score\n20,90,85,88\n5,60,40,45\n";
        let records = parse_csv(csv_text).unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert!(!record.contains_key("Exam_Score"));
        }
        assert_eq!(records[0].get("Hours_Studied"), Some(&json!("20")));
    }

    #[test]
    fn test_parse_csv_accepts_alias_headers() {
        let csv_text = "study_hours,attendance,previous_scores\n12,85,70\n";
        let records = parse_csv(csv_text).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("study_hours"), Some(&json!("12")));
    }

    #[test]
    fn test_parse_csv_missing_columns_enumerated() {
        let csv_text = "Hours_Studied,Motivation_Level\n10,High\n";
        let err = parse_csv(csv_text).unwrap_err();
        match err {
            AppError::MissingColumns(columns) => {
                assert_eq!(columns, vec!["Attendance".to_string(), "Previous_Scores".to_string()]);
            }
            other => panic!("expected MissingColumns, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_csv_header_only_is_empty_batch() {
        let csv_text = "Hours_Studied,Attendance,Previous_Scores\n";
        let err = parse_csv(csv_text).unwrap_err();
        assert!(matches!(err, AppError::EmptyBatch));
    }

    #[tokio::test]
    async fn test_csv_round_trip_through_scheduler() {
        let scheduler = BatchScheduler::new(unloaded_engine(), 500, 4, 5000);
        let csv_text = "Hours_Studied,Attendance,Previous_Scores,Exam_Score\n45,99,97,99\n1,50,40,35\n";
        let outcome = scheduler.predict_csv(csv_text).await.unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results[0].score_100 > outcome.results[1].score_100);
    }

    #[test]
    fn test_statistics() {
        let results: Vec<PredictionResult> = [95.0, 75.0, 55.0, 35.0]
            .iter()
            .map(|&score| {
                let graded = crate::grading::grade(score);
                PredictionResult {
                    score_100: graded.score_100,
                    score_20: graded.score_20,
                    letter_grade: graded.grade,
                    model_used: ModelKind::Heuristic,
                }
            })
            .collect();

        let stats = statistics(&results);
        assert!((stats.mean - 65.0).abs() < 1e-12);
        assert_eq!(stats.min, 35.0);
        assert_eq!(stats.max, 95.0);
        // Population standard deviation of {95, 75, 55, 35}
        assert!((stats.std - 500.0_f64.sqrt()).abs() < 1e-9);

        let counts = stats.grade_distribution.counts;
        assert_eq!(counts.ad, 1);
        assert_eq!(counts.a, 1);
        assert_eq!(counts.b, 1);
        assert_eq!(counts.c, 1);
        assert_eq!(counts.total(), 4);
        assert!((stats.grade_distribution.percentages.ad - 25.0).abs() < 1e-9);
    }
}
