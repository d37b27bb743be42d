mod fixtures;
mod helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bulk_mail_jobs::models::job::{JobStatus, JobType};
use bulk_mail_jobs::models::verification::{VerificationOutcome, VerificationStatus};
use bulk_mail_jobs::services::batch::{BatchProcessor, JobContext, RunOutcome};
use bulk_mail_jobs::services::handlers::generate::GenerateHandler;
use bulk_mail_jobs::services::handlers::scrape::ScrapeHandler;
use bulk_mail_jobs::services::handlers::verify::VerifyHandler;
use bulk_mail_jobs::services::store::{JobStore, MemoryJobStore};
use bulk_mail_jobs::services::verifier::{MemoryVerificationCache, VerificationCache};
use tokio_util::sync::CancellationToken;

use fixtures::{sample_emails, NORMALIZED_DOMAINS, SCRAPE_DOMAINS};
use helpers::{
    create_job, generate_params, scrape_params, verify_params, BrokenCache, CheckpointHook,
    FakeScraper, RecordingStore, RecordingVerifier, ScriptedGenerator, SequentialGenerator,
    UnreachableStore,
};

fn emails_of(result: &serde_json::Value) -> Vec<String> {
    result["data"]["emails"]
        .as_array()
        .expect("emails array")
        .iter()
        .map(|e| e.as_str().unwrap().to_string())
        .collect()
}

fn cached_valid(emails: &[String]) -> Vec<VerificationOutcome> {
    emails
        .iter()
        .map(|email| VerificationOutcome {
            email: email.clone(),
            status: VerificationStatus::Valid,
            reason: None,
        })
        .collect()
}

#[tokio::test]
async fn test_generate_in_three_batches() {
    let store = Arc::new(RecordingStore::new());
    let generator = Arc::new(SequentialGenerator::new());
    let processor = BatchProcessor::new(GenerateHandler::new(generator.clone()), store.clone());
    let job_id = create_job(store.as_ref(), generate_params(2500)).await;

    let outcome = processor
        .process(&JobContext::detached(job_id, JobType::Generate))
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed { processed: 2500 });
    assert_eq!(generator.call_sizes(), vec![1000, 1000, 500]);
    assert_eq!(store.progress(), vec![40, 80, 99]);

    let job = store.snapshot(job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.completed_at.is_some());
    let result = job.result_data.unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(emails_of(&result).len(), 2500);
    assert_eq!(result["stats"]["unique"], 2500);
}

#[tokio::test]
async fn test_checkpoints_only_grow() {
    let store = Arc::new(RecordingStore::new());
    let processor = BatchProcessor::new(
        GenerateHandler::new(Arc::new(SequentialGenerator::new())),
        store.clone(),
    );
    let job_id = create_job(store.as_ref(), generate_params(3500)).await;
    processor
        .process(&JobContext::detached(job_id, JobType::Generate))
        .await
        .unwrap();

    let checkpoints = store.checkpoints();
    assert_eq!(checkpoints.len(), 4);
    for pair in checkpoints.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        assert!(next["cursor"].as_u64() > prev["cursor"].as_u64());
        let prev_items = prev["accumulator"].as_array().unwrap();
        let next_items = next["accumulator"].as_array().unwrap();
        assert!(next_items.len() >= prev_items.len());
        assert_eq!(&next_items[..prev_items.len()], &prev_items[..]);
    }
}

#[tokio::test]
async fn test_resume_after_interruption_keeps_earlier_work() {
    let shutdown = CancellationToken::new();
    let store = Arc::new(RecordingStore::with_hook(
        1,
        CheckpointHook::Trip(shutdown.clone()),
    ));
    let generator = Arc::new(SequentialGenerator::new());
    let processor = BatchProcessor::new(GenerateHandler::new(generator.clone()), store.clone());
    let job_id = create_job(store.as_ref(), generate_params(2500)).await;

    let first = processor
        .process(&JobContext::new(job_id, JobType::Generate, &shutdown))
        .await
        .unwrap();
    assert_eq!(first, RunOutcome::Interrupted { cursor: 1000 });
    assert_eq!(store.snapshot(job_id).await.status, JobStatus::Running);

    let second = processor
        .process(&JobContext::detached(job_id, JobType::Generate))
        .await
        .unwrap();
    assert_eq!(second, RunOutcome::Completed { processed: 2500 });
    assert_eq!(generator.call_sizes(), vec![1000, 1000, 500]);

    let emails = emails_of(&store.snapshot(job_id).await.result_data.unwrap());
    assert_eq!(emails.len(), 2500);
    assert_eq!(emails[0], "user0@example.com");
    assert_eq!(emails[999], "user999@example.com");
    assert_eq!(emails[2499], "user2499@example.com");
}

#[tokio::test]
async fn test_cancellation_between_batches() {
    let store = Arc::new(RecordingStore::with_hook(1, CheckpointHook::CancelJob));
    let generator = Arc::new(SequentialGenerator::new());
    let processor = BatchProcessor::new(GenerateHandler::new(generator.clone()), store.clone());
    let job_id = create_job(store.as_ref(), generate_params(5000)).await;

    let outcome = processor
        .process(&JobContext::detached(job_id, JobType::Generate))
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled { cursor: 1000 });
    assert_eq!(generator.call_sizes(), vec![1000]);
    assert_eq!(store.progress(), vec![20]);

    let job = store.snapshot(job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result_data.is_none());
    let checkpoint = job.metadata.unwrap().checkpoint.unwrap();
    assert_eq!(checkpoint["cursor"], 1000);
    assert_eq!(checkpoint["accumulator"].as_array().unwrap().len(), 1000);
}

#[tokio::test]
async fn test_cancellation_during_last_batch_wins_over_completion() {
    let store = Arc::new(RecordingStore::with_hook(1, CheckpointHook::CancelJob));
    let processor = BatchProcessor::new(
        GenerateHandler::new(Arc::new(SequentialGenerator::new())),
        store.clone(),
    );
    let job_id = create_job(store.as_ref(), generate_params(800)).await;

    let outcome = processor
        .process(&JobContext::detached(job_id, JobType::Generate))
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled { cursor: 800 });
    let job = store.snapshot(job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result_data.is_none());
}

#[tokio::test]
async fn test_generate_result_is_valid_and_unique() {
    let store = Arc::new(MemoryJobStore::new());
    let generator = Arc::new(ScriptedGenerator {
        output: vec![
            "Ann.Lee@mail.example".to_string(),
            "ann.lee@MAIL.example".to_string(),
            "broken address".to_string(),
            "bo.kim@mail.example".to_string(),
            "cy.diaz@other.example".to_string(),
        ],
    });
    let processor = BatchProcessor::new(GenerateHandler::new(generator), store.clone());
    let job_id = create_job(store.as_ref(), generate_params(5)).await;

    processor
        .process(&JobContext::detached(job_id, JobType::Generate))
        .await
        .unwrap();

    let result = store.snapshot(job_id).await.unwrap().result_data.unwrap();
    assert_eq!(
        emails_of(&result),
        vec!["Ann.Lee@mail.example", "bo.kim@mail.example", "cy.diaz@other.example"]
    );
    assert_eq!(result["stats"]["duplicates_removed"], 1);
    assert_eq!(result["stats"]["invalid_removed"], 1);
    assert_eq!(result["stats"]["domains"]["mail.example"], 2);
}

#[tokio::test]
async fn test_verify_skips_cached_addresses() {
    let store = Arc::new(RecordingStore::new());
    let verifier = Arc::new(RecordingVerifier::bulk());
    let cache = Arc::new(MemoryVerificationCache::new());
    let emails = sample_emails(120);
    cache.put_many(&cached_valid(&emails[..10])).await.unwrap();

    let handler = VerifyHandler::new(verifier.clone(), cache.clone()).with_delay(Duration::ZERO);
    let processor = BatchProcessor::new(handler, store.clone());
    let job_id = create_job(store.as_ref(), verify_params(emails.clone())).await;

    let outcome = processor
        .process(&JobContext::detached(job_id, JobType::Verify))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed { processed: 120 });

    let sent = verifier.sent();
    assert_eq!(sent.len(), 110);
    assert!(emails[..10].iter().all(|e| !sent.contains(e)));
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.progress(), vec![41, 83, 99]);
    assert_eq!(cache.len().await, 120);

    let result = store.snapshot(job_id).await.result_data.unwrap();
    assert_eq!(result["stats"]["total"], 120);
    assert_eq!(result["stats"]["cached"], 10);
    assert_eq!(result["stats"]["verified"], 110);
    assert_eq!(result["stats"]["valid"], 120);
    assert_eq!(result["data"]["results"].as_array().unwrap().len(), 120);
}

#[tokio::test]
async fn test_risky_verdicts_are_reverified() {
    let store = Arc::new(MemoryJobStore::new());
    let verifier = Arc::new(RecordingVerifier::bulk());
    let cache = Arc::new(MemoryVerificationCache::new());
    cache
        .put_many(&[
            VerificationOutcome {
                email: "risky.one@x.example".to_string(),
                status: VerificationStatus::Risky,
                reason: None,
            },
            VerificationOutcome {
                email: "ok.one@x.example".to_string(),
                status: VerificationStatus::Valid,
                reason: None,
            },
            VerificationOutcome {
                email: "bad.one@x.example".to_string(),
                status: VerificationStatus::Invalid,
                reason: None,
            },
        ])
        .await
        .unwrap();

    let handler = VerifyHandler::new(verifier.clone(), cache).with_delay(Duration::ZERO);
    let processor = BatchProcessor::new(handler, store.clone());
    let emails = vec![
        "Risky.One@x.example".to_string(),
        "ok.one@x.example".to_string(),
        "bad.one@x.example".to_string(),
    ];

    for _ in 0..2 {
        let job_id = create_job(store.as_ref(), verify_params(emails.clone())).await;
        processor
            .process(&JobContext::detached(job_id, JobType::Verify))
            .await
            .unwrap();
        let result = store.snapshot(job_id).await.unwrap().result_data.unwrap();
        assert_eq!(result["stats"]["cached"], 2);
        assert_eq!(result["stats"]["risky"], 1);
        assert_eq!(result["stats"]["invalid"], 1);
    }

    assert_eq!(
        verifier.sent(),
        vec!["risky.one@x.example".to_string(), "risky.one@x.example".to_string()]
    );
}

#[tokio::test]
async fn test_verify_survives_cache_outage() {
    let store = Arc::new(MemoryJobStore::new());
    let verifier = Arc::new(RecordingVerifier::bulk());
    let handler = VerifyHandler::new(verifier.clone(), Arc::new(BrokenCache)).with_delay(Duration::ZERO);
    let processor = BatchProcessor::new(handler, store.clone());
    let job_id = create_job(store.as_ref(), verify_params(sample_emails(3))).await;

    let outcome = processor
        .process(&JobContext::detached(job_id, JobType::Verify))
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed { processed: 3 });
    assert_eq!(verifier.sent().len(), 3);
}

#[tokio::test]
async fn test_provider_failure_marks_uncached_unknown() {
    let store = Arc::new(MemoryJobStore::new());
    let verifier = Arc::new(RecordingVerifier::bulk());
    verifier.set_failing(true);
    let cache = Arc::new(MemoryVerificationCache::new());
    let emails = sample_emails(10);
    cache.put_many(&cached_valid(&emails[..5])).await.unwrap();

    let handler = VerifyHandler::new(verifier, cache).with_delay(Duration::ZERO);
    let processor = BatchProcessor::new(handler, store.clone());
    let job_id = create_job(store.as_ref(), verify_params(emails)).await;

    let outcome = processor
        .process(&JobContext::detached(job_id, JobType::Verify))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed { processed: 10 });

    let job = store.snapshot(job_id).await.unwrap();
    let counters = job.metadata.unwrap().counters;
    assert_eq!(counters.failed_batches, 1);
    assert_eq!(counters.success_count, 5);
    assert_eq!(counters.failure_count, 5);

    let result = job.result_data.unwrap();
    assert_eq!(result["stats"]["valid"], 5);
    assert_eq!(result["stats"]["unknown"], 5);
}

#[tokio::test]
async fn test_single_item_provider_fallback() {
    let store = Arc::new(MemoryJobStore::new());
    let verifier = Arc::new(RecordingVerifier::single());
    let handler = VerifyHandler::new(verifier.clone(), Arc::new(MemoryVerificationCache::new()))
        .with_delay(Duration::ZERO);
    let processor = BatchProcessor::new(handler, store.clone());
    let mut emails = sample_emails(12);
    emails.push("not-an-address".to_string());
    let job_id = create_job(store.as_ref(), verify_params(emails)).await;

    processor
        .process(&JobContext::detached(job_id, JobType::Verify))
        .await
        .unwrap();

    assert_eq!(verifier.calls.load(Ordering::SeqCst), 12);
    let result = store.snapshot(job_id).await.unwrap().result_data.unwrap();
    assert_eq!(result["stats"]["valid"], 12);
    assert_eq!(result["stats"]["invalid"], 1);
}

#[tokio::test]
async fn test_scrape_isolates_failing_domains() {
    let store = Arc::new(MemoryJobStore::new());
    let scraper = Arc::new(FakeScraper::failing_for(&["globex.example"]));
    let handler = ScrapeHandler::new(scraper.clone()).with_delay(Duration::ZERO);
    let processor = BatchProcessor::new(handler, store.clone());
    let job_id = create_job(store.as_ref(), scrape_params(SCRAPE_DOMAINS)).await;

    let outcome = processor
        .process(&JobContext::detached(job_id, JobType::Scrape))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed { processed: 3 });
    assert_eq!(scraper.visited(), NORMALIZED_DOMAINS);

    let job = store.snapshot(job_id).await.unwrap();
    assert_eq!(job.metadata.unwrap().counters.failed_batches, 1);

    let result = job.result_data.unwrap();
    assert_eq!(result["stats"]["domains_succeeded"], 2);
    assert_eq!(result["stats"]["domains_failed"], 1);
    assert_eq!(result["stats"]["unique_emails"], 4);
    assert_eq!(result["stats"]["average_yield"], 2.0);

    let domains = result["data"]["domains"].as_array().unwrap();
    assert_eq!(domains.len(), 3);
    assert_eq!(domains[1]["domain"], "globex.example");
    assert!(domains[1]["error"].as_str().unwrap().contains("timed out"));
    assert!(emails_of(&result).contains(&"info@acme.example".to_string()));
}

#[tokio::test]
async fn test_mismatched_params_fail_the_job() {
    let store = Arc::new(MemoryJobStore::new());
    let processor = BatchProcessor::new(
        GenerateHandler::new(Arc::new(SequentialGenerator::new())),
        store.clone(),
    );
    let job_id = create_job(store.as_ref(), verify_params(sample_emails(2))).await;

    let outcome = processor
        .process(&JobContext::detached(job_id, JobType::Generate))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));

    let job = store.snapshot(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("handler expects generate"));
    assert_eq!(job.result_data.unwrap()["success"], false);
}

#[tokio::test]
async fn test_unreachable_store_is_retryable() {
    let inner = Arc::new(MemoryJobStore::new());
    let job_id = create_job(inner.as_ref(), generate_params(10)).await;
    let store: Arc<dyn JobStore> = Arc::new(UnreachableStore { inner });
    let processor = BatchProcessor::new(
        GenerateHandler::new(Arc::new(SequentialGenerator::new())),
        store,
    );

    let err = processor
        .process(&JobContext::detached(job_id, JobType::Generate))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}
