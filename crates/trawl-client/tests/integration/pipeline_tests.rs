use std::sync::Arc;

use chrono::Utc;
use trawl_client::{CssExtractor, FileExporter};
use trawl_core::handler::ExtractExportHandler;
use trawl_core::job::{JobState, NewJob, RunStatus, Schedule};
use trawl_core::scheduler::{JobScheduler, SchedulerConfig};
use trawl_core::schema::SchemaResolver;
use wiremock::matchers::path;
use wiremock::{Mock, ResponseTemplate};

use crate::common::{dispatcher, server_with_robots};

const PAGE: &str = r#"<html><body>
  <div class="quote"><span class="text">Stay hungry</span><small class="author">Jobs</small></div>
  <div class="quote"><span class="text">Be curious</span><small class="author">Einstein</small></div>
</body></html>"#;

const SCHEMA: &str = r#"{
  "name": "quotes",
  "fields": {
    "texts": { "selector": ".quote .text", "multiple": true },
    "first_author": { "selector": ".author", "processors": ["uppercase"] }
  }
}"#;

#[tokio::test]
async fn one_off_job_extracts_and_exports_csv() {
    let server = server_with_robots().await;
    Mock::given(path("/quotes"))
        .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("quotes.json"), SCHEMA).unwrap();
    let out = dir.path().join("out/quotes.csv");

    let handler = ExtractExportHandler::new(
        CssExtractor::new(),
        FileExporter::new(),
        SchemaResolver::new(Some(dir.path().to_path_buf())),
    );
    let scheduler = JobScheduler::new(
        Arc::new(dispatcher()),
        handler,
        SchedulerConfig::default(),
    );
    let id = scheduler
        .add_job(
            NewJob::new("quotes", vec![format!("{}/quotes", server.uri())], Schedule::Once)
                .with_schema("quotes")
                .with_exporter(out.to_str().unwrap()),
        )
        .unwrap();

    let reports = scheduler.run_due(Utc::now()).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Succeeded, "{:?}", reports[0].error);
    assert_eq!(scheduler.get_job(id).unwrap().state, JobState::Succeeded);

    let csv = std::fs::read_to_string(&out).unwrap();
    let mut lines = csv.lines();
    assert_eq!(
        lines.next().unwrap(),
        "url,scraped_at,content_hash,first_author,texts"
    );
    let row = lines.next().unwrap();
    assert!(row.contains("JOBS"));
    assert!(row.contains("Stay hungry"));
    assert!(lines.next().is_none());
}

#[tokio::test]
async fn failing_url_fails_the_run_without_export() {
    let server = server_with_robots().await;
    Mock::given(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
        .mount(&server)
        .await;
    Mock::given(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.json");
    let handler = ExtractExportHandler::new(
        CssExtractor::new(),
        FileExporter::new(),
        SchemaResolver::default(),
    );
    let scheduler = JobScheduler::new(
        Arc::new(dispatcher()),
        handler,
        SchedulerConfig::default(),
    );
    let id = scheduler
        .add_job(
            NewJob::new(
                "mixed",
                vec![format!("{}/ok", server.uri()), format!("{}/gone", server.uri())],
                Schedule::Once,
            )
            .with_exporter(out.to_str().unwrap()),
        )
        .unwrap();

    let report = scheduler.run_job_now(id).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_urls(), vec![format!("{}/gone", server.uri())]);
    assert!(!out.exists());
}
