use std::sync::Arc;
use std::time::Duration;

use synthex_core::inference::mock::{MockInference, MockReply};
use synthex_core::{
    ExtractionFailure, ExtractionOptions, ExtractionOrchestrator, PageImage, PagePolicy, Paper,
    ParseFailure, parser,
};
use tokio_util::sync::CancellationToken;

const CHATTY_REPLY: &str = "<think>Table 1 lists the reagents, so I will use it.</think>
Here is the extracted protocol:
```json
{
  \"target_material\": \"MOF-5\",
  \"method_type\": \"Solvothermal\",
  \"precursors\": [
    {\"name\": \"Zn(NO3)2·6H2O\", \"role\": \"metal source\", \"amount\": \"1.2 mmol\"},
    {\"name\": \"H2BDC\", \"role\": \"linker\"}
  ],
  \"conditions\": [{\"parameter\": \"temperature\", \"value\": 100, \"unit\": \"°C\"}],
  \"description\": \"Heated in DMF for 24 h.\",
  \"visual_evidence\": \"Table 1\"
}
```
Let me know if you need anything else.";

fn options() -> ExtractionOptions {
    ExtractionOptions {
        max_pages: 5,
        pages_per_request: 1,
        page_policy: PagePolicy::FirstValid,
        inference_timeout: Duration::from_secs(10),
        max_retries: 0,
        retry_delay: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn model_chatter_around_json_still_yields_a_record() {
    let mock = Arc::new(MockInference::with_sequence(vec![
        MockReply::text("```json\n{\"target_material\": \"unknown\", \"method_type\": \"n/a\"}\n```"),
        MockReply::text(CHATTY_REPLY),
    ]));
    let orch = ExtractionOrchestrator::new(mock.clone(), options(), CancellationToken::new());
    let paper = Paper::new("arXiv:1234.5678").with_title("MOF-5 from zinc nitrate");
    let pages: Vec<PageImage> = (1..=4).map(|n| PageImage::new(n, vec![0x89, n as u8])).collect();

    let record = orch.extract(&paper, &pages).await.unwrap();

    assert_eq!(mock.call_count(), 2);
    assert_eq!(record.source_pages, vec![2]);

    let ext = &record.extraction;
    assert_eq!(ext.target_material, "MOF-5");
    assert_eq!(ext.method_type, "Solvothermal");
    assert_eq!(ext.precursors.len(), 2);
    assert_eq!(ext.precursors[0].amount.as_deref(), Some("1.2 mmol"));
    assert_eq!(ext.conditions[0].parameter_name, "temperature");
    assert_eq!(ext.conditions[0].value, "100");
    assert_eq!(ext.notes.as_deref(), Some("Heated in DMF for 24 h."));
    assert_eq!(ext.visual_evidence.as_deref(), Some("Table 1"));

    // The canonical form parses back to the same extraction.
    assert_eq!(&parser::parse(&ext.to_canonical_json()).unwrap(), ext);

    let first = &mock.requests()[0];
    assert!(first.system_prompt.contains("TABLES"));
    assert!(first.user_prompt.contains("MOF-5 from zinc nitrate"));
    assert_eq!(first.images.len(), 1);
}

#[tokio::test]
async fn placeholder_only_replies_exhaust_the_window() {
    let mock = Arc::new(MockInference::new(MockReply::text(
        r#"{"target_material": "", "method_type": ""}"#,
    )));
    let orch = ExtractionOrchestrator::new(mock.clone(), options(), CancellationToken::new());
    let pages: Vec<PageImage> = (1..=7).map(|n| PageImage::new(n, vec![n as u8])).collect();

    let err = orch
        .extract(&Paper::new("file://empty.pdf"), &pages)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ExtractionFailure::NoValidExtraction {
            pages_tried: 5,
            last_failure: Some(ParseFailure::MissingRequiredField("target_material")),
        }
    );
    assert_eq!(mock.call_count(), 5);
}
